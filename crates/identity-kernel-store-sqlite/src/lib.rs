use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Context, Result};
use identity_kernel_core::{
    ApprovalStatus, IdentityKernel, IdentitySnapshot, KernelSpec, ManagerError, NextSnapshot,
    PredicateRegistry, SnapshotStore, StoreError,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS identity_snapshots (
  owner_id TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1),
  created_at TEXT NOT NULL,
  approval_status TEXT NOT NULL CHECK (approval_status IN ('auto','reviewed','user_approved','system_rollback')),
  reflection TEXT NOT NULL,
  kernel_json TEXT NOT NULL,
  kernel_digest TEXT NOT NULL,
  PRIMARY KEY (owner_id, version)
);

CREATE INDEX IF NOT EXISTS idx_identity_snapshots_created_at ON identity_snapshots(created_at);
";

const SELECT_SNAPSHOT_COLUMNS: &str = "SELECT
    owner_id, version, created_at, approval_status, reflection, kernel_json, kernel_digest
 FROM identity_snapshots";

/// `SQLite`-backed [`SnapshotStore`]. One connection, guarded by a mutex.
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
    registry: PredicateRegistry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DigestMismatch {
    pub owner_id: String,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub snapshot_rows: usize,
    pub digest_mismatches: Vec<DigestMismatch>,
    pub schema_status: SchemaStatus,
}

/// A stored row that cannot be turned back into a snapshot.
#[derive(Debug, thiserror::Error)]
#[error("owner {owner_id} version {version}: {reason}")]
struct CorruptRow {
    owner_id: String,
    version: i64,
    reason: String,
}

struct SnapshotRow {
    owner_id: String,
    version: i64,
    created_at: String,
    approval_status: String,
    reflection: String,
    kernel_json: String,
    kernel_digest: String,
}

impl SnapshotRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            owner_id: row.get(0)?,
            version: row.get(1)?,
            created_at: row.get(2)?,
            approval_status: row.get(3)?,
            reflection: row.get(4)?,
            kernel_json: row.get(5)?,
            kernel_digest: row.get(6)?,
        })
    }

    fn corrupt(&self, reason: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(CorruptRow {
            owner_id: self.owner_id.clone(),
            version: self.version,
            reason: reason.into(),
        })
    }

    fn digest_matches(&self) -> bool {
        kernel_digest(&self.kernel_json) == self.kernel_digest
    }

    fn into_snapshot(self, registry: &PredicateRegistry) -> Result<IdentitySnapshot> {
        if !self.digest_matches() {
            return Err(self.corrupt("kernel_digest does not match kernel_json"));
        }

        let version = u32::try_from(self.version)
            .ok()
            .filter(|version| *version >= 1)
            .ok_or_else(|| self.corrupt("version out of range"))?;
        let approval_status = ApprovalStatus::parse(&self.approval_status).ok_or_else(|| {
            self.corrupt(format!("unknown approval_status: {}", self.approval_status))
        })?;
        let timestamp = parse_rfc3339(&self.created_at)
            .map_err(|err| self.corrupt(format!("{err:#}")))?;
        let spec: KernelSpec = serde_json::from_str(&self.kernel_json)
            .map_err(|err| self.corrupt(format!("invalid kernel_json: {err}")))?;
        let kernel = IdentityKernel::from_spec(&spec, registry)
            .map_err(|err| self.corrupt(format!("kernel no longer constructs: {err}")))?;

        Ok(IdentitySnapshot {
            kernel: Arc::new(kernel),
            version,
            timestamp,
            approval_status,
            reflection: self.reflection,
        })
    }
}

impl SqliteSnapshotStore {
    /// Open a `SQLite` snapshot store and configure required runtime pragmas.
    ///
    /// Predicate rules in stored kernels are resolved through `registry` when read back.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path, registry: PredicateRegistry) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn), registry })
    }

    /// Close the underlying connection, surfacing any error from the final flush.
    ///
    /// # Errors
    /// Returns an error when `SQLite` refuses to close the connection.
    pub fn close(self) -> Result<()> {
        let conn = self.conn.into_inner().unwrap_or_else(PoisonError::into_inner);
        conn.close().map_err(|(_, err)| err).context("failed to close sqlite connection")
    }

    #[must_use]
    pub fn registry(&self) -> &PredicateRegistry {
        &self.registry
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.conn();
        schema_status(&conn)
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when a migration step fails or the database is newer than supported.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.conn();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&conn)?;

        if version < 1 {
            let tx = conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            version = 1;
            tracing::info!(version, "applied identity snapshot schema migration");
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Load one owner's history, ascending by version.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read, or a stored row fails digest or
    /// kernel reconstruction checks.
    pub fn load_history(&self, owner_id: &str) -> Result<Vec<IdentitySnapshot>> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "{SELECT_SNAPSHOT_COLUMNS} WHERE owner_id = ?1 ORDER BY version ASC"
            ))?;
            let rows = stmt
                .query_map(params![owner_id], SnapshotRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .with_context(|| format!("failed to read history for owner {owner_id}"))?;
            rows
        };

        rows.into_iter().map(|row| row.into_snapshot(&self.registry)).collect()
    }

    /// Load only the highest-version snapshot for `owner_id`.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or fails reconstruction checks.
    pub fn load_latest(&self, owner_id: &str) -> Result<Option<IdentitySnapshot>> {
        let row = {
            let conn = self.conn();
            select_latest(&conn, owner_id)?
        };

        row.map(|row| row.into_snapshot(&self.registry)).transpose()
    }

    /// Replace one owner's history inside a single immediate transaction.
    ///
    /// # Errors
    /// Returns an error when the history is not strictly ascending, a kernel cannot be
    /// serialized, or any write in the transaction fails.
    pub fn write_history(&self, owner_id: &str, history: &[IdentitySnapshot]) -> Result<()> {
        if owner_id.trim().is_empty() {
            return Err(anyhow!("owner_id MUST be non-empty"));
        }
        if history.iter().any(|snapshot| snapshot.version == 0) {
            return Err(anyhow!("version MUST be >= 1 for stored snapshots"));
        }
        if !history.windows(2).all(|pair| pair[0].version < pair[1].version) {
            return Err(anyhow!("history MUST be strictly ascending by version"));
        }

        let encoded = history.iter().map(encode_kernel).collect::<Result<Vec<_>>>()?;

        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start transaction")?;
        tx.execute("DELETE FROM identity_snapshots WHERE owner_id = ?1", params![owner_id])
            .context("failed to clear previous history")?;

        for (snapshot, kernel_json) in history.iter().zip(&encoded) {
            insert_snapshot(&tx, owner_id, snapshot, kernel_json)?;
        }

        tx.commit().context("failed to commit history transaction")?;
        Ok(())
    }

    /// Read the latest snapshot, build the next one and store it, pruning versions that fall
    /// outside `history_cap`, all inside one immediate transaction.
    ///
    /// The write lock is taken before the read, so concurrent appends from other
    /// connections or processes queue behind this one and always see its result.
    ///
    /// # Errors
    /// Returns the error raised by `next`, or [`ManagerError::Store`] when the latest row
    /// is corrupt, the new kernel cannot be encoded, or any statement fails.
    pub fn append_snapshot(
        &self,
        owner_id: &str,
        history_cap: usize,
        next: &NextSnapshot<'_>,
    ) -> Result<IdentitySnapshot, ManagerError> {
        if owner_id.trim().is_empty() {
            return Err(StoreError::Rejected("owner_id MUST be non-empty".to_string()).into());
        }

        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start append transaction")
            .map_err(|err| store_error(&err))?;

        let latest = select_latest(&tx, owner_id)
            .and_then(|row| row.map(|row| row.into_snapshot(&self.registry)).transpose())
            .map_err(|err| store_error(&err))?;
        let snapshot = next(latest.as_ref())?;
        if snapshot.version == 0 {
            return Err(StoreError::Rejected(
                "version MUST be >= 1 for stored snapshots".to_string(),
            )
            .into());
        }
        let kernel_json = encode_kernel(&snapshot)
            .map_err(|err| StoreError::Rejected(format!("{err:#}")))?;

        insert_snapshot(&tx, owner_id, &snapshot, &kernel_json)
            .map_err(|err| store_error(&err))?;
        let evicted = prune_history(&tx, owner_id, snapshot.version, history_cap)
            .map_err(|err| store_error(&err))?;
        tx.commit()
            .context("failed to commit append transaction")
            .map_err(|err| store_error(&err))?;

        if evicted > 0 {
            tracing::debug!(owner_id, evicted, "rotated identity history");
        }
        Ok(snapshot)
    }

    /// Owners with at least one stored snapshot, sorted.
    ///
    /// # Errors
    /// Returns an error when the owner list cannot be read.
    pub fn list_owners(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT DISTINCT owner_id FROM identity_snapshots ORDER BY owner_id ASC")?;
        let owners = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to list owners")?;
        Ok(owners)
    }

    /// Run `PRAGMA quick_check` and verify every stored kernel digest.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let conn = self.conn();
        let quick_check_message: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = conn
            .prepare(&format!("{SELECT_SNAPSHOT_COLUMNS} ORDER BY owner_id ASC, version ASC"))?;
        let rows = stmt.query_map([], SnapshotRow::from_row)?;

        let mut snapshot_rows = 0;
        let mut digest_mismatches = Vec::new();
        for row in rows {
            let row = row?;
            snapshot_rows += 1;
            if !row.digest_matches() {
                digest_mismatches.push(DigestMismatch {
                    owner_id: row.owner_id,
                    version: u32::try_from(row.version).unwrap_or(u32::MAX),
                });
            }
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            snapshot_rows,
            digest_mismatches,
            schema_status: schema_status(&conn)?,
        })
    }
}

fn store_error(err: &anyhow::Error) -> StoreError {
    let message = format!("{err:#}");
    if err.downcast_ref::<CorruptRow>().is_some() {
        StoreError::Corrupt(message)
    } else {
        StoreError::Unavailable(message)
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn read_history(&self, owner_id: &str) -> Result<Vec<IdentitySnapshot>, StoreError> {
        self.load_history(owner_id).map_err(|err| store_error(&err))
    }

    fn replace_history(
        &self,
        owner_id: &str,
        history: Vec<IdentitySnapshot>,
    ) -> Result<(), StoreError> {
        if let Some(snapshot) = history.iter().find(|snapshot| snapshot.kernel.to_spec().is_err()) {
            return Err(StoreError::Rejected(format!(
                "kernel for version {} holds an unnamed predicate",
                snapshot.version
            )));
        }
        self.write_history(owner_id, &history).map_err(|err| store_error(&err))
    }

    fn latest(&self, owner_id: &str) -> Result<Option<IdentitySnapshot>, StoreError> {
        self.load_latest(owner_id).map_err(|err| store_error(&err))
    }

    fn append_rotated(
        &self,
        owner_id: &str,
        history_cap: usize,
        next: &NextSnapshot<'_>,
    ) -> Result<IdentitySnapshot, ManagerError> {
        self.append_snapshot(owner_id, history_cap, next)
    }
}

impl std::fmt::Debug for SqliteSnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSnapshotStore")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn select_latest(conn: &Connection, owner_id: &str) -> Result<Option<SnapshotRow>> {
    conn.query_row(
        &format!("{SELECT_SNAPSHOT_COLUMNS} WHERE owner_id = ?1 ORDER BY version DESC LIMIT 1"),
        params![owner_id],
        SnapshotRow::from_row,
    )
    .optional()
    .with_context(|| format!("failed to read latest snapshot for owner {owner_id}"))
}

fn encode_kernel(snapshot: &IdentitySnapshot) -> Result<String> {
    let spec = snapshot
        .kernel
        .to_spec()
        .with_context(|| format!("failed to encode kernel for version {}", snapshot.version))?;
    serde_json::to_string(&spec).context("failed to serialize kernel")
}

fn insert_snapshot(
    conn: &Connection,
    owner_id: &str,
    snapshot: &IdentitySnapshot,
    kernel_json: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO identity_snapshots(
            owner_id, version, created_at, approval_status, reflection,
            kernel_json, kernel_digest
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            owner_id,
            i64::from(snapshot.version),
            rfc3339(snapshot.timestamp)?,
            snapshot.approval_status.as_str(),
            snapshot.reflection,
            kernel_json,
            kernel_digest(kernel_json),
        ],
    )
    .with_context(|| format!("failed to insert identity snapshot version {}", snapshot.version))?;
    Ok(())
}

/// Delete every version older than the newest `history_cap` ending at `latest_version`.
fn prune_history(
    conn: &Connection,
    owner_id: &str,
    latest_version: u32,
    history_cap: usize,
) -> Result<usize> {
    let cap = i64::try_from(history_cap).unwrap_or(i64::MAX);
    let cutoff = i64::from(latest_version).saturating_sub(cap);
    conn.execute(
        "DELETE FROM identity_snapshots WHERE owner_id = ?1 AND version <= ?2",
        params![owner_id, cutoff],
    )
    .context("failed to prune identity history")
}

fn schema_status(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let current_version = current_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn kernel_digest(kernel_json: &str) -> String {
    format!("sha256:{:x}", Sha256::digest(kernel_json.as_bytes()))
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
