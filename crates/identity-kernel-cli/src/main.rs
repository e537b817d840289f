use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use identity_kernel_core::{
    validate, ApprovalStatus, IdentityKernel, IdentityManager, IdentitySnapshot, KernelSpec,
    ManagerConfig, PredicateRegistry, DEFAULT_HISTORY_CAP,
};
use identity_kernel_store_sqlite::SqliteSnapshotStore;
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const VIOLATIONS_EXIT_CODE: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "ik")]
#[command(about = "Identity Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./identity_kernel.sqlite3")]
    db: PathBuf,

    /// Snapshots retained per owner.
    #[arg(long, default_value_t = DEFAULT_HISTORY_CAP)]
    history_cap: usize,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Kernel {
        #[command(subcommand)]
        command: KernelCommand,
    },
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
    Validate(ValidateArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum KernelCommand {
    Check(KernelCheckArgs),
}

#[derive(Debug, Args)]
struct KernelCheckArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    Commit(SnapshotCommitArgs),
    Latest(OwnerArgs),
    History(OwnerArgs),
    Owners,
}

#[derive(Debug, Args)]
struct SnapshotCommitArgs {
    #[arg(long)]
    owner: String,
    #[arg(long)]
    kernel_file: PathBuf,
    #[arg(long, default_value = "")]
    reflection: String,
    #[arg(long, value_enum, default_value_t = StatusArg::Auto)]
    status: StatusArg,
}

#[derive(Debug, Args)]
struct OwnerArgs {
    #[arg(long)]
    owner: String,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[arg(long)]
    owner: String,
    #[arg(long, conflicts_with = "text_file", required_unless_present = "text_file")]
    text: Option<String>,
    #[arg(long)]
    text_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Auto,
    Reviewed,
    UserApproved,
    SystemRollback,
}

impl From<StatusArg> for ApprovalStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Auto => Self::Auto,
            StatusArg::Reviewed => Self::Reviewed,
            StatusArg::UserApproved => Self::UserApproved,
            StatusArg::SystemRollback => Self::SystemRollback,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    if let Err(err) = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
    {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Db { command } => {
            let store = open_store(&cli.db)?;
            run_db(&command, &store)?;
            store.close()?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Kernel { command } => {
            run_kernel(&command)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Snapshot { command } => {
            let manager = open_manager(&cli.db, cli.history_cap)?;
            run_snapshot(command, &manager)?;
            manager.into_store().close()?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate(args) => {
            let manager = open_manager(&cli.db, cli.history_cap)?;
            let code = run_validate(&args, &manager)?;
            manager.into_store().close()?;
            Ok(code)
        }
    }
}

fn open_store(db: &Path) -> Result<SqliteSnapshotStore> {
    SqliteSnapshotStore::open(db, PredicateRegistry::with_builtins())
}

fn open_manager(db: &Path, history_cap: usize) -> Result<IdentityManager<SqliteSnapshotStore>> {
    let config = ManagerConfig::new(history_cap)?;
    let store = open_store(db)?;
    store.migrate()?;
    tracing::debug!(db = %db.display(), history_cap, "opened identity snapshot store");
    Ok(IdentityManager::new(store, config))
}

fn run_db(command: &DbCommand, store: &SqliteSnapshotStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteSnapshotStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &SqliteSnapshotStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_integrity_check(store: &SqliteSnapshotStore) -> Result<()> {
    store.migrate()?;
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn load_kernel(path: &Path, registry: &PredicateRegistry) -> Result<IdentityKernel> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read kernel file {}", path.display()))?;
    let spec = KernelSpec::from_json(&raw)
        .with_context(|| format!("invalid kernel document {}", path.display()))?;
    IdentityKernel::from_spec(&spec, registry)
        .with_context(|| format!("kernel in {} does not construct", path.display()))
}

fn run_kernel(command: &KernelCommand) -> Result<()> {
    match command {
        KernelCommand::Check(args) => {
            let registry = PredicateRegistry::with_builtins();
            let kernel = load_kernel(&args.file, &registry)?;
            emit_json(serde_json::json!({
                "rule_count": kernel.invariants.len(),
                "kernel": kernel.to_spec()?
            }))
        }
    }
}

fn snapshot_value(snapshot: &IdentitySnapshot) -> Result<Value> {
    let record = snapshot.to_record()?;
    serde_json::to_value(&record).context("failed to serialize snapshot")
}

fn run_snapshot(
    command: SnapshotCommand,
    manager: &IdentityManager<SqliteSnapshotStore>,
) -> Result<()> {
    match command {
        SnapshotCommand::Commit(args) => {
            let kernel = load_kernel(&args.kernel_file, manager.store().registry())?;
            let snapshot = manager.commit_new_snapshot(
                &args.owner,
                kernel,
                args.reflection,
                args.status.into(),
            )?;
            emit_json(serde_json::json!({
                "owner_id": args.owner,
                "history_cap": manager.config().history_cap(),
                "snapshot": snapshot_value(&snapshot)?
            }))
        }
        SnapshotCommand::Latest(args) => {
            let snapshot = manager.get_latest(&args.owner)?;
            emit_json(serde_json::json!({
                "owner_id": args.owner,
                "fallback": snapshot.is_fallback(),
                "snapshot": snapshot_value(&snapshot)?
            }))
        }
        SnapshotCommand::History(args) => {
            let snapshots = manager
                .history(&args.owner)?
                .iter()
                .map(snapshot_value)
                .collect::<Result<Vec<_>>>()?;
            emit_json(serde_json::json!({
                "owner_id": args.owner,
                "snapshots": snapshots
            }))
        }
        SnapshotCommand::Owners => {
            let owners = manager.store().list_owners()?;
            emit_json(serde_json::json!({ "owners": owners }))
        }
    }
}

fn run_validate(
    args: &ValidateArgs,
    manager: &IdentityManager<SqliteSnapshotStore>,
) -> Result<ExitCode> {
    let text = match (&args.text, &args.text_file) {
        (Some(text), None) => text.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("failed to read text file {}", path.display()))?,
        _ => return Err(anyhow!("exactly one of --text or --text-file is required")),
    };

    let snapshot = manager.get_latest(&args.owner)?;
    let report = validate(&text, &snapshot.kernel);
    let valid = report.valid;

    emit_json(serde_json::json!({
        "owner_id": args.owner,
        "snapshot_version": snapshot.version,
        "valid": report.valid,
        "violations": report.violations
    }))?;

    if valid {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(VIOLATIONS_EXIT_CODE))
    }
}
