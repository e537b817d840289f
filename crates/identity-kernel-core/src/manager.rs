use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::kernel::{IdentityKernel, KernelError};
use crate::snapshot::{fallback_snapshot, ApprovalStatus, IdentitySnapshot};
use crate::store::{InMemorySnapshotStore, SnapshotStore, StoreError};

pub const DEFAULT_HISTORY_CAP: usize = 20;

/// Manager settings. `history_cap` is always at least 1, including when deserialized.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(try_from = "RawManagerConfig")]
pub struct ManagerConfig {
    history_cap: usize,
}

#[derive(Deserialize)]
struct RawManagerConfig {
    history_cap: usize,
}

impl TryFrom<RawManagerConfig> for ManagerConfig {
    type Error = KernelError;

    fn try_from(raw: RawManagerConfig) -> Result<Self, Self::Error> {
        Self::new(raw.history_cap)
    }
}

impl ManagerConfig {
    /// # Errors
    /// Returns [`KernelError::Validation`] when `history_cap` is zero.
    pub fn new(history_cap: usize) -> Result<Self, KernelError> {
        if history_cap == 0 {
            return Err(KernelError::Validation("history_cap MUST be >= 1".to_string()));
        }
        Ok(Self { history_cap })
    }

    #[must_use]
    pub fn history_cap(self) -> usize {
        self.history_cap
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { history_cap: DEFAULT_HISTORY_CAP }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("version sequence exhausted for owner {owner_id}")]
    VersionOverflow { owner_id: String },
}

/// Owns per-owner snapshot histories: assigns versions, rotates old revisions
/// out, and falls back to the shared baseline identity for unknown owners.
///
/// Commits for one owner are serialized by that owner's lock; commits for
/// different owners never wait on each other. Stores that override
/// [`SnapshotStore::append_rotated`] also serialize commits made by other
/// managers or processes sharing the same backend.
#[derive(Debug)]
pub struct IdentityManager<S = InMemorySnapshotStore> {
    store: S,
    config: ManagerConfig,
    owner_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IdentityManager<InMemorySnapshotStore> {
    #[must_use]
    pub fn in_memory(config: ManagerConfig) -> Self {
        Self::new(InMemorySnapshotStore::new(), config)
    }
}

impl<S> IdentityManager<S>
where
    S: SnapshotStore,
{
    #[must_use]
    pub fn new(store: S, config: ManagerConfig) -> Self {
        Self { store, config, owner_locks: Mutex::new(HashMap::new()) }
    }

    #[must_use]
    pub fn config(&self) -> ManagerConfig {
        self.config
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Release the manager and hand back its store, e.g. to close a connection.
    #[must_use]
    pub fn into_store(self) -> S {
        self.store
    }

    /// Latest snapshot for `owner_id`, or the fallback identity when it has none.
    ///
    /// # Errors
    /// Returns [`ManagerError::Store`] when the backing store cannot be read.
    pub fn get_latest(&self, owner_id: &str) -> Result<IdentitySnapshot, ManagerError> {
        match self.store.latest(owner_id)? {
            Some(snapshot) => Ok(snapshot),
            None => Ok(fallback_snapshot().clone()),
        }
    }

    /// Like [`Self::get_latest`], but a store failure also degrades to the fallback.
    #[must_use]
    pub fn latest_or_fallback(&self, owner_id: &str) -> IdentitySnapshot {
        self.get_latest(owner_id).unwrap_or_else(|err| {
            tracing::error!(owner_id, error = %err, "failed to load identity; using fallback");
            fallback_snapshot().clone()
        })
    }

    /// # Errors
    /// Returns [`ManagerError::Store`] when the backing store cannot be read.
    pub fn history(&self, owner_id: &str) -> Result<Vec<IdentitySnapshot>, ManagerError> {
        Ok(self.store.read_history(owner_id)?)
    }

    /// Append a new revision for `owner_id` and rotate the history down to the cap.
    ///
    /// # Errors
    /// Returns [`ManagerError::Store`] when the history cannot be read or replaced, or
    /// [`ManagerError::VersionOverflow`] when the owner's version counter is exhausted.
    pub fn commit_new_snapshot(
        &self,
        owner_id: &str,
        kernel: impl Into<Arc<IdentityKernel>>,
        reflection: impl Into<String>,
        status: ApprovalStatus,
    ) -> Result<IdentitySnapshot, ManagerError> {
        let kernel = kernel.into();
        let reflection = reflection.into();
        let next = |last: Option<&IdentitySnapshot>| -> Result<IdentitySnapshot, ManagerError> {
            let (version, timestamp) = match last {
                Some(last) => {
                    let version = last.version.checked_add(1).ok_or_else(|| {
                        ManagerError::VersionOverflow { owner_id: owner_id.to_string() }
                    })?;
                    (version, OffsetDateTime::now_utc().max(last.timestamp))
                }
                None => (1, OffsetDateTime::now_utc()),
            };
            Ok(IdentitySnapshot {
                kernel: Arc::clone(&kernel),
                version,
                timestamp,
                approval_status: status,
                reflection: reflection.clone(),
            })
        };

        let owner_lock = self.owner_lock(owner_id);
        let committed = {
            let _guard = owner_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.store.append_rotated(owner_id, self.config.history_cap, &next)
        };
        self.release_owner_lock(owner_id, owner_lock);

        let snapshot = committed?;
        tracing::debug!(
            owner_id,
            version = snapshot.version,
            status = status.as_str(),
            "committed identity snapshot"
        );
        Ok(snapshot)
    }

    fn owner_lock(&self, owner_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.owner_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(owner_id.to_string()).or_default())
    }

    /// Drop this commit's handle and forget the owner's lock once no other commit holds it.
    fn release_owner_lock(&self, owner_id: &str, owner_lock: Arc<Mutex<()>>) {
        let mut locks = self.owner_locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(owner_lock);
        if locks.get(owner_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(owner_id);
        }
    }

    #[cfg(test)]
    fn tracked_owner_locks(&self) -> usize {
        self.owner_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use proptest::prelude::*;

    use super::*;
    use crate::kernel::InvariantRule;

    fn kernel(name: &str) -> IdentityKernel {
        IdentityKernel {
            name: name.to_string(),
            role: "tutor".to_string(),
            core_values: vec!["patience".to_string()],
            communication_style: "warm".to_string(),
            expertise_domains: vec!["math".to_string()],
            invariants: vec![InvariantRule::contains_not("p1", "illegal")],
        }
    }

    fn commit(manager: &IdentityManager, owner_id: &str, reflection: &str) -> IdentitySnapshot {
        match manager.commit_new_snapshot(owner_id, kernel("Guide"), reflection, ApprovalStatus::Auto)
        {
            Ok(snapshot) => snapshot,
            Err(err) => panic!("commit should succeed: {err}"),
        }
    }

    fn config(history_cap: usize) -> ManagerConfig {
        match ManagerConfig::new(history_cap) {
            Ok(config) => config,
            Err(err) => panic!("history cap should be valid: {err}"),
        }
    }

    fn versions<S: SnapshotStore>(manager: &IdentityManager<S>, owner_id: &str) -> Vec<u32> {
        match manager.history(owner_id) {
            Ok(history) => history.iter().map(|snapshot| snapshot.version).collect(),
            Err(err) => panic!("history should load: {err}"),
        }
    }

    #[test]
    fn fresh_owner_gets_fallback() -> Result<(), ManagerError> {
        let manager = IdentityManager::in_memory(ManagerConfig::default());
        let latest = manager.get_latest("u1")?;
        assert_eq!(latest.version, 0);
        assert_eq!(latest.approval_status, ApprovalStatus::SystemRollback);
        assert!(manager.history("u1")?.is_empty());
        Ok(())
    }

    #[test]
    fn first_commit_is_version_one_and_becomes_latest() -> Result<(), ManagerError> {
        let manager = IdentityManager::in_memory(ManagerConfig::default());
        let snapshot = manager.commit_new_snapshot(
            "u1",
            kernel("Guide"),
            "initial kernel",
            ApprovalStatus::UserApproved,
        )?;
        assert_eq!(snapshot.version, 1);

        let latest = manager.get_latest("u1")?;
        assert_eq!(latest.version, 1);
        assert_eq!(latest.reflection, "initial kernel");
        assert_eq!(latest.approval_status, ApprovalStatus::UserApproved);
        assert!(Arc::ptr_eq(&latest.kernel, &snapshot.kernel));
        Ok(())
    }

    #[test]
    fn rotation_keeps_most_recent_twenty() {
        let manager = IdentityManager::in_memory(ManagerConfig::default());
        for index in 0..25 {
            let snapshot = commit(&manager, "u1", &format!("revision {index}"));
            assert_eq!(snapshot.version, index + 1);
        }
        assert_eq!(versions(&manager, "u1"), (6..=25).collect::<Vec<_>>());
    }

    #[test]
    fn owners_do_not_perturb_each_other() {
        let manager = IdentityManager::in_memory(config(3));
        for _ in 0..5 {
            commit(&manager, "a", "a revision");
        }
        commit(&manager, "b", "b revision");

        assert_eq!(versions(&manager, "a"), vec![3, 4, 5]);
        assert_eq!(versions(&manager, "b"), vec![1]);
    }

    #[test]
    fn timestamps_never_decrease() {
        let manager = IdentityManager::in_memory(ManagerConfig::default());
        for _ in 0..10 {
            commit(&manager, "u1", "tick");
        }
        let history = match manager.history("u1") {
            Ok(history) => history,
            Err(err) => panic!("history should load: {err}"),
        };
        assert!(history.windows(2).all(|pair| pair[0].timestamp <= pair[1].timestamp));
    }

    #[test]
    fn zero_cap_is_rejected() {
        assert!(matches!(ManagerConfig::new(0), Err(KernelError::Validation(_))));
        assert_eq!(ManagerConfig::new(5).map(ManagerConfig::history_cap), Ok(5));
    }

    #[test]
    fn deserialized_config_is_validated() {
        let zero = serde_json::from_str::<ManagerConfig>(r#"{"history_cap":0}"#);
        match zero {
            Ok(config) => panic!("zero cap should not deserialize: {config:?}"),
            Err(err) => assert!(err.to_string().contains("history_cap"), "{err}"),
        }

        let three = match serde_json::from_str::<ManagerConfig>(r#"{"history_cap":3}"#) {
            Ok(config) => config,
            Err(err) => panic!("valid cap should deserialize: {err}"),
        };
        assert_eq!(three.history_cap(), 3);
        assert_eq!(
            serde_json::to_value(three).ok(),
            Some(serde_json::json!({ "history_cap": 3 }))
        );
    }

    #[test]
    fn owner_locks_are_released_after_commits() {
        let manager = Arc::new(IdentityManager::in_memory(config(5)));
        let handles = (0..4)
            .map(|worker| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    for round in 0..20 {
                        commit(&manager, &format!("owner-{worker}-{round}"), "one-off");
                        commit(&manager, "shared", "contended");
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            if handle.join().is_err() {
                panic!("commit thread panicked");
            }
        }

        assert_eq!(manager.tracked_owner_locks(), 0);
        assert_eq!(versions(&manager, "shared"), vec![76, 77, 78, 79, 80]);
    }

    #[test]
    fn managers_sharing_a_store_never_duplicate_versions() {
        let store = Arc::new(InMemorySnapshotStore::new());
        let handles = (0..4)
            .map(|_| {
                let manager = IdentityManager::new(Arc::clone(&store), config(1_000));
                thread::spawn(move || {
                    (0..25)
                        .map(|_| {
                            match manager.commit_new_snapshot(
                                "u1",
                                kernel("Guide"),
                                "shared store",
                                ApprovalStatus::Auto,
                            ) {
                                Ok(snapshot) => snapshot.version,
                                Err(err) => panic!("commit should succeed: {err}"),
                            }
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut reported = Vec::new();
        for handle in handles {
            match handle.join() {
                Ok(versions) => reported.extend(versions),
                Err(_) => panic!("commit thread panicked"),
            }
        }
        reported.sort_unstable();
        assert_eq!(reported, (1..=100).collect::<Vec<u32>>());

        let stored = match store.read_history("u1") {
            Ok(history) => history.iter().map(|snapshot| snapshot.version).collect::<Vec<_>>(),
            Err(err) => panic!("history should load: {err}"),
        };
        assert_eq!(stored, (1..=100).collect::<Vec<u32>>());
    }

    #[test]
    fn cap_change_between_commits_trims_to_new_cap() -> Result<(), ManagerError> {
        let store = Arc::new(InMemorySnapshotStore::new());
        let wide = IdentityManager::new(Arc::clone(&store), config(10));
        for _ in 0..8 {
            wide.commit_new_snapshot("u1", kernel("Guide"), "wide", ApprovalStatus::Auto)?;
        }
        let narrow = IdentityManager::new(Arc::clone(&store), config(3));
        narrow.commit_new_snapshot("u1", kernel("Guide"), "narrow", ApprovalStatus::Auto)?;
        assert_eq!(versions(&narrow, "u1"), vec![7, 8, 9]);
        Ok(())
    }

    #[test]
    fn concurrent_commits_to_one_owner_never_duplicate_versions() {
        let manager = Arc::new(IdentityManager::in_memory(config(1_000)));
        let threads = 8;
        let commits_per_thread = 25;

        let handles = (0..threads)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    for _ in 0..commits_per_thread {
                        commit(&manager, "shared", "concurrent");
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            if handle.join().is_err() {
                panic!("commit thread panicked");
            }
        }

        let expected = (1..=u32::try_from(threads * commits_per_thread).unwrap_or(u32::MAX))
            .collect::<Vec<_>>();
        assert_eq!(versions(&manager, "shared"), expected);
    }

    #[test]
    fn readers_observe_consistent_histories_during_commits() {
        let manager = Arc::new(IdentityManager::in_memory(config(5)));
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let manager = Arc::clone(&manager);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let history = versions(&manager, "u1");
                    assert!(history.len() <= 5);
                    assert!(history.windows(2).all(|pair| pair[1] == pair[0] + 1));
                    let latest = match manager.get_latest("u1") {
                        Ok(latest) => latest,
                        Err(err) => panic!("latest should load: {err}"),
                    };
                    if let Some(last) = history.last() {
                        assert!(latest.version >= *last);
                    }
                }
            })
        };

        for _ in 0..200 {
            commit(&manager, "u1", "writer");
        }
        done.store(true, Ordering::Release);
        if reader.join().is_err() {
            panic!("reader thread panicked");
        }
        assert_eq!(versions(&manager, "u1"), vec![196, 197, 198, 199, 200]);
    }

    struct FailingStore;

    impl SnapshotStore for FailingStore {
        fn read_history(&self, _owner_id: &str) -> Result<Vec<IdentitySnapshot>, StoreError> {
            Err(StoreError::Unavailable("disk offline".to_string()))
        }

        fn replace_history(
            &self,
            _owner_id: &str,
            _history: Vec<IdentitySnapshot>,
        ) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk offline".to_string()))
        }
    }

    #[test]
    fn store_failures_surface_as_distinct_errors() {
        let manager = IdentityManager::new(FailingStore, ManagerConfig::default());

        let commit_result =
            manager.commit_new_snapshot("u1", kernel("Guide"), "blocked", ApprovalStatus::Auto);
        assert!(matches!(commit_result, Err(ManagerError::Store(StoreError::Unavailable(_)))));
        assert!(matches!(manager.get_latest("u1"), Err(ManagerError::Store(_))));

        let degraded = manager.latest_or_fallback("u1");
        assert!(degraded.is_fallback());
    }

    proptest! {
        #[test]
        fn property_versions_are_contiguous_and_capped(commits in 1_usize..60, cap in 1_usize..25) {
            let manager = IdentityManager::in_memory(config(cap));
            for index in 0..commits {
                let snapshot = commit(&manager, "owner", "property");
                prop_assert_eq!(snapshot.version as usize, index + 1);
            }

            let kept = versions(&manager, "owner");
            prop_assert_eq!(kept.len(), commits.min(cap));
            let first_kept = commits - commits.min(cap) + 1;
            let expected = (first_kept..=commits)
                .map(|version| u32::try_from(version).unwrap_or(u32::MAX))
                .collect::<Vec<_>>();
            prop_assert_eq!(kept, expected);
        }
    }
}
