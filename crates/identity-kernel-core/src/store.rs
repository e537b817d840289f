use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::manager::ManagerError;
use crate::snapshot::IdentitySnapshot;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
    #[error("snapshot store data is corrupt: {0}")]
    Corrupt(String),
    #[error("snapshot store rejected write: {0}")]
    Rejected(String),
}

/// Builds the next snapshot from the owner's current latest one, if any.
pub type NextSnapshot<'a> =
    dyn Fn(Option<&IdentitySnapshot>) -> Result<IdentitySnapshot, ManagerError> + 'a;

/// Owner-keyed snapshot histories.
///
/// `replace_history` MUST be atomic with respect to concurrent reads and other
/// replaces of the same owner: readers see either the old or the new history,
/// never a mix.
pub trait SnapshotStore: Send + Sync {
    /// Snapshots for `owner_id`, ascending by version. Unknown owners yield an empty history.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the backend cannot be read.
    fn read_history(&self, owner_id: &str) -> Result<Vec<IdentitySnapshot>, StoreError>;

    /// Replace the whole history for `owner_id`.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the backend rejects or fails the write.
    fn replace_history(
        &self,
        owner_id: &str,
        history: Vec<IdentitySnapshot>,
    ) -> Result<(), StoreError>;

    /// Highest-version snapshot for `owner_id`, if any.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the backend cannot be read.
    fn latest(&self, owner_id: &str) -> Result<Option<IdentitySnapshot>, StoreError> {
        Ok(self.read_history(owner_id)?.pop())
    }

    /// Append the snapshot built by `next` and keep only the newest `history_cap` entries.
    ///
    /// The default reads then replaces, so it is only as atomic as the caller's locking.
    /// Stores shared between processes or managers MUST override it so that reading the
    /// latest snapshot and writing the new one happen as one unit.
    ///
    /// # Errors
    /// Returns the error raised by `next`, or [`ManagerError::Store`] when the backend fails.
    fn append_rotated(
        &self,
        owner_id: &str,
        history_cap: usize,
        next: &NextSnapshot<'_>,
    ) -> Result<IdentitySnapshot, ManagerError> {
        let mut history = self.read_history(owner_id)?;
        let snapshot = next(history.last())?;
        history.push(snapshot.clone());
        rotate(owner_id, &mut history, history_cap);
        self.replace_history(owner_id, history)?;
        Ok(snapshot)
    }
}

fn rotate(owner_id: &str, history: &mut Vec<IdentitySnapshot>, history_cap: usize) {
    if history.len() > history_cap {
        let evicted = history.len() - history_cap;
        history.drain(..evicted);
        tracing::debug!(owner_id, evicted, "rotated identity history");
    }
}

impl<S> SnapshotStore for Arc<S>
where
    S: SnapshotStore + ?Sized,
{
    fn read_history(&self, owner_id: &str) -> Result<Vec<IdentitySnapshot>, StoreError> {
        (**self).read_history(owner_id)
    }

    fn replace_history(
        &self,
        owner_id: &str,
        history: Vec<IdentitySnapshot>,
    ) -> Result<(), StoreError> {
        (**self).replace_history(owner_id, history)
    }

    fn latest(&self, owner_id: &str) -> Result<Option<IdentitySnapshot>, StoreError> {
        (**self).latest(owner_id)
    }

    fn append_rotated(
        &self,
        owner_id: &str,
        history_cap: usize,
        next: &NextSnapshot<'_>,
    ) -> Result<IdentitySnapshot, ManagerError> {
        (**self).append_rotated(owner_id, history_cap, next)
    }
}

/// Process-local store. Histories are swapped whole under a write lock.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    histories: RwLock<HashMap<String, Arc<[IdentitySnapshot]>>>,
}

impl InMemorySnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn owners(&self) -> Vec<String> {
        let histories = self.histories.read().unwrap_or_else(PoisonError::into_inner);
        let mut owners = histories.keys().cloned().collect::<Vec<_>>();
        owners.sort_unstable();
        owners
    }

    fn history_handle(&self, owner_id: &str) -> Option<Arc<[IdentitySnapshot]>> {
        let histories = self.histories.read().unwrap_or_else(PoisonError::into_inner);
        histories.get(owner_id).cloned()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn read_history(&self, owner_id: &str) -> Result<Vec<IdentitySnapshot>, StoreError> {
        Ok(self.history_handle(owner_id).map(|history| history.to_vec()).unwrap_or_default())
    }

    fn replace_history(
        &self,
        owner_id: &str,
        history: Vec<IdentitySnapshot>,
    ) -> Result<(), StoreError> {
        let mut histories = self.histories.write().unwrap_or_else(PoisonError::into_inner);
        histories.insert(owner_id.to_string(), Arc::from(history));
        Ok(())
    }

    fn latest(&self, owner_id: &str) -> Result<Option<IdentitySnapshot>, StoreError> {
        Ok(self.history_handle(owner_id).and_then(|history| history.last().cloned()))
    }

    fn append_rotated(
        &self,
        owner_id: &str,
        history_cap: usize,
        next: &NextSnapshot<'_>,
    ) -> Result<IdentitySnapshot, ManagerError> {
        let mut histories = self.histories.write().unwrap_or_else(PoisonError::into_inner);
        let mut history =
            histories.get(owner_id).map(|history| history.to_vec()).unwrap_or_default();
        let snapshot = next(history.last())?;
        history.push(snapshot.clone());
        rotate(owner_id, &mut history, history_cap);
        histories.insert(owner_id.to_string(), Arc::from(history));
        Ok(snapshot)
    }
}
