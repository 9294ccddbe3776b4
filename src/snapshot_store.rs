//! A thread-safe in-memory storage for the currently served snapshot. [`SnapshotStore`] provides
//! concurrent access for readers (decisions) and the single writer (the refresh thread).
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use crate::Snapshot;

/// `SnapshotStore` provides a thread-safe (`Sync`) storage for the served [`Snapshot`].
///
/// `Snapshot` itself is always immutable and can only be replaced completely. Readers keep the
/// `Arc` they obtained for as long as they need it, so publishing never waits for in-flight
/// decisions.
pub struct SnapshotStore {
    snapshot: RwLock<Arc<Snapshot>>,
    next_version: AtomicU64,
}

impl SnapshotStore {
    /// Create a store serving an empty snapshot.
    pub fn new() -> Self {
        SnapshotStore {
            snapshot: RwLock::new(Arc::new(Snapshot::empty())),
            next_version: AtomicU64::new(1),
        }
    }

    /// Get the currently served snapshot.
    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        // A poisoned lock still holds a valid `Arc`: the writer only ever replaces it whole.
        let snapshot = self
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        Arc::clone(&snapshot)
    }

    /// Assign the next version to `snapshot` and make it the served snapshot.
    pub fn publish(&self, mut snapshot: Snapshot) -> Arc<Snapshot> {
        snapshot.version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let snapshot = Arc::new(snapshot);

        let mut slot = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Arc::clone(&snapshot);
        drop(slot);

        log::debug!(target: "decider",
                    version = snapshot.version(),
                    experiments = snapshot.len();
                    "published new snapshot");
        snapshot
    }
}

impl Default for SnapshotStore {
    fn default() -> Self {
        SnapshotStore::new()
    }
}
