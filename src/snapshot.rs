//! Immutable view of the definitions file.
use std::collections::HashMap;

use chrono::Utc;

use crate::{
    definitions::{ExperimentDefinition, ExperimentKind, HoldoutGroup, MutexGroup, Timestamp},
    parser::{self, DefinitionWarning},
    Result,
};

/// An immutable, fully validated set of experiment definitions.
///
/// `Snapshot` is never modified in place. A refresh builds a new snapshot and replaces the old one
/// as a whole, so a single decision always observes one consistent version.
#[derive(Debug)]
pub struct Snapshot {
    experiments: HashMap<String, ExperimentDefinition>,
    mutex_groups: HashMap<String, MutexGroup>,
    warnings: Vec<DefinitionWarning>,
    pub(crate) version: u64,
    loaded_at: Timestamp,
    source_hash: [u8; 16],
}

impl Snapshot {
    pub(crate) fn new(
        experiments: HashMap<String, ExperimentDefinition>,
        mutex_groups: HashMap<String, MutexGroup>,
        warnings: Vec<DefinitionWarning>,
        source_hash: [u8; 16],
    ) -> Snapshot {
        Snapshot {
            experiments,
            mutex_groups,
            warnings,
            version: 0,
            loaded_at: Utc::now(),
            source_hash,
        }
    }

    /// Create a snapshot without any definitions.
    pub fn empty() -> Snapshot {
        Snapshot::new(HashMap::new(), HashMap::new(), Vec::new(), [0; 16])
    }

    /// Parse a definitions document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigParse`](crate::Error::ConfigParse) if `bytes` is not a JSON object.
    /// Individual invalid entries do not fail the load; they are listed in
    /// [`Snapshot::warnings`].
    ///
    /// # Examples
    /// ```
    /// # use decider::Snapshot;
    /// let snapshot = Snapshot::from_json(br#"{
    ///     "foo": {"type": "simple", "variants": [{"name": "bar", "size": 0.5}]},
    ///     "broken": {"type": "simple", "variants": [{"name": "bar", "size": 1.5}]}
    /// }"#).unwrap();
    /// assert!(snapshot.get("foo").is_some());
    /// assert!(snapshot.get("broken").is_none());
    /// assert_eq!(snapshot.warnings().len(), 1);
    /// ```
    pub fn from_json(bytes: &[u8]) -> Result<Snapshot> {
        parser::parse(bytes)
    }

    /// Look up an entry by name. Mutex groups are not entries; see [`Snapshot::mutex_group`].
    pub fn get(&self, name: &str) -> Option<&ExperimentDefinition> {
        self.experiments.get(name)
    }

    /// Look up a holdout group by name.
    pub fn holdout(&self, name: &str) -> Option<&HoldoutGroup> {
        match &self.experiments.get(name)?.kind {
            ExperimentKind::Holdout(holdout) => Some(holdout),
            _ => None,
        }
    }

    /// Look up a mutex group by name.
    pub fn mutex_group(&self, name: &str) -> Option<&MutexGroup> {
        self.mutex_groups.get(name)
    }

    /// Iterate over all entries in unspecified order.
    pub fn experiments(&self) -> impl Iterator<Item = &ExperimentDefinition> {
        self.experiments.values()
    }

    /// Number of entries, mutex groups excluded.
    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    /// Return `true` if the snapshot has no entries.
    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    /// Entries dropped while parsing.
    pub fn warnings(&self) -> &[DefinitionWarning] {
        &self.warnings
    }

    /// Version assigned when the snapshot was published. Increases with every published snapshot
    /// of the same [`Decider`](crate::Decider). Unpublished snapshots have version 0.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// When the snapshot was built.
    pub fn loaded_at(&self) -> Timestamp {
        self.loaded_at
    }

    /// md5 of the raw document the snapshot was parsed from.
    pub fn source_hash(&self) -> &[u8; 16] {
        &self.source_hash
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot::empty()
    }
}
