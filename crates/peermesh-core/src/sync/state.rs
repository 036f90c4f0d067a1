//! Persisted synchronization state

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::PeerId;

/// Per-replica counters observed from one peer
///
/// Keys are replica identifiers chosen by the application; values only ever
/// grow through [`VersionVector::merge`] and [`VersionVector::increment`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector(BTreeMap<String, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a replica (0 if absent)
    pub fn get(&self, replica: &str) -> u64 {
        self.0.get(replica).copied().unwrap_or(0)
    }

    /// Pointwise maximum with `other`
    pub fn merge(&mut self, other: &VersionVector) {
        for (replica, &theirs) in &other.0 {
            let ours = self.0.entry(replica.clone()).or_insert(0);
            *ours = (*ours).max(theirs);
        }
    }

    /// True if every counter here is at least the one in `other`
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other.0.iter().all(|(replica, &theirs)| self.get(replica) >= theirs)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, &v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Process-wide sync status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncState {
    /// Start time of the most recent pass
    pub last_sync: Option<i64>,
    pub sync_in_progress: bool,
    /// Locally modified item ids awaiting propagation
    pub pending_changes: BTreeSet<String>,
    /// Last vector observed from each peer
    pub version_vector: BTreeMap<PeerId, VersionVector>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_is_pointwise_max() {
        let mut a: VersionVector = [("x", 3), ("y", 1)].into_iter().collect();
        let b: VersionVector = [("y", 4), ("z", 2)].into_iter().collect();

        a.merge(&b);

        assert_eq!(a.get("x"), 3);
        assert_eq!(a.get("y"), 4);
        assert_eq!(a.get("z"), 2);
        assert!(a.dominates(&b));
    }

    #[test]
    fn test_state_serialization() {
        let mut state = SyncState::default();
        state.pending_changes.insert("doc-1".into());
        state.version_vector.insert(
            PeerId::from_public_key("a"),
            [("a", 2)].into_iter().collect(),
        );

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["syncInProgress"], false);
        assert_eq!(json["pendingChanges"][0], "doc-1");

        let back: SyncState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
