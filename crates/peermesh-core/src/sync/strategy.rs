//! Pluggable version-vector comparison

use super::state::VersionVector;

/// Result of comparing the last vector seen from a peer with its current one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorDiff {
    /// Either side holds state the other lacks
    pub needs_update: bool,
    /// Replicas on which the peer is ahead of us
    pub missing_from_local: Vec<String>,
    /// Replicas on which we are ahead of the peer
    pub missing_from_remote: Vec<String>,
}

/// Decides what an exchange with a peer has to cover.
///
/// Implementations detect divergence only; merging the exchanged changes is
/// the application's business.
pub trait VectorStrategy: Send + Sync {
    fn compare(&self, local: &VersionVector, remote: &VersionVector) -> VectorDiff;
}

/// Per-replica counter comparison
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterStrategy;

impl VectorStrategy for CounterStrategy {
    fn compare(&self, local: &VersionVector, remote: &VersionVector) -> VectorDiff {
        let mut diff = VectorDiff::default();

        for (replica, theirs) in remote.iter() {
            if theirs > local.get(replica) {
                diff.missing_from_local.push(replica.to_string());
            }
        }
        for (replica, ours) in local.iter() {
            if ours > remote.get(replica) {
                diff.missing_from_remote.push(replica.to_string());
            }
        }

        diff.needs_update = !diff.missing_from_local.is_empty() || !diff.missing_from_remote.is_empty();
        diff
    }
}
