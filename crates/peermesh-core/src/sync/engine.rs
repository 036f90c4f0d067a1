//! Single-flight reconciliation of pending local changes
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  sync_with_peers(peers)                                         │
//! │  1. try_acquire the single pass slot (busy → warn, no-op)       │
//! │  2. syncInProgress = true, lastSync = now (guard clears it)     │
//! │  3. snapshot pendingChanges                                     │
//! │  4. for each peer, sequentially, under its cancellation token:  │
//! │     version_vector() → compare → exchange_changes() → merge     │
//! │  5. one exchange succeeded → drop the snapshot from pending     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{SyncState, VersionVector};
use super::strategy::{VectorDiff, VectorStrategy};
use crate::error::{MeshError, MeshResult};
use crate::events::{EventBus, NetworkEvent};
use crate::storage::Records;
use crate::types::{now_millis, PeerId};

/// A peer reachable for change exchange
#[async_trait]
pub trait SyncPeer: Send + Sync {
    fn peer_id(&self) -> &PeerId;

    /// The peer's current version vector
    async fn version_vector(&self) -> MeshResult<VersionVector>;

    /// Exchange changes covering `diff` plus our `pending` items.
    ///
    /// Returns the vector the peer holds once the exchange is done.
    async fn exchange_changes(
        &self,
        diff: &VectorDiff,
        pending: &BTreeSet<String>,
    ) -> MeshResult<VersionVector>;
}

/// Builds [`SyncPeer`]s for peers with an established link
pub trait SyncPeerProvider: Send + Sync {
    fn sync_peer(&self, peer_id: &PeerId) -> Option<Arc<dyn SyncPeer>>;
}

/// Outcome of one [`SyncEngine::sync_with_peers`] call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Another pass was in flight; nothing was done
    pub skipped: bool,
    pub synced: Vec<PeerId>,
    pub failed: Vec<PeerId>,
}

/// Owns [`SyncState`] and runs sync passes
pub struct SyncEngine {
    state: RwLock<SyncState>,
    pass_slot: Arc<Semaphore>,
    strategy: Arc<dyn VectorStrategy>,
    records: Records,
    exchange_timeout: Duration,
    events: EventBus,
    exchanges: Mutex<HashMap<PeerId, CancellationToken>>,
    /// Peers removed since the current pass started
    forgotten: Mutex<HashSet<PeerId>>,
}

/// Clears `syncInProgress` on every exit path, then frees the pass slot
struct PassGuard<'a> {
    engine: &'a SyncEngine,
    _slot: OwnedSemaphorePermit,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.engine.state.write();
        state.sync_in_progress = false;
        self.engine.persist(&state);
    }
}

impl SyncEngine {
    /// Restore state from the record store.
    ///
    /// A `syncInProgress` flag left behind by a crash is cleared.
    pub fn new(
        records: Records,
        strategy: Arc<dyn VectorStrategy>,
        exchange_timeout: Duration,
        events: EventBus,
    ) -> MeshResult<Self> {
        let mut state = records.load_sync_state()?.unwrap_or_default();
        if state.sync_in_progress {
            warn!("Clearing stale sync-in-progress flag");
            state.sync_in_progress = false;
            records.save_sync_state(&state)?;
        }
        Ok(Self {
            state: RwLock::new(state),
            pass_slot: Arc::new(Semaphore::new(1)),
            strategy,
            records,
            exchange_timeout,
            events,
            exchanges: Mutex::new(HashMap::new()),
            forgotten: Mutex::new(HashSet::new()),
        })
    }

    /// Snapshot of the current state
    pub fn state(&self) -> SyncState {
        self.state.read().clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.state.read().sync_in_progress
    }

    pub fn pending_changes(&self) -> BTreeSet<String> {
        self.state.read().pending_changes.clone()
    }

    /// Queue a locally modified item for propagation.
    ///
    /// Returns `false` if it was already pending.
    pub fn record_local_change(&self, item_id: impl Into<String>) -> MeshResult<bool> {
        let mut state = self.state.write();
        let inserted = state.pending_changes.insert(item_id.into());
        if inserted {
            self.records.save_sync_state(&state)?;
        }
        Ok(inserted)
    }

    /// Abort an in-flight exchange with this peer, if any
    pub fn cancel_peer(&self, peer_id: &PeerId) {
        if let Some(token) = self.exchanges.lock().get(peer_id) {
            debug!(peer_id = %peer_id.short(), "Cancelling sync exchange");
            token.cancel();
        }
    }

    /// Cancel any exchange and drop the vector recorded for a removed peer.
    ///
    /// A pass already under way skips the peer from here on and leaves it out
    /// of its report.
    pub fn forget_peer(&self, peer_id: &PeerId) {
        {
            let mut state = self.state.write();
            self.forgotten.lock().insert(peer_id.clone());
            if state.version_vector.remove(peer_id).is_some() {
                self.persist(&state);
            }
        }
        self.cancel_peer(peer_id);
    }

    fn is_forgotten(&self, peer_id: &PeerId) -> bool {
        self.forgotten.lock().contains(peer_id)
    }

    /// Run one pass over `peers`, sequentially.
    ///
    /// A pass already in flight makes this a no-op. A peer that fails or
    /// times out is logged and skipped.
    pub async fn sync_with_peers(&self, peers: &[Arc<dyn SyncPeer>]) -> SyncReport {
        let Ok(slot) = self.pass_slot.clone().try_acquire_owned() else {
            warn!("Sync already in progress, skipping");
            return SyncReport {
                skipped: true,
                ..SyncReport::default()
            };
        };

        let pending = {
            let mut state = self.state.write();
            self.forgotten.lock().clear();
            state.sync_in_progress = true;
            state.last_sync = Some(now_millis());
            self.persist(&state);
            state.pending_changes.clone()
        };
        let _guard = PassGuard {
            engine: self,
            _slot: slot,
        };

        info!(peers = peers.len(), pending = pending.len(), "Starting sync pass");

        let mut report = SyncReport::default();
        let mut exchanged = false;
        for peer in peers {
            let peer_id = peer.peer_id().clone();
            if self.is_forgotten(&peer_id) {
                debug!(peer_id = %peer_id.short(), "Peer removed, skipping");
                continue;
            }
            let token = CancellationToken::new();
            self.exchanges.lock().insert(peer_id.clone(), token.clone());

            let outcome = tokio::select! {
                _ = token.cancelled() => Err(MeshError::SyncPeerUnreachable {
                    peer_id: peer_id.clone(),
                    reason: "cancelled".into(),
                }),
                result = self.sync_one(peer.as_ref(), &pending) => result,
            };
            self.exchanges.lock().remove(&peer_id);
            if self.is_forgotten(&peer_id) {
                debug!(peer_id = %peer_id.short(), "Peer removed during exchange");
                continue;
            }

            match outcome {
                Ok(did_exchange) => {
                    exchanged |= did_exchange;
                    report.synced.push(peer_id);
                }
                Err(e) => {
                    warn!(peer_id = %peer_id.short(), error = %e, "Skipping peer in sync pass");
                    report.failed.push(peer_id);
                }
            }
        }

        if exchanged && !pending.is_empty() {
            let mut state = self.state.write();
            state.pending_changes.retain(|item| !pending.contains(item));
            self.persist(&state);
        }

        info!(
            synced = report.synced.len(),
            failed = report.failed.len(),
            "Sync pass finished"
        );
        self.events.emit(NetworkEvent::SyncCompleted {
            synced: report.synced.len(),
            failed: report.failed.len(),
        });
        report
    }

    /// Returns whether changes were actually exchanged
    async fn sync_one(&self, peer: &dyn SyncPeer, pending: &BTreeSet<String>) -> MeshResult<bool> {
        let peer_id = peer.peer_id();
        let unreachable = |reason: String| MeshError::SyncPeerUnreachable {
            peer_id: peer_id.clone(),
            reason,
        };

        let remote = tokio::time::timeout(self.exchange_timeout, peer.version_vector())
            .await
            .map_err(|_| unreachable("version vector timed out".into()))?
            .map_err(|e| unreachable(e.to_string()))?;

        let local = self
            .state
            .read()
            .version_vector
            .get(peer_id)
            .cloned()
            .unwrap_or_default();
        let diff = self.strategy.compare(&local, &remote);

        // Pending local items are by definition missing on the peer
        if !diff.needs_update && pending.is_empty() {
            debug!(peer_id = %peer_id.short(), "Peer already in sync");
            return Ok(false);
        }

        let returned = tokio::time::timeout(self.exchange_timeout, peer.exchange_changes(&diff, pending))
            .await
            .map_err(|_| unreachable("change exchange timed out".into()))?
            .map_err(|e| unreachable(e.to_string()))?;

        let mut state = self.state.write();
        if self.is_forgotten(peer_id) {
            return Err(unreachable("peer removed".into()));
        }
        let entry = state.version_vector.entry(peer_id.clone()).or_default();
        entry.merge(&remote);
        entry.merge(&returned);
        self.records.save_sync_state(&state)?;
        debug!(peer_id = %peer_id.short(), "Exchanged changes");
        Ok(true)
    }

    fn persist(&self, state: &SyncState) {
        if let Err(e) = self.records.save_sync_state(state) {
            warn!(error = %e, "Failed to persist sync state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::sync::CounterStrategy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted peer
    struct FakePeer {
        id: PeerId,
        vector: VersionVector,
        fail_vector: bool,
        delay: Duration,
        exchanges: AtomicUsize,
    }

    impl FakePeer {
        fn new(key: &str, vector: &[(&str, u64)]) -> Self {
            Self {
                id: PeerId::from_public_key(key),
                vector: vector.iter().map(|&(k, v)| (k, v)).collect(),
                fail_vector: false,
                delay: Duration::ZERO,
                exchanges: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SyncPeer for FakePeer {
        fn peer_id(&self) -> &PeerId {
            &self.id
        }

        async fn version_vector(&self) -> MeshResult<VersionVector> {
            tokio::time::sleep(self.delay).await;
            if self.fail_vector {
                return Err(MeshError::Transport("connection reset".into()));
            }
            Ok(self.vector.clone())
        }

        async fn exchange_changes(
            &self,
            _diff: &VectorDiff,
            _pending: &BTreeSet<String>,
        ) -> MeshResult<VersionVector> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            Ok(self.vector.clone())
        }
    }

    fn engine(records: Records) -> Arc<SyncEngine> {
        Arc::new(
            SyncEngine::new(
                records,
                Arc::new(CounterStrategy),
                Duration::from_secs(1),
                EventBus::new(),
            )
            .unwrap(),
        )
    }

    fn records() -> Records {
        Records::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_failing_peer_does_not_stop_pass() {
        let engine = engine(records());
        let mut a = FakePeer::new("a", &[("a", 1)]);
        a.fail_vector = true;
        let b = Arc::new(FakePeer::new("b", &[("b", 2)]));
        let peers: Vec<Arc<dyn SyncPeer>> = vec![Arc::new(a), b.clone()];

        let report = engine.sync_with_peers(&peers).await;

        assert_eq!(report.failed, vec![PeerId::from_public_key("a")]);
        assert_eq!(report.synced, vec![PeerId::from_public_key("b")]);
        assert_eq!(b.exchanges.load(Ordering::SeqCst), 1);
        assert!(!engine.is_syncing());
        assert!(engine.state().last_sync.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_pass_is_noop() {
        let engine = engine(records());
        let mut slow = FakePeer::new("slow", &[("s", 1)]);
        slow.delay = Duration::from_millis(200);
        let peers: Vec<Arc<dyn SyncPeer>> = vec![Arc::new(slow)];

        let first = {
            let engine = engine.clone();
            let peers = peers.clone();
            tokio::spawn(async move { engine.sync_with_peers(&peers).await })
        };
        while !engine.is_syncing() {
            tokio::task::yield_now().await;
        }
        let before = engine.state();

        let second = engine.sync_with_peers(&peers).await;

        assert!(second.skipped);
        assert_eq!(engine.state(), before);
        let first = first.await.unwrap();
        assert!(!first.skipped);
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_pending_drained_after_success() {
        let engine = engine(records());
        engine.record_local_change("doc-1").unwrap();
        engine.record_local_change("doc-2").unwrap();
        let peers: Vec<Arc<dyn SyncPeer>> = vec![Arc::new(FakePeer::new("a", &[]))];

        engine.sync_with_peers(&peers).await;

        assert!(engine.pending_changes().is_empty());
    }

    #[tokio::test]
    async fn test_pending_kept_when_every_peer_fails() {
        let engine = engine(records());
        engine.record_local_change("doc-1").unwrap();
        let mut a = FakePeer::new("a", &[]);
        a.fail_vector = true;
        let peers: Vec<Arc<dyn SyncPeer>> = vec![Arc::new(a)];

        engine.sync_with_peers(&peers).await;

        assert_eq!(engine.pending_changes().len(), 1);
    }

    #[tokio::test]
    async fn test_vector_never_decreases() {
        let engine = engine(records());
        let peer_id = PeerId::from_public_key("a");
        let first: Vec<Arc<dyn SyncPeer>> = vec![Arc::new(FakePeer::new("a", &[("x", 5)]))];
        engine.sync_with_peers(&first).await;

        let second: Vec<Arc<dyn SyncPeer>> =
            vec![Arc::new(FakePeer::new("a", &[("x", 2), ("y", 1)]))];
        engine.sync_with_peers(&second).await;

        let vv = engine.state().version_vector[&peer_id].clone();
        assert_eq!(vv.get("x"), 5);
        assert_eq!(vv.get("y"), 1);
    }

    #[tokio::test]
    async fn test_in_sync_peer_skips_exchange() {
        let engine = engine(records());
        let peer = Arc::new(FakePeer::new("a", &[("x", 1)]));
        let peers: Vec<Arc<dyn SyncPeer>> = vec![peer.clone()];

        engine.sync_with_peers(&peers).await;
        engine.sync_with_peers(&peers).await;

        assert_eq!(peer.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_peer_mid_exchange() {
        let engine = engine(records());
        let mut slow = FakePeer::new("slow", &[("s", 1)]);
        slow.delay = Duration::from_millis(500);
        let slow_id = slow.id.clone();
        let fast = FakePeer::new("fast", &[("f", 1)]);
        let peers: Vec<Arc<dyn SyncPeer>> = vec![Arc::new(slow), Arc::new(fast)];

        let pass = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.sync_with_peers(&peers).await })
        };
        while engine.exchanges.lock().get(&slow_id).is_none() {
            tokio::task::yield_now().await;
        }
        engine.cancel_peer(&slow_id);

        let report = pass.await.unwrap();
        assert_eq!(report.failed, vec![slow_id]);
        assert_eq!(report.synced.len(), 1);
    }

    #[tokio::test]
    async fn test_peer_removed_mid_pass_is_skipped() {
        let engine = engine(records());
        engine.record_local_change("doc-1").unwrap();
        let mut slow = FakePeer::new("slow", &[("s", 1)]);
        slow.delay = Duration::from_millis(200);
        let slow_id = slow.id.clone();
        let gone = Arc::new(FakePeer::new("gone", &[("g", 1)]));
        let peers: Vec<Arc<dyn SyncPeer>> = vec![Arc::new(slow), gone.clone()];

        let pass = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.sync_with_peers(&peers).await })
        };
        while engine.exchanges.lock().get(&slow_id).is_none() {
            tokio::task::yield_now().await;
        }
        engine.forget_peer(&gone.id);

        let report = pass.await.unwrap();
        assert_eq!(report.synced, vec![slow_id]);
        assert!(report.failed.is_empty());
        assert_eq!(gone.exchanges.load(Ordering::SeqCst), 0);
        assert!(!engine.state().version_vector.contains_key(&gone.id));
        assert!(engine.pending_changes().is_empty());
    }

    #[tokio::test]
    async fn test_forgotten_peer_syncs_again_next_pass() {
        let engine = engine(records());
        let peer = Arc::new(FakePeer::new("back", &[("b", 1)]));
        engine.forget_peer(&peer.id);
        let peers: Vec<Arc<dyn SyncPeer>> = vec![peer.clone()];

        let report = engine.sync_with_peers(&peers).await;

        assert_eq!(report.synced, vec![peer.id.clone()]);
        assert_eq!(peer.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_aborted_pass_releases_flag() {
        let engine = engine(records());
        let mut slow = FakePeer::new("slow", &[]);
        slow.delay = Duration::from_secs(30);
        let peers: Vec<Arc<dyn SyncPeer>> = vec![Arc::new(slow)];

        let pass = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.sync_with_peers(&peers).await })
        };
        while !engine.is_syncing() {
            tokio::task::yield_now().await;
        }
        pass.abort();
        let _ = pass.await;

        assert!(!engine.is_syncing());
        let again: Vec<Arc<dyn SyncPeer>> = vec![Arc::new(FakePeer::new("a", &[]))];
        assert!(!engine.sync_with_peers(&again).await.skipped);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let records = records();
        {
            let engine = engine(records.clone());
            engine.record_local_change("doc-1").unwrap();
        }

        let engine = engine(records);
        assert!(engine.pending_changes().contains("doc-1"));
    }

    #[test]
    fn test_stale_flag_cleared_on_load() {
        let records = records();
        records
            .save_sync_state(&SyncState {
                sync_in_progress: true,
                ..SyncState::default()
            })
            .unwrap();

        let engine = engine(records.clone());

        assert!(!engine.is_syncing());
        assert!(!records.load_sync_state().unwrap().unwrap().sync_in_progress);
    }
}
