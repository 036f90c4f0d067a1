//! Peer network context
//!
//! [`PeerNetwork`] is the one object an application holds: it owns the peer
//! directory, connection table, sync state and persistence handle, wires the
//! components together and drives the periodic timers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  PeerNetwork                                                    │
//! │  ├── state: Mutex<MeshState>  (directory + connections)         │
//! │  ├── supervisor: ConnectionSupervisor                           │
//! │  ├── router: MessageRouter                                      │
//! │  ├── resources: ResourceMonitor                                 │
//! │  ├── discovery: Option<DiscoveryService>                        │
//! │  ├── sync: SyncEngine                                           │
//! │  └── timers (cancelled on shutdown)                             │
//! │      ├── discovery   every discoveryIntervalMs, first at start  │
//! │      ├── heartbeat   every heartbeatIntervalMs                  │
//! │      ├── resources   every resourceIntervalMs                   │
//! │      ├── sync        every syncIntervalMs                       │
//! │      └── eviction    (exhaustedPolicy = evictPeer only)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let hub = ChannelHub::new();
//! let config = MeshConfig::default();
//! let (transport, mut inbound) = hub.join(config.identity.peer_id());
//!
//! let network = PeerNetwork::builder(config)
//!     .transport(Arc::new(transport))
//!     .build()?;
//! network.start().await;
//!
//! while let Some(msg) = inbound.recv().await {
//!     network.handle_inbound(&msg.from, &msg.payload).await?;
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ExhaustedPolicy, MeshConfig};
use crate::connection::{BroadcastReport, ConnectionSupervisor, SignalingTransport};
use crate::directory::PeerDirectory;
use crate::discovery::{DiscoveryBackend, DiscoveryService, ScanSummary};
use crate::error::{MeshError, MeshResult};
use crate::events::{EventBus, NetworkEvent};
use crate::protocol::{Envelope, MeshMessage};
use crate::resources::{ResourceMonitor, ResourceProbe, SystemProbe};
use crate::router::{MessageRouter, Routed};
use crate::state::{MeshState, SharedState};
use crate::storage::{MemoryStore, RecordStore, Records};
use crate::sync::{
    CounterStrategy, SyncEngine, SyncPeer, SyncPeerProvider, SyncReport, SyncState,
    VectorStrategy,
};
use crate::types::{Connection, Peer, PeerDescriptor, PeerId, PeerStatus, ResourceSample};

/// Assembles a [`PeerNetwork`]
pub struct PeerNetworkBuilder {
    config: MeshConfig,
    store: Option<Arc<dyn RecordStore>>,
    transport: Option<Arc<dyn SignalingTransport>>,
    probe: Option<Arc<dyn ResourceProbe>>,
    discovery: Option<Arc<dyn DiscoveryBackend>>,
    sync_peers: Option<Arc<dyn SyncPeerProvider>>,
    strategy: Option<Arc<dyn VectorStrategy>>,
}

impl PeerNetworkBuilder {
    /// Record store (default: in-memory)
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Signaling transport (required)
    pub fn transport(mut self, transport: Arc<dyn SignalingTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Resource probe (default: [`SystemProbe`])
    pub fn probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Discovery backend (default: none, peers are added manually)
    pub fn discovery(mut self, backend: Arc<dyn DiscoveryBackend>) -> Self {
        self.discovery = Some(backend);
        self
    }

    /// Source of sync links for the periodic sync timer
    pub fn sync_peers(mut self, provider: Arc<dyn SyncPeerProvider>) -> Self {
        self.sync_peers = Some(provider);
        self
    }

    /// Version-vector comparison (default: [`CounterStrategy`])
    pub fn strategy(mut self, strategy: Arc<dyn VectorStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn build(self) -> MeshResult<PeerNetwork> {
        let config = self.config;
        config.validate()?;

        let transport = self
            .transport
            .ok_or_else(|| MeshError::Config("a signaling transport is required".into()))?;
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let records = Records::new(store);

        // Links do not survive a restart: drop stale records and statuses
        records.clear_connections()?;
        let mut directory = PeerDirectory::load(config.max_peers, records.clone())?;
        for peer in directory.list() {
            if peer.status == PeerStatus::Connected {
                directory.mark(&peer.id, PeerStatus::Disconnected)?;
            }
        }

        let state = MeshState::new(directory, records.clone()).shared();
        let events = EventBus::new();
        let local_id = config.identity.peer_id();
        let local_key = config.identity.public_key.clone();

        let (exhausted_tx, exhausted_rx) = match config.exhausted_policy {
            ExhaustedPolicy::EvictPeer => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
            ExhaustedPolicy::KeepClosed => (None, None),
        };

        let config = Arc::new(config);
        let supervisor = ConnectionSupervisor::new(
            state.clone(),
            transport,
            config.clone(),
            events.clone(),
            exhausted_tx,
        );
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SystemProbe::new()));
        let resources = Arc::new(ResourceMonitor::new(
            probe,
            records.clone(),
            supervisor.clone(),
            events.clone(),
        ));
        let router = MessageRouter::new(
            state.clone(),
            supervisor.clone(),
            resources.clone(),
            events.clone(),
            local_key.clone(),
            config.max_message_size,
        );
        let sync = SyncEngine::new(
            records,
            self.strategy.unwrap_or_else(|| Arc::new(CounterStrategy)),
            config.sync_timeout(),
            events.clone(),
        )?;
        let discovery = self
            .discovery
            .map(|backend| DiscoveryService::new(backend, local_key));

        info!(peer_id = %local_id.short(), name = %config.identity.name, "Peer network ready");

        Ok(PeerNetwork {
            inner: Arc::new(NetworkInner {
                config,
                local_id,
                state,
                supervisor,
                router,
                resources,
                sync,
                discovery,
                sync_peers: self.sync_peers,
                events,
            }),
            shutdown: CancellationToken::new(),
            timers: Mutex::new(Vec::new()),
            exhausted_rx: Mutex::new(exhausted_rx),
        })
    }
}

struct NetworkInner {
    config: Arc<MeshConfig>,
    local_id: PeerId,
    state: SharedState,
    supervisor: ConnectionSupervisor,
    router: MessageRouter,
    resources: Arc<ResourceMonitor>,
    sync: SyncEngine,
    discovery: Option<DiscoveryService>,
    sync_peers: Option<Arc<dyn SyncPeerProvider>>,
    events: EventBus,
}

impl NetworkInner {
    /// Cancel sync and connection work for the peer, then cascade-delete it
    fn remove_peer(&self, peer_id: &PeerId) -> MeshResult<bool> {
        self.sync.forget_peer(peer_id);
        self.supervisor.close(peer_id)?;

        let removed = {
            let mut state = self.state.lock();
            // An offer may have recreated the connection after close()
            state.connections.remove(peer_id)?;
            state.directory.remove_peer(peer_id)?
        };

        if removed.is_some() {
            self.events.emit(NetworkEvent::PeerRemoved {
                peer_id: peer_id.clone(),
            });
        }
        Ok(removed.is_some())
    }

    async fn discover(&self) -> MeshResult<ScanSummary> {
        match &self.discovery {
            Some(discovery) => discovery.scan_once(&self.router).await,
            None => Ok(ScanSummary::default()),
        }
    }

    async fn sync_connected(&self) -> SyncReport {
        let Some(provider) = &self.sync_peers else {
            debug!("No sync peer provider, skipping sync");
            return SyncReport::default();
        };
        let peers: Vec<Arc<dyn SyncPeer>> = self
            .supervisor
            .connected_peers()
            .iter()
            .filter_map(|peer_id| provider.sync_peer(peer_id))
            .collect();
        self.sync.sync_with_peers(&peers).await
    }
}

/// A running peer-network node
pub struct PeerNetwork {
    inner: Arc<NetworkInner>,
    shutdown: CancellationToken,
    timers: Mutex<Vec<JoinHandle<()>>>,
    exhausted_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerId>>>,
}

impl PeerNetwork {
    pub fn builder(config: MeshConfig) -> PeerNetworkBuilder {
        PeerNetworkBuilder {
            config,
            store: None,
            transport: None,
            probe: None,
            discovery: None,
            sync_peers: None,
            strategy: None,
        }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.events.subscribe()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Peers
    // ═══════════════════════════════════════════════════════════════════════

    /// Register a peer and start connecting to it.
    ///
    /// Re-adding a known key refreshes it and restarts a closed connection.
    pub fn add_peer(&self, descriptor: PeerDescriptor) -> MeshResult<PeerId> {
        Ok(self.inner.router.register_peer(descriptor)?.peer_id)
    }

    /// Idempotent; cancels in-flight work and deletes the peer's records.
    ///
    /// Returns whether the peer was known.
    pub fn remove_peer(&self, peer_id: &PeerId) -> MeshResult<bool> {
        self.inner.remove_peer(peer_id)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.inner.state.lock().directory.list()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<Peer> {
        self.inner.state.lock().directory.get(peer_id).cloned()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Connections
    // ═══════════════════════════════════════════════════════════════════════

    pub fn connection(&self, peer_id: &PeerId) -> Option<Connection> {
        self.inner.supervisor.connection(peer_id)
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner.supervisor.connections()
    }

    pub fn should_retry_connection(&self, peer_id: &PeerId) -> bool {
        self.inner.supervisor.should_retry_connection(peer_id)
    }

    /// Run the heartbeat check now
    pub fn check_timeouts(&self) -> Vec<PeerId> {
        self.inner.supervisor.check_timeouts()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Messages
    // ═══════════════════════════════════════════════════════════════════════

    /// Feed bytes received from `from` into the router
    pub async fn handle_inbound(&self, from: &PeerId, payload: &[u8]) -> MeshResult<Routed> {
        self.inner.router.route_bytes(Some(from), payload).await
    }

    /// Route a parsed message with an optional sender
    pub async fn route_message(&self, from: Option<&PeerId>, message: Value) -> MeshResult<Routed> {
        self.inner.router.route(from, message).await
    }

    pub async fn broadcast(&self, envelope: &Envelope) -> BroadcastReport {
        self.inner.supervisor.broadcast(envelope).await
    }

    pub async fn send_to(&self, peer_id: &PeerId, envelope: &Envelope) -> MeshResult<()> {
        self.inner.supervisor.send_to(peer_id, envelope).await
    }

    /// Announce ourselves to every connected peer
    pub async fn announce(&self) -> MeshResult<BroadcastReport> {
        let identity = &self.inner.config.identity;
        let descriptor = PeerDescriptor::new(identity.name.clone(), identity.public_key.clone());
        let envelope = MeshMessage::PeerAnnounce(descriptor).to_envelope()?;
        Ok(self.broadcast(&envelope).await)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Resources, discovery, sync
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn report_resources(&self) -> MeshResult<ResourceSample> {
        self.inner.resources.sample_and_report().await
    }

    pub fn resource_history(&self, peer_id: Option<&PeerId>) -> MeshResult<Vec<ResourceSample>> {
        match peer_id {
            Some(peer_id) => self.inner.resources.peer_history(peer_id),
            None => self.inner.resources.local_history(),
        }
    }

    pub async fn discover_now(&self) -> MeshResult<ScanSummary> {
        self.inner.discover().await
    }

    pub fn record_local_change(&self, item_id: impl Into<String>) -> MeshResult<bool> {
        self.inner.sync.record_local_change(item_id)
    }

    pub async fn sync_with_peers(&self, peers: &[Arc<dyn SyncPeer>]) -> SyncReport {
        self.inner.sync.sync_with_peers(peers).await
    }

    /// Sync with every connected peer the provider can reach
    pub async fn sync_now(&self) -> SyncReport {
        self.inner.sync_connected().await
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.sync.state()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Announce, reconnect restored peers and start the periodic timers.
    ///
    /// Calling it twice is a no-op.
    pub async fn start(&self) {
        if !self.timers.lock().is_empty() {
            warn!("Peer network already started");
            return;
        }

        if let Some(discovery) = &self.inner.discovery {
            if let Err(e) = discovery.announce(&self.inner.config.identity).await {
                warn!(error = %e, "Discovery announce failed");
            }
        }

        let restored: Vec<PeerId> = self.peers().into_iter().map(|p| p.id).collect();
        for peer_id in &restored {
            if let Err(e) = self.inner.supervisor.initialize_connection(peer_id) {
                warn!(peer_id = %peer_id.short(), error = %e, "Could not reconnect restored peer");
            }
        }

        let config = self.inner.config.clone();
        let mut timers = Vec::new();

        if self.inner.discovery.is_some() {
            timers.push(self.spawn_timer("discovery", config.discovery_interval(), true, |inner| async move {
                if let Err(e) = inner.discover().await {
                    warn!(error = %e, "Discovery scan failed");
                }
            }));
        }
        timers.push(self.spawn_timer("heartbeat", config.heartbeat_interval(), false, |inner| async move {
            inner.supervisor.check_timeouts();
        }));
        timers.push(self.spawn_timer("resources", config.resource_interval(), false, |inner| async move {
            if let Err(e) = inner.resources.sample_and_report().await {
                warn!(error = %e, "Resource sampling failed");
            }
        }));
        timers.push(self.spawn_timer("sync", config.sync_interval(), false, |inner| async move {
            inner.sync_connected().await;
        }));

        let exhausted_rx = self.exhausted_rx.lock().take();
        if let Some(mut exhausted) = exhausted_rx {
            let inner = self.inner.clone();
            let shutdown = self.shutdown.clone();
            timers.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        next = exhausted.recv() => {
                            let Some(peer_id) = next else { break };
                            info!(peer_id = %peer_id.short(), "Evicting peer after exhausted retries");
                            if let Err(e) = inner.remove_peer(&peer_id) {
                                warn!(peer_id = %peer_id.short(), error = %e, "Eviction failed");
                            }
                        }
                    }
                }
            }));
        }

        info!(timers = timers.len(), restored = restored.len(), "Peer network started");
        *self.timers.lock() = timers;
    }

    fn spawn_timer<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        immediate: bool,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<NetworkInner>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let inner = self.inner.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if !immediate {
                // The first tick of an interval fires at once
                interval.tick().await;
            }
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        debug!(timer = name, "Timer fired");
                        tick(inner.clone()).await;
                    }
                }
            }
            debug!(timer = name, "Timer stopped");
        })
    }

    /// Stop every timer, abort connection work, withdraw the discovery
    /// announcement and release the persistence handle.
    pub async fn shutdown(self) -> MeshResult<()> {
        info!("Shutting down peer network");
        self.shutdown.cancel();

        let timers: Vec<_> = self.timers.lock().drain(..).collect();
        for handle in timers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Timer task ended abnormally");
            }
        }

        self.inner.supervisor.shutdown().await;
        if let Some(discovery) = &self.inner.discovery {
            if let Err(e) = discovery.shutdown().await {
                warn!(error = ?e, "Failed to shutdown discovery cleanly");
            }
        }

        info!("Peer network shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RecordingTransport;
    use crate::discovery::StaticDiscovery;
    use crate::protocol::{SessionDescription, OFFER};
    use crate::resources::StaticProbe;
    use crate::storage::Storage;
    use crate::types::ConnectionStatus;
    use tempfile::TempDir;

    fn network_with(config: MeshConfig, transport: Arc<RecordingTransport>) -> PeerNetwork {
        PeerNetwork::builder(config)
            .transport(transport)
            .probe(Arc::new(StaticProbe::new(ResourceSample::empty())))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_requires_transport() {
        let result = PeerNetwork::builder(MeshConfig::default()).build();
        assert!(matches!(result, Err(MeshError::Config(_))));
    }

    #[tokio::test]
    async fn test_add_peer_starts_connection() {
        let transport = Arc::new(RecordingTransport::new());
        let network = network_with(MeshConfig::default(), transport.clone());
        let mut events = network.subscribe();

        let peer_id = network
            .add_peer(PeerDescriptor::new("Alice", "abc123"))
            .unwrap();

        assert_eq!(
            network.connection(&peer_id).unwrap().status,
            ConnectionStatus::Initializing
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            NetworkEvent::PeerAdded { .. }
        ));
    }

    #[tokio::test]
    async fn test_remove_then_re_add_is_fresh() {
        let transport = Arc::new(RecordingTransport::new());
        let network = network_with(MeshConfig::default(), transport);
        let peer_id = network
            .add_peer(PeerDescriptor::new("Bob", "bob"))
            .unwrap();
        network
            .route_message(
                Some(&peer_id),
                serde_json::to_value(
                    MeshMessage::Offer(SessionDescription::offer(&[]))
                        .to_envelope()
                        .unwrap(),
                )
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(network.peer(&peer_id).unwrap().status, PeerStatus::Connected);

        assert!(network.remove_peer(&peer_id).unwrap());
        assert!(!network.remove_peer(&peer_id).unwrap());
        assert!(network.connection(&peer_id).is_none());

        let again = network.add_peer(PeerDescriptor::new("Bob", "bob")).unwrap();
        assert_eq!(again, peer_id);
        assert_eq!(network.peer(&again).unwrap().status, PeerStatus::New);
        assert_eq!(network.connection(&again).unwrap().retries, 0);
    }

    #[tokio::test]
    async fn test_connection_limit_does_not_block_registration() {
        let config = MeshConfig {
            max_peers: 3,
            max_connections: 1,
            ..MeshConfig::default()
        };
        let network = network_with(config, Arc::new(RecordingTransport::new()));

        let first = network.add_peer(PeerDescriptor::new("a", "a")).unwrap();
        let second = network.add_peer(PeerDescriptor::new("b", "b")).unwrap();

        assert!(network.connection(&first).is_some());
        assert!(network.connection(&second).is_none());
        assert_eq!(network.peers().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_run_and_stop_on_shutdown() {
        let transport = Arc::new(RecordingTransport::new());
        let discovery = Arc::new(StaticDiscovery::new(vec![PeerDescriptor::new(
            "seed", "seed-key",
        )]));
        let network = PeerNetwork::builder(MeshConfig::default())
            .transport(transport.clone())
            .probe(Arc::new(StaticProbe::new(ResourceSample::empty())))
            .discovery(discovery)
            .build()
            .unwrap();

        network.start().await;
        // Immediate discovery scan registers the seed and sends an offer
        tokio::time::sleep(Duration::from_millis(10)).await;
        let seed = PeerId::from_public_key("seed-key");
        assert!(network.peer(&seed).is_some());
        assert_eq!(transport.count(&seed, OFFER), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(network.resource_history(None).unwrap().len(), 1);

        network.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_policy_removes_peer() {
        let config = MeshConfig {
            exhausted_policy: ExhaustedPolicy::EvictPeer,
            ..MeshConfig::default()
        };
        let transport = Arc::new(RecordingTransport::new());
        let network = network_with(config, transport);
        let mut events = network.subscribe();
        network.start().await;

        let peer_id = network.add_peer(PeerDescriptor::new("ghost", "ghost")).unwrap();

        let removed = tokio::time::timeout(Duration::from_secs(300), async {
            loop {
                if let Ok(NetworkEvent::PeerRemoved { peer_id }) = events.recv().await {
                    return peer_id;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(removed, peer_id);
        assert!(network.peer(&peer_id).is_none());
        network.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_store_and_transport() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new());
        let network = PeerNetwork::builder(MeshConfig::default())
            .store(store.clone())
            .transport(transport.clone())
            .probe(Arc::new(StaticProbe::new(ResourceSample::empty())))
            .build()
            .unwrap();
        network.start().await;

        // Leave the establishment task parked on the answer wait
        let peer_id = network.add_peer(PeerDescriptor::new("quiet", "quiet")).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.count(&peer_id, OFFER) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        network.shutdown().await.unwrap();

        assert_eq!(Arc::strong_count(&store), 1);
        assert_eq!(Arc::strong_count(&transport), 1);
    }

    #[tokio::test]
    async fn test_restart_restores_peers_without_links() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("mesh.redb");
        let config = MeshConfig::default();

        let peer_id = {
            let store = Arc::new(Storage::new(&db_path).unwrap());
            let network = PeerNetwork::builder(config.clone())
                .store(store)
                .transport(Arc::new(RecordingTransport::new()))
                .probe(Arc::new(StaticProbe::new(ResourceSample::empty())))
                .build()
                .unwrap();
            let peer_id = network.add_peer(PeerDescriptor::new("Love", "love")).unwrap();
            network.record_local_change("doc-1").unwrap();
            network.shutdown().await.unwrap();
            peer_id
        };

        let store = Arc::new(Storage::new(&db_path).unwrap());
        let network = PeerNetwork::builder(config)
            .store(store)
            .transport(Arc::new(RecordingTransport::new()))
            .probe(Arc::new(StaticProbe::new(ResourceSample::empty())))
            .build()
            .unwrap();

        assert_eq!(network.peer(&peer_id).unwrap().name, "Love");
        assert!(network.connection(&peer_id).is_none());
        assert!(network.sync_state().pending_changes.contains("doc-1"));
    }
}
