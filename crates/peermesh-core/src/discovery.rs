//! LAN discovery
//!
//! A [`DiscoveryBackend`] announces the local node and returns the peers it
//! can currently see. [`DiscoveryService`] feeds those candidates through the
//! router so they are registered exactly like an inbound `PEER_ANNOUNCE`.
//!
//! Backends:
//! - `MdnsDiscovery` (feature `mdns`): registers `_peermesh._tcp.local.` with
//!   `name` / `pk` TXT properties and browses for a fixed window per scan
//! - [`StaticDiscovery`]: a fixed candidate list (seeds, tests)

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::LocalIdentity;
use crate::error::MeshResult;
use crate::router::MessageRouter;
use crate::types::PeerDescriptor;

#[cfg(feature = "mdns")]
pub use mdns::MdnsDiscovery;

/// Source of peer candidates
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Make the local node visible to others
    async fn announce(&self, identity: &LocalIdentity) -> MeshResult<()>;

    /// Peers visible right now
    async fn scan(&self) -> MeshResult<Vec<PeerDescriptor>>;

    /// Withdraw the announcement
    async fn shutdown(&self) -> MeshResult<()> {
        Ok(())
    }
}

/// Fixed list of candidates
#[derive(Default)]
pub struct StaticDiscovery {
    candidates: Mutex<Vec<PeerDescriptor>>,
}

impl StaticDiscovery {
    pub fn new(candidates: Vec<PeerDescriptor>) -> Self {
        Self {
            candidates: Mutex::new(candidates),
        }
    }

    pub fn push(&self, descriptor: PeerDescriptor) {
        self.candidates.lock().push(descriptor);
    }
}

#[async_trait]
impl DiscoveryBackend for StaticDiscovery {
    async fn announce(&self, identity: &LocalIdentity) -> MeshResult<()> {
        debug!(name = %identity.name, "Static discovery has nothing to announce to");
        Ok(())
    }

    async fn scan(&self) -> MeshResult<Vec<PeerDescriptor>> {
        Ok(self.candidates.lock().clone())
    }
}

/// Counts from one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub found: usize,
    pub registered: usize,
    pub refreshed: usize,
    pub rejected: usize,
}

/// Runs scans against a backend and registers what it finds
#[derive(Clone)]
pub struct DiscoveryService {
    backend: Arc<dyn DiscoveryBackend>,
    local_key: String,
}

impl DiscoveryService {
    pub fn new(backend: Arc<dyn DiscoveryBackend>, local_key: impl Into<String>) -> Self {
        Self {
            backend,
            local_key: local_key.into(),
        }
    }

    pub async fn announce(&self, identity: &LocalIdentity) -> MeshResult<()> {
        self.backend.announce(identity).await
    }

    /// One scan. Per-candidate failures (e.g. the peer limit) are logged and
    /// counted, never returned.
    pub async fn scan_once(&self, router: &MessageRouter) -> MeshResult<ScanSummary> {
        let candidates = self.backend.scan().await?;
        let mut summary = ScanSummary::default();

        for descriptor in candidates {
            if descriptor.public_key == self.local_key {
                continue;
            }
            summary.found += 1;
            match router.register_peer(descriptor) {
                Ok(reg) if reg.created => summary.registered += 1,
                Ok(_) => summary.refreshed += 1,
                Err(e) => {
                    debug!(error = %e, "Discovered peer not registered");
                    summary.rejected += 1;
                }
            }
        }

        if summary.registered > 0 {
            info!(
                found = summary.found,
                registered = summary.registered,
                "Discovery scan found new peers"
            );
        }
        if summary.rejected > 0 {
            warn!(rejected = summary.rejected, "Some discovered peers were rejected");
        }
        Ok(summary)
    }

    pub async fn shutdown(&self) -> MeshResult<()> {
        self.backend.shutdown().await
    }
}

#[cfg(feature = "mdns")]
mod mdns {
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
    use parking_lot::Mutex;
    use serde_json::json;
    use tracing::{debug, info, warn};

    use super::DiscoveryBackend;
    use crate::config::LocalIdentity;
    use crate::error::{MeshError, MeshResult};
    use crate::types::PeerDescriptor;

    const PROP_NAME: &str = "name";
    const PROP_PUBLIC_KEY: &str = "pk";

    fn discovery_err(e: impl std::fmt::Display) -> MeshError {
        MeshError::Discovery(e.to_string())
    }

    /// mDNS-SD announce and browse
    pub struct MdnsDiscovery {
        daemon: ServiceDaemon,
        service_type: String,
        window: Duration,
        port: u16,
        registered: Mutex<Option<String>>,
    }

    impl MdnsDiscovery {
        pub fn new(service_type: impl Into<String>, window: Duration, port: u16) -> MeshResult<Self> {
            let daemon = ServiceDaemon::new().map_err(discovery_err)?;
            Ok(Self {
                daemon,
                service_type: service_type.into(),
                window,
                port,
                registered: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl DiscoveryBackend for MdnsDiscovery {
        async fn announce(&self, identity: &LocalIdentity) -> MeshResult<()> {
            let host = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "peermesh-node".into());
            let peer_id = identity.peer_id();
            let instance = format!("{}-{}", identity.name, peer_id.short());

            let properties = [
                (PROP_NAME, identity.name.as_str()),
                (PROP_PUBLIC_KEY, identity.public_key.as_str()),
            ];
            let service = ServiceInfo::new(
                &self.service_type,
                &instance,
                &format!("{host}.local."),
                "",
                self.port,
                &properties[..],
            )
            .map_err(discovery_err)?
            .enable_addr_auto();

            let fullname = service.get_fullname().to_string();
            if let Some(previous) = self.registered.lock().take() {
                let _ = self.daemon.unregister(&previous);
            }
            self.daemon.register(service).map_err(discovery_err)?;
            info!(%fullname, port = self.port, "Announced on mDNS");
            *self.registered.lock() = Some(fullname);
            Ok(())
        }

        async fn scan(&self) -> MeshResult<Vec<PeerDescriptor>> {
            let receiver = self.daemon.browse(&self.service_type).map_err(discovery_err)?;
            let window = self.window;

            // The mDNS receiver is blocking; drain it off the runtime
            let found = tokio::task::spawn_blocking(move || {
                let deadline = Instant::now() + window;
                let mut found: HashMap<String, PeerDescriptor> = HashMap::new();
                while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
                    match receiver.recv_timeout(remaining) {
                        Ok(ServiceEvent::ServiceResolved(info)) => {
                            let (Some(name), Some(public_key)) = (
                                info.get_property_val_str(PROP_NAME),
                                info.get_property_val_str(PROP_PUBLIC_KEY),
                            ) else {
                                continue;
                            };
                            let addresses: Vec<String> =
                                info.get_addresses().iter().map(|a| a.to_string()).collect();
                            let descriptor = PeerDescriptor::new(name, public_key).with_metadata(
                                json!({ "addresses": addresses, "port": info.get_port() }),
                            );
                            found.insert(public_key.to_string(), descriptor);
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
                found.into_values().collect::<Vec<_>>()
            })
            .await
            .map_err(discovery_err)?;

            if let Err(e) = self.daemon.stop_browse(&self.service_type) {
                debug!(error = %e, "Failed to stop mDNS browse");
            }
            debug!(found = found.len(), "mDNS scan finished");
            Ok(found)
        }

        async fn shutdown(&self) -> MeshResult<()> {
            if let Some(fullname) = self.registered.lock().take() {
                if let Err(e) = self.daemon.unregister(&fullname) {
                    warn!(error = %e, "Failed to unregister mDNS service");
                }
            }
            self.daemon.shutdown().map_err(discovery_err)?;
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use crate::config::DEFAULT_SERVICE_TYPE;

        #[test]
        fn test_service_type_is_valid() {
            assert!(DEFAULT_SERVICE_TYPE.ends_with(".local."));
            assert!(DEFAULT_SERVICE_TYPE.starts_with('_'));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::connection::{ConnectionSupervisor, RecordingTransport};
    use crate::directory::PeerDirectory;
    use crate::events::EventBus;
    use crate::resources::{ResourceMonitor, StaticProbe};
    use crate::state::{MeshState, SharedState};
    use crate::storage::{MemoryStore, Records};
    use crate::types::ResourceSample;

    fn router(max_peers: usize) -> (MessageRouter, SharedState, String) {
        let config = MeshConfig {
            max_peers,
            ..MeshConfig::default()
        };
        let records = Records::new(Arc::new(MemoryStore::new()));
        let state = MeshState::new(
            PeerDirectory::new(config.max_peers, records.clone()),
            records.clone(),
        )
        .shared();
        let events = EventBus::new();
        let local_key = config.identity.public_key.clone();
        let max_message_size = config.max_message_size;
        let supervisor = ConnectionSupervisor::new(
            state.clone(),
            Arc::new(RecordingTransport::new()),
            Arc::new(config),
            events.clone(),
            None,
        );
        let resources = Arc::new(ResourceMonitor::new(
            Arc::new(StaticProbe::new(ResourceSample::empty())),
            records,
            supervisor.clone(),
            events.clone(),
        ));
        let router = MessageRouter::new(
            state.clone(),
            supervisor,
            resources,
            events,
            local_key.clone(),
            max_message_size,
        );
        (router, state, local_key)
    }

    #[tokio::test]
    async fn test_scan_registers_candidates() {
        let (router, state, local_key) = router(10);
        let backend = Arc::new(StaticDiscovery::new(vec![
            PeerDescriptor::new("alice", "alice-key"),
            PeerDescriptor::new("me", local_key.clone()),
        ]));
        let service = DiscoveryService::new(backend.clone(), local_key);

        let first = service.scan_once(&router).await.unwrap();
        let second = service.scan_once(&router).await.unwrap();

        assert_eq!(first.registered, 1);
        assert_eq!(first.found, 1);
        assert_eq!(second.refreshed, 1);
        assert_eq!(state.lock().directory.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_survives_peer_limit() {
        let (router, state, local_key) = router(1);
        let service = DiscoveryService::new(
            Arc::new(StaticDiscovery::new(vec![
                PeerDescriptor::new("alice", "a"),
                PeerDescriptor::new("bob", "b"),
            ])),
            local_key,
        );

        let summary = service.scan_once(&router).await.unwrap();

        assert_eq!(summary.registered, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(state.lock().directory.len(), 1);
    }
}
