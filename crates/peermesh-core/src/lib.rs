//! PeerMesh Core Library
//!
//! Headless peer-network node: LAN discovery, supervised peer connections,
//! resource reporting and offline synchronization.
//!
//! ## Overview
//!
//! A node keeps a bounded directory of known peers, drives one connection per
//! peer through an offer/answer handshake with linear-backoff retries and a
//! heartbeat, periodically samples host resources and shares them, and
//! reconciles per-peer version vectors when it reconnects.
//!
//! ## Core Principles
//!
//! - **Local-first**: every record lives in a local redb database
//! - **Bounded**: peer, connection and handshake counts are capped by config
//! - **Transport-agnostic**: signaling goes through [`SignalingTransport`]
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use peermesh_core::{ChannelHub, MeshConfig, PeerDescriptor, PeerNetwork};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MeshConfig::default();
//!     let hub = ChannelHub::new();
//!     let (transport, _inbound) = hub.join(config.identity.peer_id());
//!
//!     let network = PeerNetwork::builder(config)
//!         .transport(Arc::new(transport))
//!         .build()?;
//!     network.start().await;
//!
//!     network.add_peer(PeerDescriptor::new("Alice", "abc123"))?;
//!     for peer in network.peers() {
//!         println!("{} {}", peer.name, peer.status);
//!     }
//!
//!     network.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod events;
pub mod network;
pub mod protocol;
pub mod resources;
pub mod router;
pub mod state;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use config::{ExhaustedPolicy, LocalIdentity, MeshConfig};
pub use connection::{
    BroadcastReport, ChannelHub, ChannelTransport, ConnectionSupervisor, Inbound, PeerRoute,
    RecordingTransport, SignalingTransport, TcpTransport,
};
pub use directory::{PeerDirectory, Registration};
#[cfg(feature = "mdns")]
pub use discovery::MdnsDiscovery;
pub use discovery::{DiscoveryBackend, DiscoveryService, ScanSummary, StaticDiscovery};
pub use error::{MeshError, MeshResult};
pub use events::{EventBus, NetworkEvent};
pub use network::{PeerNetwork, PeerNetworkBuilder};
pub use protocol::{Envelope, IceCandidate, MeshMessage, SessionDescription};
pub use resources::{ResourceMonitor, ResourceProbe, StaticProbe, SystemProbe};
pub use router::{MessageRouter, Routed};
pub use storage::{MemoryStore, RecordStore, Storage};
pub use sync::{
    CounterStrategy, SyncEngine, SyncPeer, SyncPeerProvider, SyncReport, SyncState,
    VectorDiff, VectorStrategy, VersionVector,
};
pub use types::{
    Connection, ConnectionStatus, Peer, PeerDescriptor, PeerId, PeerStatus, ResourceSample,
};
