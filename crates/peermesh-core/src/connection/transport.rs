//! Signaling transport abstraction.
//!
//! The network core never opens sockets itself: the surrounding application
//! hands it a [`SignalingTransport`] that can deliver an envelope to a peer,
//! and feeds inbound bytes back through `PeerNetwork::handle_inbound`. See
//! [`TcpTransport`](super::TcpTransport) for the socket-backed one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::error::{MeshError, MeshResult};
use crate::protocol::Envelope;
use crate::types::{Peer, PeerId};

/// Delivers envelopes to peers
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send an envelope to a peer
    async fn send(&self, peer_id: &PeerId, envelope: &Envelope) -> MeshResult<()>;

    /// Called before a connection to `peer` is started, so a transport that
    /// needs addresses can read them from the peer's metadata
    fn learn_peer(&self, _peer: &Peer) {}
}

/// Raw inbound payload as handed to the network
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: PeerId,
    pub payload: Vec<u8>,
}

/// In-process switchboard connecting several nodes in one process.
///
/// Each node registers its id and gets back a transport plus the receiver on
/// which envelopes addressed to it arrive (already encoded as bytes).
#[derive(Clone, Default)]
pub struct ChannelHub {
    routes: Arc<RwLock<HashMap<PeerId, mpsc::UnboundedSender<Inbound>>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node to the hub
    pub fn join(&self, local: PeerId) -> (ChannelTransport, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.write().insert(local.clone(), tx);
        (
            ChannelTransport {
                local,
                routes: self.routes.clone(),
            },
            rx,
        )
    }

    /// Detach a node; later sends to it fail
    pub fn leave(&self, peer_id: &PeerId) {
        self.routes.write().remove(peer_id);
    }
}

/// Transport half handed out by [`ChannelHub::join`]
#[derive(Clone)]
pub struct ChannelTransport {
    local: PeerId,
    routes: Arc<RwLock<HashMap<PeerId, mpsc::UnboundedSender<Inbound>>>>,
}

#[async_trait]
impl SignalingTransport for ChannelTransport {
    async fn send(&self, peer_id: &PeerId, envelope: &Envelope) -> MeshResult<()> {
        let payload = envelope.encode()?;
        let route = self.routes.read().get(peer_id).cloned();
        let Some(route) = route else {
            return Err(MeshError::Transport(format!("no route to {}", peer_id.short())));
        };
        route
            .send(Inbound {
                from: self.local.clone(),
                payload,
            })
            .map_err(|_| MeshError::Transport(format!("{} hung up", peer_id.short())))
    }
}

/// Transport that records every send and never delivers anything.
///
/// Peers listed with [`RecordingTransport::fail_for`] get a transport error.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(PeerId, Envelope)>>,
    failing: Mutex<Vec<PeerId>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every send to `peer_id` fail
    pub fn fail_for(&self, peer_id: PeerId) {
        self.failing.lock().push(peer_id);
    }

    /// Envelopes sent so far
    pub fn sent(&self) -> Vec<(PeerId, Envelope)> {
        self.sent.lock().clone()
    }

    /// How many envelopes of a given type went to `peer_id`
    pub fn count(&self, peer_id: &PeerId, kind: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|(to, env)| to == peer_id && env.kind == kind)
            .count()
    }
}

#[async_trait]
impl SignalingTransport for RecordingTransport {
    async fn send(&self, peer_id: &PeerId, envelope: &Envelope) -> MeshResult<()> {
        if self.failing.lock().contains(peer_id) {
            return Err(MeshError::Transport(format!(
                "unreachable: {}",
                peer_id.short()
            )));
        }
        self.sent.lock().push((peer_id.clone(), envelope.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_hub_delivers_with_sender_id() {
        let hub = ChannelHub::new();
        let a = PeerId::from_public_key("a");
        let b = PeerId::from_public_key("b");
        let (transport_a, _rx_a) = hub.join(a.clone());
        let (_transport_b, mut rx_b) = hub.join(b.clone());

        transport_a
            .send(&b, &Envelope::new("PING", json!({})))
            .await
            .unwrap();

        let inbound = rx_b.recv().await.unwrap();
        assert_eq!(inbound.from, a);
        assert_eq!(Envelope::decode(&inbound.payload).unwrap().kind, "PING");
    }

    #[tokio::test]
    async fn test_hub_unknown_route() {
        let hub = ChannelHub::new();
        let (transport, _rx) = hub.join(PeerId::from_public_key("a"));
        let b = PeerId::from_public_key("b");

        let result = transport.send(&b, &Envelope::new("PING", json!({}))).await;
        assert!(matches!(result, Err(MeshError::Transport(_))));
    }

    #[tokio::test]
    async fn test_recording_transport() {
        let transport = RecordingTransport::new();
        let a = PeerId::from_public_key("a");
        let b = PeerId::from_public_key("b");
        transport.fail_for(b.clone());

        transport.send(&a, &Envelope::new("OFFER", json!({}))).await.unwrap();
        assert!(transport.send(&b, &Envelope::new("OFFER", json!({}))).await.is_err());

        assert_eq!(transport.count(&a, "OFFER"), 1);
        assert_eq!(transport.count(&b, "OFFER"), 0);
    }
}
