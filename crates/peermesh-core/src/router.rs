//! Message router
//!
//! Validates inbound envelopes and dispatches them:
//!
//! | type             | handled by                                  |
//! |------------------|---------------------------------------------|
//! | `PEER_ANNOUNCE`  | directory (register/refresh) + supervisor   |
//! | `RESOURCE_UPDATE`| resource monitor (record only)              |
//! | `OFFER`          | supervisor, answered immediately            |
//! | `ANSWER`         | supervisor, completes a pending handshake   |
//! | `ICE_CANDIDATE`  | supervisor, recorded on the connection      |
//!
//! Unknown types are logged and dropped. Malformed envelopes fail with
//! `InvalidMessageFormat` before anything is touched.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connection::ConnectionSupervisor;
use crate::directory::Registration;
use crate::error::{MeshError, MeshResult};
use crate::events::{EventBus, NetworkEvent};
use crate::protocol::{Envelope, MeshMessage};
use crate::resources::ResourceMonitor;
use crate::state::SharedState;
use crate::types::{PeerDescriptor, PeerId};

/// What routing a message did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    PeerRegistered(Registration),
    ResourceRecorded(PeerId),
    /// Offer, answer or ICE candidate handed to the supervisor
    Signaling(&'static str),
    /// Unknown type or our own announcement
    Ignored,
}

/// Dispatches inbound messages to the directory, supervisor and monitor
#[derive(Clone)]
pub struct MessageRouter {
    state: SharedState,
    supervisor: ConnectionSupervisor,
    resources: Arc<ResourceMonitor>,
    events: EventBus,
    local_key: String,
    max_message_size: usize,
}

impl MessageRouter {
    pub fn new(
        state: SharedState,
        supervisor: ConnectionSupervisor,
        resources: Arc<ResourceMonitor>,
        events: EventBus,
        local_key: impl Into<String>,
        max_message_size: usize,
    ) -> Self {
        Self {
            state,
            supervisor,
            resources,
            events,
            local_key: local_key.into(),
            max_message_size,
        }
    }

    /// Register or refresh a peer, then ask the supervisor for a connection.
    ///
    /// Only the directory limit is an error here; a connection that cannot be
    /// started yet is logged and left to a later registration.
    pub fn register_peer(&self, descriptor: PeerDescriptor) -> MeshResult<Registration> {
        let name = descriptor.name.clone();
        let registration = self.state.lock().directory.add_peer(descriptor)?;
        if registration.created {
            self.events.emit(NetworkEvent::PeerAdded {
                peer_id: registration.peer_id.clone(),
                name,
            });
        }

        if let Err(e) = self.supervisor.initialize_connection(&registration.peer_id) {
            warn!(peer_id = %registration.peer_id.short(), error = %e, "Connection not started");
        }
        Ok(registration)
    }

    /// Route raw bytes received from `from`
    pub async fn route_bytes(&self, from: Option<&PeerId>, bytes: &[u8]) -> MeshResult<Routed> {
        if bytes.len() > self.max_message_size {
            return Err(MeshError::MessageTooLarge {
                size: bytes.len(),
                max: self.max_message_size,
            });
        }
        self.dispatch(from, Envelope::decode(bytes)?).await
    }

    /// Route an already-parsed JSON message
    pub async fn route(&self, from: Option<&PeerId>, message: Value) -> MeshResult<Routed> {
        self.dispatch(from, Envelope::from_value(message)?).await
    }

    async fn dispatch(&self, from: Option<&PeerId>, envelope: Envelope) -> MeshResult<Routed> {
        let Some(message) = MeshMessage::from_envelope(&envelope)? else {
            debug!(kind = %envelope.kind, "Dropping message of unknown type");
            return Ok(Routed::Ignored);
        };

        if let Some(from) = from {
            self.supervisor.note_activity(from)?;
        }

        match message {
            MeshMessage::PeerAnnounce(descriptor) => {
                if descriptor.public_key == self.local_key {
                    debug!("Ignoring our own announcement");
                    return Ok(Routed::Ignored);
                }
                let registration = self.register_peer(descriptor)?;
                info!(peer_id = %registration.peer_id.short(), created = registration.created, "Peer announced");
                Ok(Routed::PeerRegistered(registration))
            }
            MeshMessage::ResourceUpdate(sample) => {
                let from = Self::sender(from, "RESOURCE_UPDATE")?;
                // Holding the lock keeps a concurrent removal from orphaning the sample
                let state = self.state.lock();
                if !state.directory.contains(from) {
                    return Err(MeshError::PeerNotFound(from.clone()));
                }
                self.resources.record_remote(from, &sample)?;
                Ok(Routed::ResourceRecorded(from.clone()))
            }
            MeshMessage::Offer(offer) => {
                let from = Self::sender(from, "OFFER")?;
                self.supervisor.handle_offer(from, offer).await?;
                Ok(Routed::Signaling(crate::protocol::OFFER))
            }
            MeshMessage::Answer(answer) => {
                let from = Self::sender(from, "ANSWER")?;
                self.supervisor.handle_answer(from, answer)?;
                Ok(Routed::Signaling(crate::protocol::ANSWER))
            }
            MeshMessage::IceCandidate(candidate) => {
                let from = Self::sender(from, "ICE_CANDIDATE")?;
                self.supervisor.handle_ice_candidate(from, candidate)?;
                Ok(Routed::Signaling(crate::protocol::ICE_CANDIDATE))
            }
        }
    }

    fn sender<'a>(from: Option<&'a PeerId>, kind: &str) -> MeshResult<&'a PeerId> {
        from.ok_or_else(|| MeshError::InvalidMessageFormat(format!("{kind} without a sender")))
    }
}
