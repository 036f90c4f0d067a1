//! Wire protocol
//!
//! Every message is a JSON envelope `{ "type": <string>, "data": <any> }`.
//! Six types are understood:
//!
//! | type              | data                    | handled by            |
//! |-------------------|-------------------------|-----------------------|
//! | `PEER_ANNOUNCE`   | [`PeerDescriptor`]      | peer directory        |
//! | `RESOURCE_UPDATE` | [`ResourceSample`]      | resource monitor      |
//! | `OFFER`           | [`SessionDescription`]  | connection supervisor |
//! | `ANSWER`          | [`SessionDescription`]  | connection supervisor |
//! | `ICE_CANDIDATE`   | [`IceCandidate`]        | connection supervisor |
//!
//! Anything else that is a well-formed envelope is logged and dropped.
//!
//! ## Handshake
//!
//! ```text
//! Node A                               Node B
//!   |--- OFFER {sessionId: s1} -------->|
//!   |<-- ANSWER {sessionId: s1} --------|  (B: connected)
//!   |    (A: connected)                 |
//!   |<-> ICE_CANDIDATE ... ------------>|
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MeshError, MeshResult};
use crate::types::{PeerDescriptor, ResourceSample};

pub const PEER_ANNOUNCE: &str = "PEER_ANNOUNCE";
pub const RESOURCE_UPDATE: &str = "RESOURCE_UPDATE";
pub const OFFER: &str = "OFFER";
pub const ANSWER: &str = "ANSWER";
pub const ICE_CANDIDATE: &str = "ICE_CANDIDATE";

/// Transport-agnostic JSON envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Validate an arbitrary JSON value as an envelope.
    ///
    /// It must be an object with a string `type` and a `data` key (any value,
    /// including `null` or `{}`).
    pub fn from_value(value: Value) -> MeshResult<Self> {
        let Value::Object(mut map) = value else {
            return Err(MeshError::InvalidMessageFormat(
                "message is not an object".into(),
            ));
        };

        let kind = match map.remove("type") {
            Some(Value::String(kind)) => kind,
            Some(_) => {
                return Err(MeshError::InvalidMessageFormat(
                    "`type` is not a string".into(),
                ))
            }
            None => return Err(MeshError::InvalidMessageFormat("missing `type`".into())),
        };

        let data = map
            .remove("data")
            .ok_or_else(|| MeshError::InvalidMessageFormat("missing `data`".into()))?;

        Ok(Self { kind, data })
    }

    /// Parse and validate raw bytes
    pub fn decode(bytes: &[u8]) -> MeshResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| MeshError::InvalidMessageFormat(format!("not JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Local or remote session description exchanged during the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    pub session_id: String,
    pub sdp: String,
    #[serde(default)]
    pub ice_servers: Vec<String>,
}

impl SessionDescription {
    /// Build a fresh offer with a random session id
    pub fn offer(ice_servers: &[String]) -> Self {
        use rand::RngCore;

        let mut raw = [0u8; 16];
        rand::rng().fill_bytes(&mut raw);
        let session_id = hex::encode(raw);
        let sdp = format!("v=0\r\no=- {session_id} 1 IN IP4 0.0.0.0\r\ns=peermesh\r\nt=0 0\r\n");

        Self {
            session_id,
            sdp,
            ice_servers: ice_servers.to_vec(),
        }
    }

    /// The answer to this offer, echoing its session id
    pub fn answer(&self) -> Self {
        Self {
            session_id: self.session_id.clone(),
            sdp: format!(
                "v=0\r\no=- {} 2 IN IP4 0.0.0.0\r\ns=peermesh\r\nt=0 0\r\n",
                self.session_id
            ),
            ice_servers: Vec::new(),
        }
    }
}

/// Trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u32>,
}

/// Typed view of a recognized envelope
#[derive(Debug, Clone, PartialEq)]
pub enum MeshMessage {
    PeerAnnounce(PeerDescriptor),
    ResourceUpdate(ResourceSample),
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl MeshMessage {
    /// Interpret an envelope.
    ///
    /// Returns `Ok(None)` for unknown types; a known type whose `data` does not
    /// fit its payload is `InvalidMessageFormat`.
    pub fn from_envelope(envelope: &Envelope) -> MeshResult<Option<Self>> {
        fn payload<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> MeshResult<T> {
            serde_json::from_value(envelope.data.clone()).map_err(|e| {
                MeshError::InvalidMessageFormat(format!("bad {} payload: {e}", envelope.kind))
            })
        }

        let message = match envelope.kind.as_str() {
            PEER_ANNOUNCE => MeshMessage::PeerAnnounce(payload(envelope)?),
            RESOURCE_UPDATE => MeshMessage::ResourceUpdate(payload(envelope)?),
            OFFER => MeshMessage::Offer(payload(envelope)?),
            ANSWER => MeshMessage::Answer(payload(envelope)?),
            ICE_CANDIDATE => MeshMessage::IceCandidate(payload(envelope)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MeshMessage::PeerAnnounce(_) => PEER_ANNOUNCE,
            MeshMessage::ResourceUpdate(_) => RESOURCE_UPDATE,
            MeshMessage::Offer(_) => OFFER,
            MeshMessage::Answer(_) => ANSWER,
            MeshMessage::IceCandidate(_) => ICE_CANDIDATE,
        }
    }

    pub fn to_envelope(&self) -> MeshResult<Envelope> {
        let data = match self {
            MeshMessage::PeerAnnounce(d) => serde_json::to_value(d)?,
            MeshMessage::ResourceUpdate(s) => serde_json::to_value(s)?,
            MeshMessage::Offer(s) | MeshMessage::Answer(s) => serde_json::to_value(s)?,
            MeshMessage::IceCandidate(c) => serde_json::to_value(c)?,
        };
        Ok(Envelope::new(self.kind(), data))
    }
}
