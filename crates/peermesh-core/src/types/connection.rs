//! Connection records and the per-peer connection state machine
//!
//! ```text
//!                 OfferSent / RemoteOffer
//!   ┌──────────────┐   AnswerApplied    ┌───────────┐
//!   │ Initializing │ ─────────────────▶ │ Connected │ ◀─┐ Activity
//!   └──────────────┘                    └───────────┘ ──┘
//!      ▲   │ Failed                         │ TimedOut
//!      │   ▼                                ▼
//!      │ ┌────────┐        Close      ┌──────────┐
//!      └─│ Closed │ ◀──────────────── │ TimedOut │
//! Retry  └────────┘                   └──────────┘
//! ```
//!
//! Transitions are a pure table ([`ConnectionStatus::apply`]); the supervisor
//! feeds events and persists whatever state comes out.

use serde::{Deserialize, Serialize};

use super::{now_millis, ConnectionId, PeerId};

/// Status of a supervised connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Initializing,
    Connected,
    TimedOut,
    Closed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Initializing => write!(f, "initializing"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::TimedOut => write!(f, "timed-out"),
            ConnectionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Inputs to the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Local offer transmitted
    OfferSent,
    /// Peer's answer applied to our offer
    AnswerApplied,
    /// Peer offered and we answered
    RemoteOffer,
    /// Any traffic on the link
    Activity,
    /// Heartbeat found `lastActive` too old
    TimedOut,
    /// Establishment failed
    Failed,
    /// Retry policy scheduled a new attempt
    Retry,
    /// Teardown
    Close,
}

impl ConnectionStatus {
    /// Transition table keyed by (state, event).
    ///
    /// Returns `None` when the event is not valid in this state.
    pub fn apply(self, event: ConnectionEvent) -> Option<ConnectionStatus> {
        use ConnectionEvent as E;
        use ConnectionStatus as S;

        match (self, event) {
            (S::Initializing, E::OfferSent) => Some(S::Initializing),
            (S::Initializing, E::AnswerApplied) => Some(S::Connected),
            (S::Initializing, E::RemoteOffer) => Some(S::Connected),
            (S::Initializing, E::Failed) => Some(S::Closed),

            (S::Connected, E::Activity) => Some(S::Connected),
            (S::Connected, E::RemoteOffer) => Some(S::Connected),
            (S::Connected, E::TimedOut) => Some(S::TimedOut),

            (S::TimedOut, E::Retry) => Some(S::Initializing),
            (S::TimedOut, E::RemoteOffer) => Some(S::Connected),

            // A peer that renegotiates after we gave up brings the link back
            (S::Closed, E::RemoteOffer) => Some(S::Connected),
            (S::Closed, E::Retry) => Some(S::Initializing),

            (_, E::Close) => Some(S::Closed),
            _ => None,
        }
    }

    /// Whether the link can carry application traffic
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }

    /// Whether the record still counts against `maxConnections`
    pub fn is_active(self) -> bool {
        self != ConnectionStatus::Closed
    }
}

/// Persisted connection record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub peer_id: PeerId,
    pub status: ConnectionStatus,
    /// Unix millis when the link last reached `connected`
    pub established: Option<i64>,
    /// Unix millis of the last traffic on the link
    pub last_active: i64,
    /// Automatic re-establishment attempts since the record was created
    pub retries: u32,
    /// Local session id of the handshake in flight, if any
    #[serde(default)]
    pub session_id: Option<String>,
    /// Remote ICE candidates received for the current session
    #[serde(default)]
    pub remote_candidates: Vec<String>,
}

impl Connection {
    /// A fresh record in `initializing` with `retries = 0`
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            id: ConnectionId::new(),
            peer_id,
            status: ConnectionStatus::Initializing,
            established: None,
            last_active: now_millis(),
            retries: 0,
            session_id: None,
            remote_candidates: Vec::new(),
        }
    }

    /// Feed an event through the transition table.
    ///
    /// Returns the new status, or `None` (record untouched) if the event is
    /// invalid for the current status.
    pub fn apply(&mut self, event: ConnectionEvent) -> Option<ConnectionStatus> {
        let next = self.status.apply(event)?;
        let now = now_millis();

        if next == ConnectionStatus::Connected && self.status != ConnectionStatus::Connected {
            self.established = Some(now);
        }
        if matches!(
            event,
            ConnectionEvent::AnswerApplied | ConnectionEvent::RemoteOffer | ConnectionEvent::Activity
        ) {
            self.last_active = now;
        }
        if event == ConnectionEvent::Retry {
            self.session_id = None;
            self.remote_candidates.clear();
        }

        self.status = next;
        Some(next)
    }

    /// Milliseconds since the last traffic
    pub fn idle_millis(&self, now: i64) -> i64 {
        now.saturating_sub(self.last_active)
    }
}
