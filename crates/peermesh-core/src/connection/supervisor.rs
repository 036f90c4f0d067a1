//! Connection supervisor
//!
//! Owns every [`Connection`] record and drives its state machine:
//! offer/answer exchange, heartbeat timeout detection, and bounded retry with
//! linear backoff.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ConnectionSupervisor                                           │
//! │  ├── tasks: HashMap<PeerId, JoinHandle>                         │
//! │  │   └── at most one establishment / scheduled retry per peer   │
//! │  ├── pending_answers: HashMap<PeerId, oneshot::Sender>          │
//! │  │   └── completed by the router when ANSWER arrives            │
//! │  ├── handshake_slots: Semaphore(maxPendingConnections)          │
//! │  └── state: SharedState (directory + connection table)          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Establishment and timeout failures never surface to callers: they are
//! handed to the retry policy, and once `maxRetries` is spent the connection
//! simply stays `closed` (callers poll [`ConnectionSupervisor::connection`]).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::transport::SignalingTransport;
use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::events::{EventBus, NetworkEvent};
use crate::protocol::{Envelope, IceCandidate, MeshMessage, SessionDescription};
use crate::state::{MeshState, SharedState};
use crate::types::{
    now_millis, Connection, ConnectionEvent, ConnectionStatus, PeerId, PeerStatus,
};

/// Remote candidates kept per session
const MAX_REMOTE_CANDIDATES: usize = 32;

/// Per-peer result of [`ConnectionSupervisor::broadcast`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<PeerId>,
    pub failed: Vec<PeerId>,
}

/// What the retry policy decided after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryDecision {
    /// Transition not applicable (e.g. link already healthy again)
    Ignored,
    Scheduled { attempt: u32 },
    Exhausted { retries: u32 },
}

struct PendingAnswer {
    session_id: String,
    tx: oneshot::Sender<SessionDescription>,
}

struct Inner {
    state: SharedState,
    transport: Arc<dyn SignalingTransport>,
    config: Arc<MeshConfig>,
    events: EventBus,
    handshake_slots: Arc<Semaphore>,
    closed: AtomicBool,
    tasks: Mutex<HashMap<PeerId, JoinHandle<()>>>,
    pending_answers: Mutex<HashMap<PeerId, PendingAnswer>>,
    exhausted_tx: Option<mpsc::UnboundedSender<PeerId>>,
}

/// Supervises one connection per known peer
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    /// Create a supervisor over the shared peer/connection state.
    ///
    /// `exhausted_tx`, when given, receives the id of every peer whose retry
    /// budget runs out.
    pub fn new(
        state: SharedState,
        transport: Arc<dyn SignalingTransport>,
        config: Arc<MeshConfig>,
        events: EventBus,
        exhausted_tx: Option<mpsc::UnboundedSender<PeerId>>,
    ) -> Self {
        let handshake_slots = Arc::new(Semaphore::new(config.max_pending_connections));
        Self {
            inner: Arc::new(Inner {
                state,
                transport,
                config,
                events,
                handshake_slots,
                closed: AtomicBool::new(false),
                tasks: Mutex::new(HashMap::new()),
                pending_answers: Mutex::new(HashMap::new()),
                exhausted_tx,
            }),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    /// Current record for a peer
    pub fn connection(&self, peer_id: &PeerId) -> Option<Connection> {
        self.inner.state.lock().connections.get(peer_id).cloned()
    }

    /// Snapshot of every record
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.state.lock().connections.iter().cloned().collect()
    }

    /// Connections that are not `closed`
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().connections.active_count()
    }

    /// Peers whose link is `connected`
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.state.lock().connections.connected_peers()
    }

    /// Whether the retry policy would schedule another attempt for this peer
    pub fn should_retry_connection(&self, peer_id: &PeerId) -> bool {
        self.inner
            .state
            .lock()
            .connections
            .get(peer_id)
            .is_some_and(|c| c.retries < self.inner.config.max_retries)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Establishment
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a fresh connection record for a known peer and start the
    /// offer/answer exchange in the background.
    ///
    /// A peer whose connection is already active is left alone. A `closed`
    /// connection is replaced, which resets its retry counter.
    ///
    /// # Errors
    ///
    /// - `PeerNotFound` if the peer is not in the directory
    /// - `ConnectionLimitExceeded` if `maxConnections` connections are active
    pub fn initialize_connection(&self, peer_id: &PeerId) -> MeshResult<()> {
        let peer = self.inner.state.lock().directory.get(peer_id).cloned();
        let Some(peer) = peer else {
            return Err(MeshError::PeerNotFound(peer_id.clone()));
        };
        self.inner.transport.learn_peer(&peer);

        {
            let mut state = self.inner.state.lock();
            if !state.directory.contains(peer_id) {
                return Err(MeshError::PeerNotFound(peer_id.clone()));
            }
            if let Some(existing) = state.connections.get(peer_id) {
                if existing.status.is_active() {
                    debug!(peer_id = %peer_id.short(), status = %existing.status, "Connection already active");
                    return Ok(());
                }
            }
            let max = self.inner.config.max_connections;
            if state.connections.active_count() >= max {
                return Err(MeshError::ConnectionLimitExceeded { max });
            }
            state.connections.insert(Connection::new(peer_id.clone()))?;
        }

        info!(peer_id = %peer_id.short(), "Initializing connection");
        self.emit_status(peer_id, ConnectionStatus::Initializing);

        // A retry scheduled for the replaced record must not fire
        self.abort_task(peer_id);
        self.spawn_establish(peer_id.clone());
        Ok(())
    }

    fn spawn_establish(&self, peer_id: PeerId) {
        let mut tasks = self.inner.tasks.lock();
        if self.is_shut_down() {
            return;
        }
        if let Some(handle) = tasks.get(&peer_id) {
            if !handle.is_finished() {
                debug!(peer_id = %peer_id.short(), "Establishment already in flight");
                return;
            }
        }
        let this = self.clone();
        let id = peer_id.clone();
        let handle = tokio::spawn(async move { this.establish(id).await });
        tasks.insert(peer_id, handle);
    }

    fn abort_task(&self, peer_id: &PeerId) {
        if let Some(handle) = self.inner.tasks.lock().remove(peer_id) {
            handle.abort();
        }
    }

    /// Run one establishment attempt and hand any failure to the retry policy
    async fn establish(&self, peer_id: PeerId) {
        if let Err(e) = self.try_establish(&peer_id).await {
            warn!(peer_id = %peer_id.short(), error = %e, "Connection establishment failed");
            self.handle_failure(&peer_id, ConnectionEvent::Failed);
        }
    }

    async fn try_establish(&self, peer_id: &PeerId) -> MeshResult<()> {
        let failed = |reason: String| MeshError::ConnectionEstablishmentFailed {
            peer_id: peer_id.clone(),
            reason,
        };

        let _slot = self
            .inner
            .handshake_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| failed("supervisor shut down".into()))?;

        let offer = SessionDescription::offer(&self.inner.config.ice_servers);
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            match state.connections.get(peer_id).map(|c| c.status) {
                Some(ConnectionStatus::Initializing) => {}
                // The peer's own offer got there first
                Some(ConnectionStatus::Connected) => return Ok(()),
                Some(status) => return Err(failed(format!("connection is {status}"))),
                None => return Err(failed("connection removed".into())),
            }
            let session_id = offer.session_id.clone();
            state
                .connections
                .update(peer_id, |c| c.session_id = Some(session_id))?;
            state.connections.apply(peer_id, ConnectionEvent::OfferSent)?;
        }
        self.inner.pending_answers.lock().insert(
            peer_id.clone(),
            PendingAnswer {
                session_id: offer.session_id.clone(),
                tx,
            },
        );

        let session_id = offer.session_id.clone();
        let envelope = MeshMessage::Offer(offer).to_envelope()?;
        if let Err(e) = self.inner.transport.send(peer_id, &envelope).await {
            self.drop_pending_answer(peer_id, &session_id);
            return Err(failed(e.to_string()));
        }
        debug!(peer_id = %peer_id.short(), session = %session_id, "Offer sent");

        let answer = match tokio::time::timeout(self.inner.config.connection_timeout(), rx).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => return Err(failed("handshake cancelled".into())),
            Err(_) => {
                self.drop_pending_answer(peer_id, &session_id);
                // Glare: the peer's own offer connected us while we waited
                let connected = self
                    .inner
                    .state
                    .lock()
                    .connections
                    .get(peer_id)
                    .is_some_and(|c| c.status.is_connected());
                if connected {
                    debug!(peer_id = %peer_id.short(), "No answer but already connected");
                    return Ok(());
                }
                return Err(failed(format!(
                    "no answer within {}ms",
                    self.inner.config.connection_timeout_ms
                )));
            }
        };

        let (status, newly_connected) = {
            let mut state = self.inner.state.lock();
            let was_connected = state
                .connections
                .get(peer_id)
                .is_some_and(|c| c.status.is_connected());
            let event = if was_connected {
                ConnectionEvent::Activity
            } else {
                ConnectionEvent::AnswerApplied
            };
            let status = state.connections.apply(peer_id, event)?;
            if status == Some(ConnectionStatus::Connected) && !was_connected {
                state.directory.mark(peer_id, PeerStatus::Connected)?;
            }
            (status, !was_connected)
        };

        match status {
            Some(ConnectionStatus::Connected) => {
                if newly_connected {
                    info!(peer_id = %peer_id.short(), session = %answer.session_id, "Connection established");
                    self.emit_status(peer_id, ConnectionStatus::Connected);
                }
                Ok(())
            }
            other => Err(failed(format!("answer arrived while {other:?}"))),
        }
    }

    fn drop_pending_answer(&self, peer_id: &PeerId, session_id: &str) {
        let mut pending = self.inner.pending_answers.lock();
        if pending
            .get(peer_id)
            .is_some_and(|p| p.session_id == session_id)
        {
            pending.remove(peer_id);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Retry policy
    // ═══════════════════════════════════════════════════════════════════════

    /// Close the connection and, budget permitting, schedule another attempt
    /// after `retryDelay * retries` (retries incremented first).
    fn handle_failure(&self, peer_id: &PeerId, event: ConnectionEvent) {
        let max_retries = self.inner.config.max_retries;
        let decision = {
            let mut state = self.inner.state.lock();
            match Self::close_for_retry(&mut state, peer_id, event, max_retries) {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(peer_id = %peer_id.short(), error = %e, "Failed to record connection failure");
                    return;
                }
            }
        };

        match decision {
            RetryDecision::Ignored => {}
            RetryDecision::Scheduled { attempt } => {
                self.emit_status(peer_id, ConnectionStatus::Closed);
                let delay = self.inner.config.backoff_for(attempt);
                info!(
                    peer_id = %peer_id.short(),
                    attempt,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling connection retry"
                );
                self.schedule_retry(peer_id.clone(), delay);
            }
            RetryDecision::Exhausted { retries } => {
                self.emit_status(peer_id, ConnectionStatus::Closed);
                warn!(peer_id = %peer_id.short(), retries, "Retries exhausted, connection stays closed");
                self.inner.events.emit(NetworkEvent::RetriesExhausted {
                    peer_id: peer_id.clone(),
                    retries,
                });
                if let Some(tx) = &self.inner.exhausted_tx {
                    let _ = tx.send(peer_id.clone());
                }
            }
        }
    }

    fn close_for_retry(
        state: &mut MeshState,
        peer_id: &PeerId,
        event: ConnectionEvent,
        max_retries: u32,
    ) -> MeshResult<RetryDecision> {
        if state.connections.apply(peer_id, event)?.is_none() {
            return Ok(RetryDecision::Ignored);
        }
        if state
            .directory
            .get(peer_id)
            .is_some_and(|p| p.status == PeerStatus::Connected)
        {
            state.directory.mark(peer_id, PeerStatus::Disconnected)?;
        }

        let retries = state
            .connections
            .get(peer_id)
            .map_or(max_retries, |c| c.retries);
        if retries >= max_retries {
            return Ok(RetryDecision::Exhausted { retries });
        }

        let attempt = retries + 1;
        state.connections.update(peer_id, |c| c.retries = attempt)?;
        Ok(RetryDecision::Scheduled { attempt })
    }

    fn schedule_retry(&self, peer_id: PeerId, delay: Duration) {
        let mut tasks = self.inner.tasks.lock();
        if self.is_shut_down() {
            debug!(peer_id = %peer_id.short(), "Supervisor shut down, retry dropped");
            return;
        }
        let this = self.clone();
        let id = peer_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.retry_now(id).await;
        });
        tasks.insert(peer_id, handle);
    }

    async fn retry_now(&self, peer_id: PeerId) {
        let reopened = {
            let mut state = self.inner.state.lock();
            match state.connections.get(&peer_id).map(|c| c.status) {
                Some(ConnectionStatus::Closed) => {
                    state.connections.apply(&peer_id, ConnectionEvent::Retry)
                }
                // Removed, re-initialized or revived by the peer meanwhile
                _ => Ok(None),
            }
        };

        match reopened {
            Ok(Some(status)) => {
                debug!(peer_id = %peer_id.short(), "Retrying connection");
                self.emit_status(&peer_id, status);
                self.establish(peer_id).await;
            }
            Ok(None) => debug!(peer_id = %peer_id.short(), "Retry no longer needed"),
            Err(e) => warn!(peer_id = %peer_id.short(), error = %e, "Failed to reopen connection"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Heartbeat
    // ═══════════════════════════════════════════════════════════════════════

    /// Mark every `connected` link idle for longer than the connection
    /// timeout as `timed-out` and hand it to the retry policy.
    ///
    /// Returns the peers that timed out.
    pub fn check_timeouts(&self) -> Vec<PeerId> {
        let now = now_millis();
        let timeout = i64::try_from(self.inner.config.connection_timeout_ms).unwrap_or(i64::MAX);

        let timed_out: Vec<PeerId> = {
            let mut state = self.inner.state.lock();
            let stale: Vec<PeerId> = state
                .connections
                .iter()
                .filter(|c| c.status.is_connected() && c.idle_millis(now) > timeout)
                .map(|c| c.peer_id.clone())
                .collect();
            stale
                .into_iter()
                .filter(|peer_id| {
                    match state.connections.apply(peer_id, ConnectionEvent::TimedOut) {
                        Ok(status) => status.is_some(),
                        Err(e) => {
                            warn!(peer_id = %peer_id.short(), error = %e, "Failed to persist timeout");
                            false
                        }
                    }
                })
                .collect()
        };

        for peer_id in &timed_out {
            warn!(peer_id = %peer_id.short(), timeout_ms = timeout, "Connection timed out");
            self.emit_status(peer_id, ConnectionStatus::TimedOut);
            self.handle_failure(peer_id, ConnectionEvent::Close);
        }
        timed_out
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound signaling
    // ═══════════════════════════════════════════════════════════════════════

    /// Answer a peer's offer and mark the link connected on our side
    pub async fn handle_offer(&self, from: &PeerId, offer: SessionDescription) -> MeshResult<()> {
        let status = {
            let mut state = self.inner.state.lock();
            if !state.directory.contains(from) {
                return Err(MeshError::PeerNotFound(from.clone()));
            }
            let existing = state.connections.get(from).map(|c| c.status);
            // Reviving a closed link counts against the limit like a new one
            if !existing.is_some_and(ConnectionStatus::is_active) {
                let max = self.inner.config.max_connections;
                if state.connections.active_count() >= max {
                    return Err(MeshError::ConnectionLimitExceeded { max });
                }
            }
            if existing.is_none() {
                state.connections.insert(Connection::new(from.clone()))?;
            }
            let session_id = offer.session_id.clone();
            state.connections.update(from, |c| {
                c.session_id = Some(session_id);
                c.remote_candidates.clear();
            })?;
            let was_connected = state
                .connections
                .get(from)
                .is_some_and(|c| c.status.is_connected());
            let status = state.connections.apply(from, ConnectionEvent::RemoteOffer)?;
            if status == Some(ConnectionStatus::Connected) && !was_connected {
                state.directory.mark(from, PeerStatus::Connected)?;
                Some((ConnectionStatus::Connected, true))
            } else {
                status.map(|s| (s, false))
            }
        };

        let Some((_, newly_connected)) = status else {
            debug!(peer_id = %from.short(), "Ignoring offer in current state");
            return Ok(());
        };
        if newly_connected {
            info!(peer_id = %from.short(), session = %offer.session_id, "Accepted offer");
            self.emit_status(from, ConnectionStatus::Connected);
        }

        let answer = MeshMessage::Answer(offer.answer()).to_envelope()?;
        if let Err(e) = self.inner.transport.send(from, &answer).await {
            warn!(peer_id = %from.short(), error = %e, "Failed to send answer");
            self.handle_failure(from, ConnectionEvent::Close);
        }
        Ok(())
    }

    /// Complete the pending handshake whose session the answer echoes
    pub fn handle_answer(&self, from: &PeerId, answer: SessionDescription) -> MeshResult<()> {
        let mut pending = self.inner.pending_answers.lock();
        match pending.remove(from) {
            Some(waiting) if waiting.session_id == answer.session_id => {
                let _ = waiting.tx.send(answer);
            }
            Some(waiting) => {
                debug!(peer_id = %from.short(), session = %answer.session_id, "Answer for stale session");
                pending.insert(from.clone(), waiting);
            }
            None => debug!(peer_id = %from.short(), "Unsolicited answer"),
        }
        Ok(())
    }

    /// Record a trickled candidate on the peer's connection
    pub fn handle_ice_candidate(&self, from: &PeerId, candidate: IceCandidate) -> MeshResult<()> {
        let mut state = self.inner.state.lock();
        if !state.directory.contains(from) {
            return Err(MeshError::PeerNotFound(from.clone()));
        }
        let recorded = state.connections.update(from, |c| {
            if c.remote_candidates.len() < MAX_REMOTE_CANDIDATES {
                c.remote_candidates.push(candidate.candidate);
            }
        })?;
        if !recorded {
            debug!(peer_id = %from.short(), "ICE candidate without connection");
        }
        Ok(())
    }

    /// Inbound traffic from a peer: refresh `lastActive` and `lastSeen`
    pub fn note_activity(&self, peer_id: &PeerId) -> MeshResult<()> {
        let mut state = self.inner.state.lock();
        if state
            .connections
            .get(peer_id)
            .is_some_and(|c| c.status.is_connected())
        {
            state.connections.apply(peer_id, ConnectionEvent::Activity)?;
        }
        state.directory.touch(peer_id)
    }

    fn mark_link_active(&self, peer_id: &PeerId) {
        let mut state = self.inner.state.lock();
        if state
            .connections
            .get(peer_id)
            .is_some_and(|c| c.status.is_connected())
        {
            if let Err(e) = state.connections.apply(peer_id, ConnectionEvent::Activity) {
                debug!(peer_id = %peer_id.short(), error = %e, "Failed to persist activity");
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Outbound
    // ═══════════════════════════════════════════════════════════════════════

    /// Send to one peer
    pub async fn send_to(&self, peer_id: &PeerId, envelope: &Envelope) -> MeshResult<()> {
        self.inner.transport.send(peer_id, envelope).await?;
        self.mark_link_active(peer_id);
        Ok(())
    }

    /// Send to every `connected` peer concurrently.
    ///
    /// Per-peer failures are logged and reported, never propagated.
    pub async fn broadcast(&self, envelope: &Envelope) -> BroadcastReport {
        let targets = self.connected_peers();
        let transport = &self.inner.transport;

        let sends = targets.into_iter().map(|peer_id| async move {
            let result = transport.send(&peer_id, envelope).await;
            (peer_id, result)
        });

        let mut report = BroadcastReport::default();
        for (peer_id, result) in join_all(sends).await {
            match result {
                Ok(()) => {
                    self.mark_link_active(&peer_id);
                    report.delivered.push(peer_id);
                }
                Err(e) => {
                    warn!(peer_id = %peer_id.short(), kind = %envelope.kind, error = %e, "Broadcast send failed");
                    report.failed.push(peer_id);
                }
            }
        }
        report
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Teardown
    // ═══════════════════════════════════════════════════════════════════════

    /// Cancel any in-flight establishment or scheduled retry for the peer
    /// and drop its connection record.
    pub fn close(&self, peer_id: &PeerId) -> MeshResult<()> {
        self.abort_task(peer_id);
        self.inner.pending_answers.lock().remove(peer_id);
        let removed = self.inner.state.lock().connections.remove(peer_id)?;
        if removed.is_some() {
            debug!(peer_id = %peer_id.short(), "Connection released");
            self.emit_status(peer_id, ConnectionStatus::Closed);
        }
        Ok(())
    }

    /// Abort every background task and wait for each to finish; records are
    /// left as they are.
    ///
    /// Tasks hold clones of the supervisor (and through it the transport and
    /// the record store), so those are released once this returns. No new
    /// task is spawned afterwards.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.handshake_slots.close();
        self.inner.pending_answers.lock().clear();

        loop {
            let tasks: Vec<_> = self.inner.tasks.lock().drain().collect();
            if tasks.is_empty() {
                break;
            }
            for (peer_id, handle) in tasks {
                debug!(peer_id = %peer_id.short(), "Aborting connection task");
                handle.abort();
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        warn!(peer_id = %peer_id.short(), error = %e, "Connection task ended abnormally");
                    }
                }
            }
        }
    }

    fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn emit_status(&self, peer_id: &PeerId, status: ConnectionStatus) {
        self.inner.events.emit(NetworkEvent::ConnectionChanged {
            peer_id: peer_id.clone(),
            status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::RecordingTransport;
    use crate::directory::PeerDirectory;
    use crate::protocol::{ANSWER, OFFER};
    use crate::state::MeshState;
    use crate::storage::{MemoryStore, Records};
    use crate::types::PeerDescriptor;

    struct Harness {
        supervisor: ConnectionSupervisor,
        state: SharedState,
        transport: Arc<RecordingTransport>,
        events: EventBus,
    }

    fn harness(config: MeshConfig) -> Harness {
        let records = Records::new(Arc::new(MemoryStore::new()));
        let state = MeshState::new(
            PeerDirectory::new(config.max_peers, records.clone()),
            records,
        )
        .shared();
        let transport = Arc::new(RecordingTransport::new());
        let events = EventBus::new();
        let supervisor = ConnectionSupervisor::new(
            state.clone(),
            transport.clone(),
            Arc::new(config),
            events.clone(),
            None,
        );
        Harness {
            supervisor,
            state,
            transport,
            events,
        }
    }

    fn fast_config() -> MeshConfig {
        MeshConfig {
            retry_delay_ms: 10,
            connection_timeout_ms: 200,
            ..MeshConfig::default()
        }
    }

    fn add_peer(h: &Harness, key: &str) -> PeerId {
        h.state
            .lock()
            .directory
            .add_peer(PeerDescriptor::new(key, key))
            .unwrap()
            .peer_id
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn last_offer(h: &Harness, peer_id: &PeerId) -> SessionDescription {
        let (_, env) = h
            .transport
            .sent()
            .into_iter()
            .filter(|(to, env)| to == peer_id && env.kind == OFFER)
            .last()
            .unwrap();
        serde_json::from_value(env.data).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_sends_offer() {
        let h = harness(fast_config());
        let peer = add_peer(&h, "alice");

        h.supervisor.initialize_connection(&peer).unwrap();

        let conn = h.supervisor.connection(&peer).unwrap();
        assert_eq!(conn.status, ConnectionStatus::Initializing);
        assert_eq!(conn.retries, 0);
        eventually(|| h.transport.count(&peer, OFFER) == 1).await;
    }

    #[tokio::test]
    async fn test_initialize_unknown_peer() {
        let h = harness(fast_config());
        let result = h
            .supervisor
            .initialize_connection(&PeerId::from_public_key("ghost"));
        assert!(matches!(result, Err(MeshError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_answer_completes_handshake() {
        let h = harness(fast_config());
        let peer = add_peer(&h, "alice");
        h.supervisor.initialize_connection(&peer).unwrap();
        eventually(|| h.transport.count(&peer, OFFER) == 1).await;

        let offer = last_offer(&h, &peer);
        h.supervisor.handle_answer(&peer, offer.answer()).unwrap();

        eventually(|| {
            h.supervisor
                .connection(&peer)
                .is_some_and(|c| c.status == ConnectionStatus::Connected)
        })
        .await;
        let conn = h.supervisor.connection(&peer).unwrap();
        assert!(conn.established.is_some());
        assert_eq!(
            h.state.lock().directory.get(&peer).unwrap().status,
            PeerStatus::Connected
        );
    }

    #[tokio::test]
    async fn test_stale_answer_is_ignored() {
        let h = harness(fast_config());
        let peer = add_peer(&h, "alice");
        h.supervisor.initialize_connection(&peer).unwrap();
        eventually(|| h.transport.count(&peer, OFFER) == 1).await;

        let bogus = SessionDescription::offer(&[]).answer();
        h.supervisor.handle_answer(&peer, bogus).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            h.supervisor.connection(&peer).unwrap().status,
            ConnectionStatus::Initializing
        );
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = MeshConfig {
            max_peers: 30,
            ..fast_config()
        };
        let h = harness(config);
        let peers: Vec<_> = (0..21).map(|i| add_peer(&h, &format!("peer-{i}"))).collect();

        for peer in &peers[..20] {
            h.supervisor.initialize_connection(peer).unwrap();
        }
        let result = h.supervisor.initialize_connection(&peers[20]);

        assert!(matches!(
            result,
            Err(MeshError::ConnectionLimitExceeded { max: 20 })
        ));
        assert_eq!(h.supervisor.active_count(), 20);
        assert!(h.supervisor.connection(&peers[20]).is_none());
    }

    #[tokio::test]
    async fn test_initialize_twice_keeps_active_connection() {
        let h = harness(fast_config());
        let peer = add_peer(&h, "alice");
        h.supervisor.initialize_connection(&peer).unwrap();
        let first = h.supervisor.connection(&peer).unwrap().id;

        h.supervisor.initialize_connection(&peer).unwrap();

        assert_eq!(h.supervisor.connection(&peer).unwrap().id, first);
    }

    #[tokio::test]
    async fn test_heartbeat_times_out_stale_connection() {
        let h = harness(MeshConfig {
            retry_delay_ms: 50,
            ..MeshConfig::default()
        });
        let peer = add_peer(&h, "alice");
        {
            let mut state = h.state.lock();
            let mut conn = Connection::new(peer.clone());
            conn.apply(ConnectionEvent::AnswerApplied);
            conn.last_active = now_millis() - h.supervisor.inner.config.connection_timeout_ms as i64 - 1000;
            state.connections.insert(conn).unwrap();
        }

        let timed_out = h.supervisor.check_timeouts();

        assert_eq!(timed_out, vec![peer.clone()]);
        let conn = h.supervisor.connection(&peer).unwrap();
        assert_ne!(conn.status, ConnectionStatus::Connected);
        assert_eq!(conn.retries, 1);

        // The scheduled retry re-opens the connection and sends a new offer
        eventually(|| h.transport.count(&peer, OFFER) == 1).await;
        assert_eq!(h.supervisor.connection(&peer).unwrap().retries, 1);
    }

    #[tokio::test]
    async fn test_fresh_connection_not_timed_out() {
        let h = harness(fast_config());
        let peer = add_peer(&h, "alice");
        {
            let mut state = h.state.lock();
            let mut conn = Connection::new(peer.clone());
            conn.apply(ConnectionEvent::AnswerApplied);
            state.connections.insert(conn).unwrap();
        }

        assert!(h.supervisor.check_timeouts().is_empty());
        assert_eq!(
            h.supervisor.connection(&peer).unwrap().status,
            ConnectionStatus::Connected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_stop_after_max() {
        let h = harness(MeshConfig::default());
        let mut events = h.events.subscribe();
        let peer = add_peer(&h, "alice");

        h.supervisor.initialize_connection(&peer).unwrap();

        let exhausted = tokio::time::timeout(Duration::from_secs(300), async {
            loop {
                if let Ok(NetworkEvent::RetriesExhausted { retries, .. }) = events.recv().await {
                    return retries;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(exhausted, 3);
        assert!(!h.supervisor.should_retry_connection(&peer));
        let conn = h.supervisor.connection(&peer).unwrap();
        assert_eq!(conn.status, ConnectionStatus::Closed);
        assert_eq!(conn.retries, 3);
        // One initial attempt plus three retries
        assert_eq!(h.transport.count(&peer, OFFER), 4);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.transport.count(&peer, OFFER), 4);
    }

    #[tokio::test]
    async fn test_send_failure_goes_to_retry_policy() {
        let h = harness(fast_config());
        let peer = add_peer(&h, "alice");
        h.transport.fail_for(peer.clone());

        h.supervisor.initialize_connection(&peer).unwrap();

        eventually(|| !h.supervisor.should_retry_connection(&peer)).await;
        eventually(|| {
            h.supervisor
                .connection(&peer)
                .is_some_and(|c| c.status == ConnectionStatus::Closed)
        })
        .await;
    }

    #[tokio::test]
    async fn test_reinitialize_after_exhaustion_resets_retries() {
        let h = harness(fast_config());
        let peer = add_peer(&h, "alice");
        h.transport.fail_for(peer.clone());
        h.supervisor.initialize_connection(&peer).unwrap();
        eventually(|| {
            h.supervisor
                .connection(&peer)
                .is_some_and(|c| c.retries == 3 && c.status == ConnectionStatus::Closed)
        })
        .await;

        h.supervisor.initialize_connection(&peer).unwrap();

        assert_eq!(h.supervisor.connection(&peer).unwrap().retries, 0);
        assert!(h.supervisor.should_retry_connection(&peer));
    }

    #[tokio::test]
    async fn test_remote_offer_is_answered() {
        let h = harness(fast_config());
        let peer = add_peer(&h, "bob");
        let offer = SessionDescription::offer(&[]);

        h.supervisor.handle_offer(&peer, offer.clone()).await.unwrap();

        let conn = h.supervisor.connection(&peer).unwrap();
        assert_eq!(conn.status, ConnectionStatus::Connected);
        let (_, answer) = h
            .transport
            .sent()
            .into_iter()
            .find(|(_, env)| env.kind == ANSWER)
            .unwrap();
        assert_eq!(answer.data["sessionId"], offer.session_id.as_str());
    }

    #[tokio::test]
    async fn test_remote_offer_from_unknown_peer() {
        let h = harness(fast_config());
        let result = h
            .supervisor
            .handle_offer(&PeerId::from_public_key("ghost"), SessionDescription::offer(&[]))
            .await;
        assert!(matches!(result, Err(MeshError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn test_ice_candidates_recorded() {
        let h = harness(fast_config());
        let peer = add_peer(&h, "bob");
        h.supervisor
            .handle_offer(&peer, SessionDescription::offer(&[]))
            .await
            .unwrap();

        h.supervisor
            .handle_ice_candidate(
                &peer,
                IceCandidate {
                    candidate: "candidate:1".into(),
                    sdp_mid: None,
                    sdp_m_line_index: None,
                },
            )
            .unwrap();

        assert_eq!(
            h.supervisor.connection(&peer).unwrap().remote_candidates,
            vec!["candidate:1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_broadcast_isolates_failures() {
        let h = harness(fast_config());
        let alice = add_peer(&h, "alice");
        let bob = add_peer(&h, "bob");
        let carol = add_peer(&h, "carol");
        for peer in [&alice, &bob] {
            h.supervisor
                .handle_offer(peer, SessionDescription::offer(&[]))
                .await
                .unwrap();
        }
        h.transport.fail_for(alice.clone());

        let report = h
            .supervisor
            .broadcast(&Envelope::new("RESOURCE_UPDATE", serde_json::json!({})))
            .await;

        assert_eq!(report.delivered, vec![bob.clone()]);
        assert_eq!(report.failed, vec![alice]);
        assert_eq!(h.transport.count(&carol, "RESOURCE_UPDATE"), 0);
    }

    #[tokio::test]
    async fn test_close_cancels_handshake() {
        let h = harness(MeshConfig::default());
        let peer = add_peer(&h, "alice");
        h.supervisor.initialize_connection(&peer).unwrap();
        eventually(|| h.transport.count(&peer, OFFER) == 1).await;

        h.supervisor.close(&peer).unwrap();

        assert!(h.supervisor.connection(&peer).is_none());
        assert!(h.supervisor.inner.pending_answers.lock().is_empty());
        assert!(h.supervisor.inner.tasks.lock().get(&peer).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_tasks_and_stops_retries() {
        let h = harness(fast_config());
        let alice = add_peer(&h, "alice");
        let bob = add_peer(&h, "bob");
        h.transport.fail_for(bob.clone());
        h.supervisor.initialize_connection(&alice).unwrap();
        h.supervisor.initialize_connection(&bob).unwrap();
        eventually(|| h.transport.count(&alice, OFFER) == 1).await;

        h.supervisor.shutdown().await;

        assert!(h.supervisor.inner.tasks.lock().is_empty());
        // Only the harness holds the transport once every task is gone
        assert_eq!(Arc::strong_count(&h.transport), 2);

        let _ = h.supervisor.initialize_connection(&bob);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.supervisor.inner.tasks.lock().is_empty());
    }
}
