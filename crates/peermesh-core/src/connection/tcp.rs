//! TCP signaling transport
//!
//! Every node listens on one port. A link is opened lazily on the first send
//! to a peer and kept for later sends; its first frame is a hello carrying
//! the sender's peer id, every frame after that is one encoded envelope.
//!
//! ```text
//! dialer                                   listener
//!   │── [len][hello: local peer id] ──────────▶│ read_loop learns `from`
//!   │── [len][envelope json] ─────────────────▶│ Inbound { from, payload }
//!   │── [len][envelope json] ─────────────────▶│ Inbound { from, payload }
//! ```
//!
//! Peer addresses come from peer metadata shaped like the records mDNS
//! discovery produces: `{"addresses": ["192.168.1.7"], "port": 7450}`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, FramedRead, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{Inbound, SignalingTransport};
use crate::error::{MeshError, MeshResult};
use crate::protocol::Envelope;
use crate::types::{Peer, PeerId};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

type Link = Framed<TcpStream, LengthDelimitedCodec>;

fn codec(max_frame: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame)
        .new_codec()
}

/// Where a peer accepts signaling links
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRoute {
    pub hosts: Vec<String>,
    pub port: u16,
}

impl PeerRoute {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            hosts: vec![host.into()],
            port,
        }
    }

    /// Read `addresses` and `port` from peer metadata
    pub fn from_metadata(metadata: &Value) -> Option<Self> {
        let port = u16::try_from(metadata.get("port")?.as_u64()?).ok()?;
        let hosts: Vec<String> = metadata
            .get("addresses")?
            .as_array()?
            .iter()
            .filter_map(|a| a.as_str().map(str::to_string))
            .collect();
        if port == 0 || hosts.is_empty() {
            return None;
        }
        Some(Self { hosts, port })
    }

    /// Metadata a [`PeerDescriptor`](crate::PeerDescriptor) can carry
    pub fn to_metadata(&self) -> Value {
        serde_json::json!({ "addresses": self.hosts, "port": self.port })
    }
}

/// Signaling over length-delimited TCP frames
pub struct TcpTransport {
    local: PeerId,
    local_addr: SocketAddr,
    max_frame: usize,
    routes: RwLock<HashMap<PeerId, PeerRoute>>,
    links: Mutex<HashMap<PeerId, Arc<AsyncMutex<Option<Link>>>>>,
    shutdown: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Bind the listener and start accepting links.
    ///
    /// Frames larger than `max_message_size` close the link they arrive on.
    /// The receiver yields every envelope addressed to this node, to be fed
    /// into `PeerNetwork::handle_inbound`.
    pub async fn bind(
        local: PeerId,
        addr: impl ToSocketAddrs,
        max_message_size: usize,
    ) -> MeshResult<(Arc<Self>, mpsc::UnboundedReceiver<Inbound>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let accept = tokio::spawn(accept_loop(
            listener,
            tx,
            max_message_size,
            shutdown.clone(),
        ));
        info!(addr = %local_addr, "Signaling listener bound");

        let transport = Arc::new(Self {
            local,
            local_addr,
            max_frame: max_message_size,
            routes: RwLock::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            shutdown,
            listener: Mutex::new(Some(accept)),
        });
        Ok((transport, rx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Set the address of a peer, dropping any link to its old address
    pub fn add_route(&self, peer_id: PeerId, route: PeerRoute) {
        let previous = self.routes.write().insert(peer_id.clone(), route.clone());
        if previous.as_ref() != Some(&route) {
            debug!(peer_id = %peer_id.short(), port = route.port, "Learned peer address");
            self.links.lock().remove(&peer_id);
        }
    }

    /// Stop accepting, end every reader and drop outbound links
    pub async fn close(&self) {
        self.shutdown.cancel();
        let accept = self.listener.lock().take();
        if let Some(accept) = accept {
            if let Err(e) = accept.await {
                warn!(error = %e, "Signaling listener ended abnormally");
            }
        }
        self.links.lock().clear();
    }

    async fn dial(&self, peer_id: &PeerId) -> MeshResult<Link> {
        let route = self.routes.read().get(peer_id).cloned();
        let Some(route) = route else {
            return Err(MeshError::Transport(format!(
                "no address for {}",
                peer_id.short()
            )));
        };

        let mut last_error = String::from("no usable address");
        for host in &route.hosts {
            let connect = TcpStream::connect((host.as_str(), route.port));
            match tokio::time::timeout(DIAL_TIMEOUT, connect).await {
                Ok(Ok(stream)) => {
                    let mut link = Framed::new(stream, codec(self.max_frame));
                    link.send(Bytes::from(self.local.as_str().to_owned())).await?;
                    debug!(peer_id = %peer_id.short(), host = %host, port = route.port, "Signaling link opened");
                    return Ok(link);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "connect timed out".into(),
            }
        }
        Err(MeshError::Transport(format!(
            "cannot reach {}: {}",
            peer_id.short(),
            last_error
        )))
    }
}

#[async_trait]
impl SignalingTransport for TcpTransport {
    async fn send(&self, peer_id: &PeerId, envelope: &Envelope) -> MeshResult<()> {
        let payload = Bytes::from(envelope.encode()?);
        let slot = self.links.lock().entry(peer_id.clone()).or_default().clone();

        // One writer per link; sends to other peers are not held up
        let mut link = slot.lock().await;
        if link.is_none() {
            *link = Some(self.dial(peer_id).await?);
        }
        let Some(framed) = link.as_mut() else {
            return Err(MeshError::Transport(format!("no link to {}", peer_id.short())));
        };

        let sent = framed.send(payload).await;
        if let Err(e) = sent {
            // Redial on the next send
            *link = None;
            return Err(MeshError::Transport(format!(
                "send to {} failed: {}",
                peer_id.short(),
                e
            )));
        }
        Ok(())
    }

    fn learn_peer(&self, peer: &Peer) {
        if let Some(route) = PeerRoute::from_metadata(&peer.metadata) {
            self.add_route(peer.id.clone(), route);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound: mpsc::UnboundedSender<Inbound>,
    max_frame: usize,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(%remote, "Accepted signaling link");
                    tokio::spawn(read_loop(
                        stream,
                        remote,
                        inbound.clone(),
                        max_frame,
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "Failed to accept signaling link"),
            }
        }
    }
    debug!("Signaling listener stopped");
}

async fn read_loop(
    stream: TcpStream,
    remote: SocketAddr,
    inbound: mpsc::UnboundedSender<Inbound>,
    max_frame: usize,
    shutdown: CancellationToken,
) {
    let mut frames = FramedRead::new(stream, codec(max_frame));

    let hello = tokio::select! {
        _ = shutdown.cancelled() => return,
        hello = frames.next() => hello,
    };
    let from = match hello {
        Some(Ok(frame)) => match std::str::from_utf8(&frame) {
            Ok(id) if !id.is_empty() => PeerId::from_raw(id),
            _ => {
                warn!(%remote, "Invalid hello frame");
                return;
            }
        },
        Some(Err(e)) => {
            warn!(%remote, error = %e, "Failed to read hello frame");
            return;
        }
        None => return,
    };

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                let message = Inbound {
                    from: from.clone(),
                    payload: frame.to_vec(),
                };
                if inbound.send(message).is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(peer_id = %from.short(), error = %e, "Signaling link failed");
                break;
            }
            None => break,
        }
    }
    debug!(peer_id = %from.short(), "Signaling link closed");
}
