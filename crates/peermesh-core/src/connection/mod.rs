//! Connection supervision
//!
//! - [`table`]: connection records with write-through persistence
//! - [`supervisor`]: establishment, heartbeat and retry policy
//! - [`transport`]: the signaling seam plus in-process implementations
//! - [`tcp`]: length-delimited signaling over TCP

mod supervisor;
mod table;
mod tcp;
mod transport;

pub use supervisor::{BroadcastReport, ConnectionSupervisor};
pub use table::ConnectionTable;
pub use tcp::{PeerRoute, TcpTransport};
pub use transport::{ChannelHub, ChannelTransport, Inbound, RecordingTransport, SignalingTransport};
