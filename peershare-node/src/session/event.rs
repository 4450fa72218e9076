use std::fmt;
use std::net::SocketAddrV4;

use peershare_core::{AvailablePeer, ConnectionId, TransferSummary};

/// Something the console should tell the user about. Collected during a poll
/// and drained with [`Session::take_events`](super::Session::take_events).
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Server: a client announced its listening port.
    ClientRegistered { addr: SocketAddrV4 },
    /// Client: the server pushed a new list of available peers.
    PeerListUpdated { peers: Vec<AvailablePeer> },
    /// A peer connection was established, in either direction.
    PeerConnected {
        id: ConnectionId,
        addr: SocketAddrV4,
        hostname: String,
    },
    ConnectionClosed {
        id: Option<ConnectionId>,
        addr: SocketAddrV4,
        hostname: String,
        reason: CloseReason,
    },
    /// Client: the server closed the link; every peer connection went with it.
    ServerLost,
    UploadStarted {
        id: ConnectionId,
        file: String,
        size: u64,
    },
    UploadRejected { id: ConnectionId, file: String },
    /// The peer agreed to send, or asked us to store, `file`.
    ReceivingFile {
        id: ConnectionId,
        file: String,
        size: u64,
    },
    /// The peer asked us for `file` and we started sending it.
    SendingFile {
        id: ConnectionId,
        file: String,
        size: u64,
    },
    /// The peer asked for a file we could not or would not serve.
    RequestRefused {
        id: ConnectionId,
        file: String,
        reason: String,
    },
    DownloadRejected { id: ConnectionId, file: String },
    /// A download pair from a command was dropped before its request went out.
    DownloadSkipped {
        id: ConnectionId,
        file: String,
        reason: String,
    },
    /// Every request of a download command got its answer.
    DownloadsSettled { requested: usize, started: usize },
    TransferComplete {
        id: ConnectionId,
        hostname: String,
        summary: TransferSummary,
    },
    TransferFailed {
        id: ConnectionId,
        file: String,
        error: String,
    },
    /// Incoming transfers and download negotiations are all finished.
    InputResumed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote side closed the connection.
    PeerClosed,
    /// Closed by a TERMINATE command.
    Terminated,
    /// The server link went away.
    ServerLost,
    /// The remote sent bytes that do not follow the protocol.
    Violation(String),
    Io(String),
    /// Local shutdown.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::Terminated => write!(f, "terminated"),
            CloseReason::ServerLost => write!(f, "server link lost"),
            CloseReason::Violation(why) => write!(f, "protocol violation: {why}"),
            CloseReason::Io(why) => write!(f, "{why}"),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}
