//! Peershare wire protocol: message kinds, type tags and protocol-wide limits.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Bytes moved per transfer step.
pub const BLOCK_SIZE: usize = 1000;

/// Maximum connections a client keeps open, the server link included.
pub const MAX_CONN: usize = 4;

/// Maximum registered clients on the server. PEER_LIST carries an 8-bit count.
pub const MAX_CLIENTS: usize = u8::MAX as usize;

/// Longest file name accepted on the wire, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum (connection, file) pairs in one download command.
pub const MAX_DOWNLOADS: usize = 3;

/// Two-byte type tag that starts every message (little-endian on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    MyPort = 0x11,
    PeerList = 0x12,
    ConnectRequest = 0x21,
    DownloadRequest = 0x31,
    DownloadAccept = 0x32,
    DownloadReject = 0x33,
    UploadRequest = 0x41,
    UploadAccept = 0x42,
    UploadReject = 0x43,
}

impl MessageType {
    pub fn tag(self) -> u16 {
        self as u16
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        Some(match tag {
            0x11 => Self::MyPort,
            0x12 => Self::PeerList,
            0x21 => Self::ConnectRequest,
            0x31 => Self::DownloadRequest,
            0x32 => Self::DownloadAccept,
            0x33 => Self::DownloadReject,
            0x41 => Self::UploadRequest,
            0x42 => Self::UploadAccept,
            0x43 => Self::UploadReject,
            _ => return None,
        })
    }
}

/// An address/port the server advertises as reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AvailablePeer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl AvailablePeer {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }
}

impl From<SocketAddrV4> for AvailablePeer {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl fmt::Display for AvailablePeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// All wire messages. Layouts are fixed; see the wire module for the byte format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client to server: the port this client listens on.
    MyPort { port: u16 },
    /// Server to client: every registered client, in registration order.
    PeerList { peers: Vec<AvailablePeer> },
    /// Peer to peer: the connecting side's listen port.
    ConnectRequest { port: u16 },
    /// Ask the peer to send a file from its data directory.
    DownloadRequest { name: String },
    /// Download accepted; `size` bytes of raw file data follow.
    DownloadAccept { size: u64 },
    DownloadReject,
    /// Offer a file of `size` bytes; raw data follows once accepted.
    UploadRequest { size: u64, name: String },
    UploadAccept,
    UploadReject,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::MyPort { .. } => MessageType::MyPort,
            Message::PeerList { .. } => MessageType::PeerList,
            Message::ConnectRequest { .. } => MessageType::ConnectRequest,
            Message::DownloadRequest { .. } => MessageType::DownloadRequest,
            Message::DownloadAccept { .. } => MessageType::DownloadAccept,
            Message::DownloadReject => MessageType::DownloadReject,
            Message::UploadRequest { .. } => MessageType::UploadRequest,
            Message::UploadAccept => MessageType::UploadAccept,
            Message::UploadReject => MessageType::UploadReject,
        }
    }
}
