//! Peershare protocol engine.
//! I/O-free: the host owns sockets and files and drives these types from its event loop.

pub mod protocol;
pub mod registry;
pub mod transfer;
pub mod watch;
pub mod wire;

pub use protocol::{
    AvailablePeer, Message, MessageType, BLOCK_SIZE, MAX_CLIENTS, MAX_CONN, MAX_DOWNLOADS,
    MAX_NAME_LEN,
};
pub use registry::{
    ConnectionId, ConnectionRecord, Negotiation, Registry, RegistryError, SocketKey,
};
pub use transfer::{Direction, Status, Step, TransferContext, TransferError, TransferSummary};
pub use watch::WatchSet;
pub use wire::{decode_message, encode_message, DecodeError, EncodeError};
