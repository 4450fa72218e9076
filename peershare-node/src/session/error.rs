use std::io;
use std::net::SocketAddrV4;
use std::path::PathBuf;

use peershare_core::{ConnectionId, EncodeError, RegistryError};
use thiserror::Error;

/// Why a console operation was refused. None of these tear down existing connections.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0} command not available when running in server mode")]
    ServerMode(&'static str),
    #[error("please register to the server first")]
    NotRegistered,
    #[error("already registered to the server")]
    AlreadyRegistered,
    #[error("connection limit ({0}) reached")]
    ConnectionLimit(usize),
    #[error("cannot connect to self")]
    SelfConnect,
    #[error("{0} is not in the list of available peers")]
    UnknownPeer(String),
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddrV4),
    #[error("invalid connection id {0}")]
    InvalidConnectionId(ConnectionId),
    #[error("transfers to or from the server are not allowed")]
    ServerLink,
    #[error("connection {0} is busy")]
    Busy(ConnectionId),
    #[error("no peer connections")]
    NoPeers,
    #[error("at most {max} downloads per command, got {got}")]
    TooManyDownloads { max: usize, got: usize },
    #[error("previous downloads are still being negotiated")]
    DownloadsPending,
    #[error("no files could be downloaded")]
    NoDownloadsStarted,
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("{path}: {source}")]
    File { path: PathBuf, source: io::Error },
    #[error("{0} is not a regular file")]
    NotAFile(PathBuf),
    #[error("cannot resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: SocketAddrV4, source: io::Error },
    #[error("send failed: {0}")]
    Send(io::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
