//! Connection registry: ordered connection records, looked up by socket or connection id.
//!
//! Lists are bounded by a small connection limit, so lookups are linear scans over a
//! `Vec` kept in connection order.

use std::fmt;
use std::fs::File;
use std::net::SocketAddrV4;
use std::path::PathBuf;

use crate::transfer::TransferContext;

/// Identity of a watched socket inside the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketKey(pub usize);

impl fmt::Display for SocketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Operator-facing connection id. Assigned in connection order, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u32);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request this side sent and whose reply has not arrived yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// UPLOAD_REQUEST sent for the local file at `path`.
    Upload { path: PathBuf, name: String, size: u64 },
    /// DOWNLOAD_REQUEST sent for `name`.
    Download { name: String },
}

/// Per-socket bookkeeping for a peer (client side) or a registered client (server side).
#[derive(Debug)]
pub struct ConnectionRecord<S, F = File> {
    id: Option<ConnectionId>,
    key: SocketKey,
    /// Remote address, with the port the remote side listens on.
    pub addr: SocketAddrV4,
    pub hostname: String,
    pub socket: S,
    pub transfer: TransferContext<F>,
    pub pending: Option<Negotiation>,
    /// Bytes read from the socket but not yet consumed by a message or transfer.
    pub inbound: Vec<u8>,
}

impl<S, F> ConnectionRecord<S, F> {
    pub fn new(key: SocketKey, addr: SocketAddrV4, hostname: impl Into<String>, socket: S) -> Self {
        Self {
            id: None,
            key,
            addr,
            hostname: hostname.into(),
            socket,
            transfer: TransferContext::Idle,
            pending: None,
            inbound: Vec::new(),
        }
    }

    pub fn id(&self) -> Option<ConnectionId> {
        self.id
    }

    pub fn key(&self) -> SocketKey {
        self.key
    }

    /// Idle and not waiting on a reply: free to start a new upload or download.
    pub fn is_ready(&self) -> bool {
        self.transfer.is_idle() && self.pending.is_none()
    }
}

/// Ordered collection of connection records.
#[derive(Debug)]
pub struct Registry<S, F = File> {
    records: Vec<ConnectionRecord<S, F>>,
    assigns_ids: bool,
    last_id: u32,
    limit: usize,
}

impl<S, F> Registry<S, F> {
    /// Registry that numbers its records (client side).
    pub fn with_ids(limit: usize) -> Self {
        Self {
            records: Vec::new(),
            assigns_ids: true,
            last_id: 0,
            limit,
        }
    }

    /// Registry without connection ids (server side).
    pub fn anonymous(limit: usize) -> Self {
        Self {
            records: Vec::new(),
            assigns_ids: false,
            last_id: 0,
            limit,
        }
    }

    /// Append a record, assigning the next connection id when this registry numbers records.
    pub fn add(
        &mut self,
        mut record: ConnectionRecord<S, F>,
    ) -> Result<Option<ConnectionId>, RegistryError> {
        if self.records.len() >= self.limit {
            return Err(RegistryError::Full(self.limit));
        }
        if self.find_by_socket(record.key).is_some() {
            return Err(RegistryError::DuplicateSocket(record.key));
        }
        if self.assigns_ids {
            self.last_id += 1;
            record.id = Some(ConnectionId(self.last_id));
        }
        let id = record.id;
        self.records.push(record);
        Ok(id)
    }

    /// Remove the record for `key`. A key that is already gone is a no-op.
    pub fn remove(&mut self, key: SocketKey) -> Option<ConnectionRecord<S, F>> {
        let idx = self.records.iter().position(|r| r.key == key)?;
        Some(self.records.remove(idx))
    }

    pub fn find_by_socket(&self, key: SocketKey) -> Option<&ConnectionRecord<S, F>> {
        self.records.iter().find(|r| r.key == key)
    }

    pub fn find_by_socket_mut(&mut self, key: SocketKey) -> Option<&mut ConnectionRecord<S, F>> {
        self.records.iter_mut().find(|r| r.key == key)
    }

    pub fn find_by_id(&self, id: ConnectionId) -> Option<&ConnectionRecord<S, F>> {
        self.records.iter().find(|r| r.id == Some(id))
    }

    pub fn find_by_id_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionRecord<S, F>> {
        self.records.iter_mut().find(|r| r.id == Some(id))
    }

    pub fn find_by_addr(&self, addr: SocketAddrV4) -> Option<&ConnectionRecord<S, F>> {
        self.records.iter().find(|r| r.addr == addr)
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.limit
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRecord<S, F>> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectionRecord<S, F>> {
        self.records.iter_mut()
    }

    /// Socket keys in connection order.
    pub fn keys(&self) -> Vec<SocketKey> {
        self.records.iter().map(|r| r.key).collect()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection limit of {0} reached")]
    Full(usize),
    #[error("socket {0} is already registered")]
    DuplicateSocket(SocketKey),
}
