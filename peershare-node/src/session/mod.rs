//! One node's connection session: the reactor, the connection registry and the
//! transfer bookkeeping, driven one poll at a time.
//!
//! The same session type runs both roles. A server only accepts MYPORT
//! announcements and pushes peer lists; a client registers with a server, connects
//! to peers and moves files. Which messages are accepted is the only difference.

mod client;
mod error;
mod event;
mod server;
mod transfer;

pub use error::SessionError;
pub use event::{CloseReason, SessionEvent};

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream;
use mio::Waker;
use peershare_core::{
    decode_message, encode_message, AvailablePeer, ConnectionId, DecodeError, Message,
    Negotiation, Registry, SocketKey, Status, MAX_CLIENTS, MAX_CONN,
};
use tracing::{debug, info, warn};

use crate::reactor::{Reactor, Ready};

/// Most bytes taken from a socket per readiness event.
const READ_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub role: Role,
    /// Listener address. Port 0 picks an ephemeral port.
    pub bind: SocketAddrV4,
    /// Address reported as our own; the port always comes from the listener.
    pub advertise_ip: Ipv4Addr,
    pub data_dir: PathBuf,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
}

impl SessionOptions {
    /// Loopback listener on an ephemeral port.
    pub fn local(role: Role, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            role,
            bind: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            advertise_ip: Ipv4Addr::LOCALHOST,
            data_dir: data_dir.into(),
            poll_interval: Duration::from_millis(5000),
            connect_timeout: Duration::from_millis(5000),
        }
    }
}

/// One row of the LIST output.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSummary {
    pub id: Option<ConnectionId>,
    pub hostname: String,
    pub addr: SocketAddrV4,
    pub status: Status,
    pub is_server: bool,
}

/// Accepted socket whose first message has not arrived yet.
struct Handshake {
    key: SocketKey,
    stream: TcpStream,
    remote: SocketAddrV4,
    inbound: Vec<u8>,
}

/// Download requests from one command still waiting for their replies.
#[derive(Debug)]
struct DownloadBatch {
    requested: usize,
    outstanding: usize,
    started: usize,
}

pub struct Session {
    role: Role,
    reactor: Reactor,
    registry: Registry<TcpStream>,
    handshakes: Vec<Handshake>,
    advertised: SocketAddrV4,
    data_dir: PathBuf,
    connect_timeout: Duration,
    /// Last peer list pushed by the server (client role).
    available: Vec<AvailablePeer>,
    server_key: Option<SocketKey>,
    active_receives: usize,
    active_sends: usize,
    batch: Option<DownloadBatch>,
    input_held: bool,
    events: VecDeque<SessionEvent>,
}

impl Session {
    /// Bind the listener and start with an empty registry.
    pub fn bind(options: SessionOptions) -> io::Result<Self> {
        let reactor = Reactor::bind(SocketAddr::V4(options.bind), options.poll_interval)?;
        let port = reactor.local_addr()?.port();
        let registry = match options.role {
            Role::Server => Registry::anonymous(MAX_CLIENTS),
            Role::Client => Registry::with_ids(MAX_CONN),
        };
        let advertised = SocketAddrV4::new(options.advertise_ip, port);
        info!(role = %options.role, %advertised, "listening");
        Ok(Self {
            role: options.role,
            reactor,
            registry,
            handshakes: Vec::new(),
            advertised,
            data_dir: options.data_dir,
            connect_timeout: options.connect_timeout,
            available: Vec::new(),
            server_key: None,
            active_receives: 0,
            active_sends: 0,
            batch: None,
            input_held: false,
            events: VecDeque::new(),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Our own address as reported by MYIP / MYPORT.
    pub fn advertised(&self) -> SocketAddrV4 {
        self.advertised
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.reactor.waker()
    }

    pub fn is_registered(&self) -> bool {
        self.server_key.is_some()
    }

    /// Last peer list received from the server.
    pub fn available_peers(&self) -> &[AvailablePeer] {
        &self.available
    }

    pub fn connections(&self) -> Vec<ConnectionSummary> {
        self.registry
            .iter()
            .map(|r| ConnectionSummary {
                id: r.id(),
                hostname: r.hostname.clone(),
                addr: r.addr,
                status: r.transfer.status(),
                is_server: Some(r.key()) == self.server_key,
            })
            .collect()
    }

    pub fn active_receives(&self) -> usize {
        self.active_receives
    }

    pub fn active_sends(&self) -> usize {
        self.active_sends
    }

    /// True while console input must wait: a file is being received or a
    /// download command still has unanswered requests.
    pub fn is_input_held(&self) -> bool {
        self.input_held
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    /// Wait for readiness once (at most `timeout`, or the poll interval) and
    /// dispatch everything that became ready.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        for ready in self.reactor.wait(timeout)? {
            match ready {
                Ready::Console => {}
                Ready::Accept => self.accept_pending(),
                // A socket closed earlier in this round is no longer watched.
                Ready::Readable(key) if self.reactor.is_watched(key) => {
                    self.on_readable(key);
                    self.rearm(key);
                }
                Ready::Writable(key) if self.reactor.is_watched(key) => {
                    self.on_writable(key);
                    self.rearm(key);
                }
                Ready::Readable(_) | Ready::Writable(_) => {}
            }
        }
        Ok(())
    }

    /// Close every connection without notifying the server of anything.
    pub fn shutdown(&mut self) {
        for key in self.registry.keys() {
            self.close_connection(key, CloseReason::Shutdown);
        }
        for hs in std::mem::take(&mut self.handshakes) {
            self.discard(hs);
        }
        info!("session closed");
    }

    fn emit(&mut self, event: SessionEvent) {
        self.events.push_back(event);
    }

    fn require_client(&self, command: &'static str) -> Result<(), SessionError> {
        match self.role {
            Role::Client => Ok(()),
            Role::Server => Err(SessionError::ServerMode(command)),
        }
    }

    fn update_input_gate(&mut self) {
        let held = self.active_receives > 0 || self.batch.is_some();
        if self.input_held && !held {
            self.emit(SessionEvent::InputResumed);
        }
        self.input_held = held;
    }

    fn accept_pending(&mut self) {
        loop {
            let (mut stream, remote) = match self.reactor.accept() {
                Ok(Some(pair)) => pair,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            };
            let SocketAddr::V4(remote) = remote else {
                debug!(%remote, "ignoring non-IPv4 connection");
                continue;
            };
            let key = self.reactor.next_key();
            if let Err(e) = self.reactor.watch(&mut stream, key) {
                warn!(%remote, error = %e, "cannot watch accepted connection");
                continue;
            }
            debug!(%key, %remote, "accepted");
            self.handshakes.push(Handshake {
                key,
                stream,
                remote,
                inbound: Vec::new(),
            });
        }
    }

    fn on_readable(&mut self, key: SocketKey) {
        if self.handshakes.iter().any(|h| h.key == key) {
            self.on_handshake_readable(key);
            return;
        }
        let Some(record) = self.registry.find_by_socket_mut(key) else {
            return;
        };
        match record.transfer.status() {
            Status::Sending => self.drive_send(key),
            Status::Receiving => {
                if self.drive_receive(key) {
                    self.process_inbound(key);
                }
            }
            Status::Idle => match read_some(&mut record.socket, &mut record.inbound) {
                Ok(Fill::Closed) => {
                    self.process_inbound(key);
                    self.close_connection(key, CloseReason::PeerClosed);
                }
                Ok(Fill::Data | Fill::Empty) => self.process_inbound(key),
                Err(e) => self.close_connection(key, CloseReason::Io(e.to_string())),
            },
        }
    }

    fn on_writable(&mut self, key: SocketKey) {
        let sending = self
            .registry
            .find_by_socket(key)
            .is_some_and(|r| r.transfer.status() == Status::Sending);
        if sending {
            self.drive_send(key);
        }
    }

    fn rearm(&mut self, key: SocketKey) {
        let result = if let Some(r) = self.registry.find_by_socket_mut(key) {
            self.reactor.rearm(&mut r.socket, key)
        } else if let Some(h) = self.handshakes.iter_mut().find(|h| h.key == key) {
            self.reactor.rearm(&mut h.stream, key)
        } else {
            return;
        };
        if let Err(e) = result {
            warn!(%key, error = %e, "re-arm failed");
            if let Some(pos) = self.handshakes.iter().position(|h| h.key == key) {
                let hs = self.handshakes.remove(pos);
                self.discard(hs);
            } else {
                self.close_connection(key, CloseReason::Io(e.to_string()));
            }
        }
    }

    fn on_handshake_readable(&mut self, key: SocketKey) {
        let Some(pos) = self.handshakes.iter().position(|h| h.key == key) else {
            return;
        };
        let hs = &mut self.handshakes[pos];
        let closed = match read_some(&mut hs.stream, &mut hs.inbound) {
            Ok(Fill::Data | Fill::Empty) => false,
            Ok(Fill::Closed) => true,
            Err(e) => {
                debug!(%key, error = %e, "handshake read failed");
                let hs = self.handshakes.remove(pos);
                self.discard(hs);
                return;
            }
        };
        let (msg, used) = match decode_message(&hs.inbound) {
            Ok(decoded) => decoded,
            Err(DecodeError::NeedMore) if !closed => return,
            Err(DecodeError::NeedMore) => {
                debug!(%key, buffered = hs.inbound.len(), "closed before announcing itself");
                let hs = self.handshakes.remove(pos);
                self.discard(hs);
                return;
            }
            Err(e) => {
                warn!(%key, error = %e, "dropping connection");
                let hs = self.handshakes.remove(pos);
                self.discard(hs);
                return;
            }
        };
        let mut hs = self.handshakes.remove(pos);
        hs.inbound.drain(..used);
        let admitted = match (self.role, msg) {
            (Role::Server, Message::MyPort { port }) => self.admit_client(hs, port),
            (Role::Client, Message::ConnectRequest { port }) => self.admit_peer(hs, port),
            (role, other) => {
                let kind = other.message_type();
                warn!(%key, %role, ?kind, "unexpected first message, dropping");
                self.discard(hs);
                None
            }
        };
        if let Some(key) = admitted {
            self.process_inbound(key);
            if closed {
                self.close_connection(key, CloseReason::PeerClosed);
            }
        }
    }

    fn discard(&mut self, mut hs: Handshake) {
        self.reactor.unwatch(&mut hs.stream, hs.key);
        let _ = hs.stream.shutdown(Shutdown::Both);
    }

    /// Consume buffered bytes: decode messages while idle, feed a transfer that
    /// is receiving.
    fn process_inbound(&mut self, key: SocketKey) {
        loop {
            let Some(record) = self.registry.find_by_socket_mut(key) else {
                return;
            };
            match record.transfer.status() {
                Status::Sending => return,
                Status::Receiving => {
                    if record.inbound.is_empty() && record.transfer.bytes_remaining() != Some(0) {
                        return;
                    }
                    if !self.drive_receive(key) {
                        return;
                    }
                }
                Status::Idle => {
                    if record.inbound.is_empty() {
                        return;
                    }
                    let (msg, used) = match decode_message(&record.inbound) {
                        Ok(decoded) => decoded,
                        Err(DecodeError::NeedMore) => return,
                        Err(e) => {
                            warn!(%key, error = %e, "protocol violation");
                            self.close_connection(key, CloseReason::Violation(e.to_string()));
                            return;
                        }
                    };
                    record.inbound.drain(..used);
                    if let Err(reason) = self.on_message(key, msg) {
                        self.close_connection(key, reason);
                        return;
                    }
                }
            }
        }
    }

    fn on_message(&mut self, key: SocketKey, msg: Message) -> Result<(), CloseReason> {
        match self.role {
            Role::Server => {
                debug!(%key, kind = ?msg.message_type(), "ignoring message from registered client");
                Ok(())
            }
            Role::Client if self.server_key == Some(key) => self.on_server_message(msg),
            Role::Client => self.on_peer_message(key, msg),
        }
    }

    /// The one teardown path for registered connections: stops watching the socket,
    /// abandons any transfer, settles a pending download and applies the role's
    /// follow-up (peer list re-broadcast, or server-loss cascade).
    fn close_connection(&mut self, key: SocketKey, reason: CloseReason) {
        let Some(mut record) = self.registry.remove(key) else {
            return;
        };
        self.reactor.unwatch(&mut record.socket, key);
        let _ = record.socket.shutdown(Shutdown::Both);

        let abandoned = record.transfer.active().map(|a| a.file_name().to_string());
        match record.transfer.abandon() {
            Status::Receiving => self.active_receives = self.active_receives.saturating_sub(1),
            Status::Sending => self.active_sends = self.active_sends.saturating_sub(1),
            Status::Idle => {}
        }
        if let (Some(id), Some(file)) = (record.id(), abandoned) {
            self.emit(SessionEvent::TransferFailed {
                id,
                file,
                error: reason.to_string(),
            });
        }
        if let Some(Negotiation::Download { .. }) = record.pending.take() {
            self.settle_download(false);
        }

        info!(addr = %record.addr, %reason, "connection closed");
        self.emit(SessionEvent::ConnectionClosed {
            id: record.id(),
            addr: record.addr,
            hostname: record.hostname.clone(),
            reason: reason.clone(),
        });

        if self.server_key == Some(key) {
            self.server_key = None;
            self.available.clear();
            if !matches!(reason, CloseReason::Terminated | CloseReason::Shutdown) {
                warn!("lost the server link, closing all peer connections");
                self.emit(SessionEvent::ServerLost);
                for peer in self.registry.keys() {
                    self.close_connection(peer, CloseReason::ServerLost);
                }
            }
        } else if self.role == Role::Server && reason != CloseReason::Shutdown {
            self.broadcast_peer_list();
        }
        self.update_input_gate();
    }
}

enum Fill {
    Data,
    Empty,
    Closed,
}

/// One read of at most [`READ_CHUNK`] bytes appended to `inbound`.
fn read_some(stream: &mut impl Read, inbound: &mut Vec<u8>) -> io::Result<Fill> {
    let mut buf = [0u8; READ_CHUNK];
    match stream.read(&mut buf) {
        Ok(0) => Ok(Fill::Closed),
        Ok(n) => {
            inbound.extend_from_slice(&buf[..n]);
            Ok(Fill::Data)
        }
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
            Ok(Fill::Empty)
        }
        Err(e) => Err(e),
    }
}

fn send_message(stream: &mut impl Write, msg: &Message) -> Result<(), SessionError> {
    let bytes = encode_message(msg)?;
    stream.write_all(&bytes).map_err(SessionError::Send)
}
