//! Client role: the server link and peer connections.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};

use mio::net::TcpStream;
use peershare_core::{AvailablePeer, ConnectionId, ConnectionRecord, Message, SocketKey, MAX_CONN};
use tracing::{debug, info, warn};

use super::{send_message, CloseReason, Handshake, Session, SessionError, SessionEvent};
use crate::host;

impl Session {
    /// Connect to the rendezvous server and announce our listening port.
    /// The server answers with a peer list once it has registered us.
    pub fn register_to_server(
        &mut self,
        host: &str,
        port: u16,
    ) -> Result<ConnectionId, SessionError> {
        self.require_client("REGISTER")?;
        if self.server_key.is_some() {
            return Err(SessionError::AlreadyRegistered);
        }
        if self.registry.is_full() {
            return Err(SessionError::ConnectionLimit(MAX_CONN));
        }
        let targets = resolve(host, port)?;
        let (stream, addr, hostname) = self.open_stream(&targets)?;
        let hello = Message::MyPort {
            port: self.advertised.port(),
        };
        let id = self.adopt("REGISTER", stream, addr, hostname, hello)?;
        self.server_key = self.registry.find_by_id(id).map(|r| r.key());
        info!(%addr, %id, "registered with server");
        Ok(id)
    }

    /// Open a connection to a peer from the server's list.
    pub fn connect_to_peer(&mut self, host: &str, port: u16) -> Result<ConnectionId, SessionError> {
        self.require_client("CONNECT")?;
        if self.server_key.is_none() {
            return Err(SessionError::NotRegistered);
        }
        if self.registry.is_full() {
            return Err(SessionError::ConnectionLimit(MAX_CONN));
        }
        let mut candidates = Vec::new();
        for (addr, name) in resolve(host, port)? {
            if addr == self.advertised {
                return Err(SessionError::SelfConnect);
            }
            if !self.available.contains(&AvailablePeer::from(addr)) {
                continue;
            }
            if self.registry.find_by_addr(addr).is_some() {
                return Err(SessionError::AlreadyConnected(addr));
            }
            candidates.push((addr, name));
        }
        if candidates.is_empty() {
            return Err(SessionError::UnknownPeer(format!("{host}:{port}")));
        }
        let (stream, addr, hostname) = self.open_stream(&candidates)?;
        let hello = Message::ConnectRequest {
            port: self.advertised.port(),
        };
        let id = self.adopt("CONNECT", stream, addr, hostname.clone(), hello)?;
        info!(%addr, %id, "connected to peer");
        self.emit(SessionEvent::PeerConnected { id, addr, hostname });
        Ok(id)
    }

    /// Close one connection. Terminating the server link unregisters but keeps peers.
    pub fn terminate_connection(&mut self, id: ConnectionId) -> Result<(), SessionError> {
        self.require_client("TERMINATE")?;
        let key = self
            .registry
            .find_by_id(id)
            .map(|r| r.key())
            .ok_or(SessionError::InvalidConnectionId(id))?;
        self.close_connection(key, CloseReason::Terminated);
        Ok(())
    }

    /// An incoming peer announced its listening port.
    pub(super) fn admit_peer(&mut self, hs: Handshake, port: u16) -> Option<SocketKey> {
        let addr = SocketAddrV4::new(*hs.remote.ip(), port);
        if self.registry.is_full() {
            warn!(%addr, "connection limit reached, refusing peer");
            self.discard(hs);
            return None;
        }
        let key = hs.key;
        let hostname = host::reverse_lookup(*hs.remote.ip());
        let mut record = ConnectionRecord::new(key, addr, hostname.clone(), hs.stream);
        record.inbound = hs.inbound;
        match self.registry.add(record) {
            Ok(Some(id)) => {
                info!(%addr, %id, "peer connected");
                self.emit(SessionEvent::PeerConnected { id, addr, hostname });
                Some(key)
            }
            Ok(None) => Some(key),
            Err(e) => {
                warn!(%addr, error = %e, "cannot add peer");
                self.reactor.forget(key);
                None
            }
        }
    }

    pub(super) fn on_server_message(&mut self, msg: Message) -> Result<(), CloseReason> {
        match msg {
            Message::PeerList { peers } => {
                debug!(count = peers.len(), "peer list updated");
                self.available = peers.clone();
                self.emit(SessionEvent::PeerListUpdated { peers });
                Ok(())
            }
            other => Err(CloseReason::Violation(format!(
                "server sent {:?}",
                other.message_type()
            ))),
        }
    }

    /// Blocking connect with a timeout, then switch to non-blocking for the reactor.
    fn open_stream(
        &self,
        targets: &[(SocketAddrV4, String)],
    ) -> Result<(TcpStream, SocketAddrV4, String), SessionError> {
        let mut last = None;
        for (addr, name) in targets {
            let target = SocketAddr::V4(*addr);
            match std::net::TcpStream::connect_timeout(&target, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nonblocking(true)?;
                    stream.set_nodelay(true)?;
                    return Ok((TcpStream::from_std(stream), *addr, name.clone()));
                }
                Err(e) => {
                    debug!(%addr, error = %e, "connect failed");
                    last = Some((*addr, e));
                }
            }
        }
        let (addr, source) = last.ok_or_else(|| {
            SessionError::Io(io::Error::new(io::ErrorKind::NotFound, "no address to connect to"))
        })?;
        Err(SessionError::Connect { addr, source })
    }

    /// Send the opening message, then watch and register the new connection.
    /// Only registries that hand out ids (client role) can adopt.
    fn adopt(
        &mut self,
        command: &'static str,
        mut stream: TcpStream,
        addr: SocketAddrV4,
        hostname: String,
        hello: Message,
    ) -> Result<ConnectionId, SessionError> {
        send_message(&mut stream, &hello)?;
        let key = self.reactor.next_key();
        self.reactor.watch(&mut stream, key)?;
        match self.registry.add(ConnectionRecord::new(key, addr, hostname, stream)) {
            Ok(Some(id)) => Ok(id),
            Ok(None) => {
                self.close_connection(key, CloseReason::Shutdown);
                Err(SessionError::ServerMode(command))
            }
            Err(e) => {
                self.reactor.forget(key);
                Err(e.into())
            }
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<(SocketAddrV4, String)>, SessionError> {
    host::resolve_v4(host, port).map_err(|source| SessionError::Resolve {
        host: host.to_string(),
        source,
    })
}
