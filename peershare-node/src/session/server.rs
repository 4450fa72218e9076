//! Server role: registered clients and the peer list.

use peershare_core::{AvailablePeer, ConnectionRecord, Message, SocketKey};
use std::net::SocketAddrV4;
use tracing::{debug, info, warn};

use super::{send_message, CloseReason, Handshake, Session, SessionEvent};
use crate::host;

impl Session {
    /// A connection announced the port it listens on: register it as a client.
    pub(super) fn admit_client(&mut self, hs: Handshake, port: u16) -> Option<SocketKey> {
        let addr = SocketAddrV4::new(*hs.remote.ip(), port);
        if self.registry.is_full() {
            warn!(%addr, "client limit reached, dropping registration");
            self.discard(hs);
            return None;
        }
        let key = hs.key;
        let hostname = host::reverse_lookup(*hs.remote.ip());
        let mut record = ConnectionRecord::new(key, addr, hostname, hs.stream);
        record.inbound = hs.inbound;
        if let Err(e) = self.registry.add(record) {
            warn!(%addr, error = %e, "cannot register client");
            self.reactor.forget(key);
            return None;
        }
        info!(%addr, "client registered");
        self.emit(SessionEvent::ClientRegistered { addr });
        self.broadcast_peer_list();
        Some(key)
    }

    /// Current peer list: every registered client, in registration order.
    pub fn registered_clients(&self) -> Vec<AvailablePeer> {
        self.registry.iter().map(|r| AvailablePeer::from(r.addr)).collect()
    }

    /// Push the full list to every registered client. A failed write may have
    /// left part of a message on the wire, so that client is closed.
    pub(super) fn broadcast_peer_list(&mut self) {
        let msg = Message::PeerList {
            peers: self.registered_clients(),
        };
        debug!(clients = self.registry.count(), "broadcasting peer list");
        let mut failed = Vec::new();
        for record in self.registry.iter_mut() {
            if let Err(e) = send_message(&mut record.socket, &msg) {
                warn!(addr = %record.addr, error = %e, "peer list not delivered");
                failed.push((record.key(), e.to_string()));
            }
        }
        for (key, error) in failed {
            self.close_connection(key, CloseReason::Io(error));
        }
    }
}
