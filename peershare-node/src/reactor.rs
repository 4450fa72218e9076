//! Readiness reactor: one mio poll owns the listener, the console waker and every
//! connection socket. The session asks it for the next batch of ready sockets and
//! dispatches them itself.

use std::collections::BTreeSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use peershare_core::{SocketKey, WatchSet};
use tracing::{debug, warn};

/// Listening socket.
pub const LISTENER: SocketKey = SocketKey(0);
/// Console input and shutdown requests.
pub const WAKER: SocketKey = SocketKey(1);
const FIRST_CONNECTION: usize = 2;

/// One readiness notification, in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    Console,
    Accept,
    Readable(SocketKey),
    Writable(SocketKey),
}

pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    waker: Arc<Waker>,
    watch: WatchSet,
    next_key: usize,
    poll_interval: Duration,
}

fn token(key: SocketKey) -> Token {
    Token(key.0)
}

impl Reactor {
    /// Bind the listening socket and set up the poll. `poll_interval` bounds every wait.
    pub fn bind(addr: SocketAddr, poll_interval: Duration) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, token(LISTENER), Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), token(WAKER))?);
        let mut watch = WatchSet::new();
        watch.watch_read(LISTENER);
        watch.watch_read(WAKER);
        Ok(Self {
            poll,
            events: Events::with_capacity(256),
            listener,
            waker,
            watch,
            next_key: FIRST_CONNECTION,
            poll_interval,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for other threads to interrupt the wait.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn watch_set(&self) -> &WatchSet {
        &self.watch
    }

    /// Fresh key for a new connection. Keys are never reused.
    pub fn next_key(&mut self) -> SocketKey {
        let key = SocketKey(self.next_key);
        self.next_key += 1;
        key
    }

    /// Accept one pending connection, `None` once the backlog is drained.
    pub fn accept(&mut self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        match self.listener.accept() {
            Ok(pair) => Ok(Some(pair)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Start watching `stream` for reads.
    pub fn watch(&mut self, stream: &mut TcpStream, key: SocketKey) -> io::Result<()> {
        self.poll
            .registry()
            .register(stream, token(key), Interest::READABLE)?;
        self.watch.watch_read(key);
        Ok(())
    }

    /// Turn write interest on or off for a watched stream.
    pub fn set_writable(
        &mut self,
        stream: &mut TcpStream,
        key: SocketKey,
        on: bool,
    ) -> io::Result<()> {
        if on {
            self.watch.watch_write(key);
        } else {
            self.watch.unwatch_write(key);
        }
        self.rearm(stream, key)
    }

    /// Re-register a stream with its current interest so readiness that is still
    /// pending is reported again on the next wait.
    pub fn rearm(&mut self, stream: &mut TcpStream, key: SocketKey) -> io::Result<()> {
        if !self.watch.is_read_watched(key) {
            return Ok(());
        }
        let interest = if self.watch.is_write_watched(key) {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.poll.registry().reregister(stream, token(key), interest)
    }

    /// Stop watching a stream. Safe to call for a key that is already gone.
    pub fn unwatch(&mut self, stream: &mut TcpStream, key: SocketKey) {
        if !self.watch.is_read_watched(key) {
            return;
        }
        self.watch.remove(key);
        if let Err(e) = stream.deregister(self.poll.registry()) {
            warn!(%key, error = %e, "deregister failed");
        }
    }

    /// Forget a key whose socket was dropped without passing through `unwatch`.
    pub fn forget(&mut self, key: SocketKey) {
        self.watch.remove(key);
    }

    pub fn is_watched(&self, key: SocketKey) -> bool {
        self.watch.is_read_watched(key)
    }

    /// Wait for readiness (bounded by the poll interval unless `timeout` is given) and
    /// return it ordered: console, listener, readable keys ascending, writable keys ascending.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Ready>> {
        let timeout = timeout.unwrap_or(self.poll_interval);
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        let mut console = false;
        let mut accept = false;
        let mut readable = BTreeSet::new();
        let mut writable = BTreeSet::new();
        for ev in self.events.iter() {
            let key = SocketKey(ev.token().0);
            match key {
                WAKER => console = true,
                LISTENER => accept = true,
                _ => {
                    if ev.is_readable() || ev.is_read_closed() || ev.is_error() {
                        readable.insert(key);
                    }
                    if ev.is_writable() {
                        writable.insert(key);
                    }
                }
            }
        }
        let mut ready = Vec::with_capacity(readable.len() + writable.len() + 2);
        if console {
            ready.push(Ready::Console);
        }
        if accept {
            ready.push(Ready::Accept);
        }
        ready.extend(readable.into_iter().map(Ready::Readable));
        ready.extend(writable.into_iter().map(Ready::Writable));
        if !ready.is_empty() {
            debug!(count = ready.len(), "ready");
        }
        Ok(ready)
    }
}
