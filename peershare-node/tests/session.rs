//! End-to-end sessions over loopback: one server, a few clients, real sockets.

use std::fs;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, TcpStream};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use peershare_core::{
    decode_message, encode_message, AvailablePeer, ConnectionId, Direction, Message, Status,
};
use peershare_node::{
    host, CloseReason, Role, Session, SessionError, SessionEvent, SessionOptions,
};
use rand::RngCore;
use tempfile::TempDir;

struct Node {
    session: Session,
    events: Vec<SessionEvent>,
    dir: TempDir,
}

impl Node {
    fn new(role: Role) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::bind(SessionOptions::local(role, dir.path())).unwrap();
        Self {
            session,
            events: Vec::new(),
            dir,
        }
    }

    fn port(&self) -> u16 {
        self.session.advertised().port()
    }

    fn poll(&mut self) {
        self.session.poll_once(Some(Duration::from_millis(5))).unwrap();
        self.events.extend(self.session.take_events());
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn saw(&self, pred: impl Fn(&SessionEvent) -> bool) -> bool {
        self.events.iter().any(pred)
    }
}

fn pump(nodes: &mut [&mut Node], mut done: impl FnMut(&[&mut Node]) -> bool) {
    for _ in 0..2000 {
        for node in nodes.iter_mut() {
            node.poll();
        }
        if done(&*nodes) {
            return;
        }
    }
    panic!("condition not reached");
}

/// Server plus two registered clients that both know about each other.
fn network() -> (Node, Node, Node) {
    let mut server = Node::new(Role::Server);
    let mut a = Node::new(Role::Client);
    let mut b = Node::new(Role::Client);
    let port = server.port();
    assert_eq!(a.session.register_to_server("127.0.0.1", port).unwrap(), ConnectionId(1));
    pump(&mut [&mut server, &mut a], |n| n[1].session.available_peers().len() == 1);
    b.session.register_to_server("127.0.0.1", port).unwrap();
    pump(&mut [&mut server, &mut a, &mut b], |n| {
        n[1].session.available_peers().len() == 2 && n[2].session.available_peers().len() == 2
    });
    (server, a, b)
}

/// `network()` with A connected to B as connection 2.
fn connected() -> (Node, Node, Node) {
    let (mut server, mut a, mut b) = network();
    let id = a.session.connect_to_peer("127.0.0.1", b.port()).unwrap();
    assert_eq!(id, ConnectionId(2));
    pump(&mut [&mut server, &mut a, &mut b], |n| {
        n[2].saw(|e| matches!(e, SessionEvent::PeerConnected { .. }))
    });
    (server, a, b)
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// Plain socket speaking the wire protocol by hand, connected to `port`.
fn raw_peer(port: u16) -> TcpStream {
    let raw = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
    raw.set_read_timeout(Some(Duration::from_millis(5))).unwrap();
    raw
}

fn send(raw: &mut TcpStream, msg: &Message) {
    raw.write_all(&encode_message(msg).unwrap()).unwrap();
}

/// Poll `node` until a whole message arrives on `raw`.
fn receive(node: &mut Node, raw: &mut TcpStream) -> Message {
    let mut inbound = Vec::new();
    for _ in 0..2000 {
        node.poll();
        let mut buf = [0u8; 64];
        match raw.read(&mut buf) {
            Ok(0) => panic!("closed while waiting for a message"),
            Ok(n) => inbound.extend_from_slice(&buf[..n]),
            Err(_) => {}
        }
        if let Ok((msg, _)) = decode_message(&inbound) {
            return msg;
        }
    }
    panic!("no message arrived");
}

/// Poll `node` until it closes its end of `raw`.
fn closed_by(node: &mut Node, raw: &mut TcpStream) -> bool {
    for _ in 0..2000 {
        node.poll();
        let mut buf = [0u8; 64];
        if let Ok(0) = raw.read(&mut buf) {
            return true;
        }
    }
    false
}

/// A client node with `raw` admitted as its peer connection 1.
fn raw_connected() -> (Node, TcpStream) {
    let mut a = Node::new(Role::Client);
    let mut raw = raw_peer(a.port());
    send(&mut raw, &Message::ConnectRequest { port: 9 });
    pump(&mut [&mut a], |n| {
        n[0].saw(|e| matches!(e, SessionEvent::PeerConnected { id: ConnectionId(1), .. }))
    });
    (a, raw)
}

#[test]
fn registration_broadcasts_list_with_self() {
    let mut server = Node::new(Role::Server);
    let mut a = Node::new(Role::Client);
    a.session.register_to_server("127.0.0.1", server.port()).unwrap();
    pump(&mut [&mut server, &mut a], |n| !n[1].session.available_peers().is_empty());

    let me = AvailablePeer::new(Ipv4Addr::LOCALHOST, a.port());
    assert_eq!(a.session.available_peers(), &[me]);
    let port = a.port();
    assert!(server.saw(|e| {
        matches!(e, SessionEvent::ClientRegistered { addr } if addr.port() == port)
    }));
    assert_eq!(server.session.registered_clients(), vec![me]);
    assert!(a.session.is_registered());
    assert!(matches!(
        a.session.register_to_server("127.0.0.1", server.port()),
        Err(SessionError::AlreadyRegistered)
    ));
}

#[test]
fn server_mode_refuses_client_commands() {
    let mut server = Node::new(Role::Server);
    assert!(matches!(
        server.session.register_to_server("127.0.0.1", 9),
        Err(SessionError::ServerMode("REGISTER"))
    ));
    assert!(matches!(
        server.session.download_from_peer(&[(ConnectionId(1), "a".into())]),
        Err(SessionError::ServerMode("DOWNLOAD"))
    ));
    assert!(matches!(
        server.session.terminate_connection(ConnectionId(1)),
        Err(SessionError::ServerMode("TERMINATE"))
    ));
}

#[test]
fn connect_requires_registration_and_listed_peer() {
    let stranger = Node::new(Role::Client);
    let (_server, mut a, b) = network();

    let mut lone = Node::new(Role::Client);
    assert!(matches!(
        lone.session.connect_to_peer("127.0.0.1", b.port()),
        Err(SessionError::NotRegistered)
    ));

    assert!(matches!(
        a.session.connect_to_peer("127.0.0.1", stranger.port()),
        Err(SessionError::UnknownPeer(_))
    ));
    let own = a.port();
    assert!(matches!(
        a.session.connect_to_peer("127.0.0.1", own),
        Err(SessionError::SelfConnect)
    ));
    assert_eq!(a.session.connections().len(), 1);
}

#[test]
fn connect_registers_on_both_sides() {
    let (_server, mut a, b) = connected();

    let rows = a.session.connections();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].is_server);
    assert_eq!(rows[1].id, Some(ConnectionId(2)));
    assert_eq!(rows[1].addr.port(), b.port());
    assert_eq!(rows[1].status, Status::Idle);

    let theirs = b.session.connections();
    assert_eq!(theirs.len(), 2);
    assert_eq!(theirs[1].addr.port(), a.port());
    assert_eq!(theirs[1].hostname, host::reverse_lookup(Ipv4Addr::LOCALHOST));

    assert!(matches!(
        a.session.connect_to_peer("127.0.0.1", b.port()),
        Err(SessionError::AlreadyConnected(_))
    ));
}

#[test]
fn rejected_download_settles_with_nothing_started() {
    let (mut server, mut a, mut b) = connected();

    let pairs = [(ConnectionId(2), "missing.txt".to_string())];
    assert_eq!(a.session.download_from_peer(&pairs).unwrap(), 1);
    assert!(a.session.is_input_held());
    pump(&mut [&mut server, &mut a, &mut b], |n| {
        n[1].saw(|e| matches!(e, SessionEvent::DownloadsSettled { .. }))
    });

    assert!(a.saw(|e| *e == SessionEvent::DownloadsSettled { requested: 1, started: 0 }));
    assert!(a.saw(|e| matches!(e,
        SessionEvent::DownloadRejected { file, .. } if file == "missing.txt")));
    assert!(a.saw(|e| *e == SessionEvent::InputResumed));
    assert!(!a.session.is_input_held());
    assert!(!a.path("missing.txt").exists());
    assert!(b.saw(|e| matches!(e, SessionEvent::RequestRefused { .. })));
}

#[test]
fn download_copies_file() {
    let (mut server, mut a, mut b) = connected();
    let data = random_bytes(4321);
    fs::write(b.path("blob.bin"), &data).unwrap();

    a.session.download_from_peer(&[(ConnectionId(2), "blob.bin".into())]).unwrap();
    pump(&mut [&mut server, &mut a, &mut b], |n| {
        n[1].saw(|e| matches!(e, SessionEvent::TransferComplete { .. }))
            && n[2].saw(|e| matches!(e, SessionEvent::TransferComplete { .. }))
    });

    assert_eq!(fs::read(a.path("blob.bin")).unwrap(), data);
    assert!(a.saw(|e| *e == SessionEvent::DownloadsSettled { requested: 1, started: 1 }));
    assert!(a.saw(|e| matches!(e,
        SessionEvent::TransferComplete { summary, .. }
            if summary.direction == Direction::Rx && summary.bytes == 4321)));
    assert!(b.saw(|e| matches!(e,
        SessionEvent::TransferComplete { summary, .. } if summary.direction == Direction::Tx)));
    assert_eq!(a.session.active_receives(), 0);
    assert_eq!(b.session.active_sends(), 0);
    assert!(!a.session.is_input_held());
}

#[test]
fn empty_file_downloads() {
    let (mut server, mut a, mut b) = connected();
    fs::write(b.path("empty"), b"").unwrap();

    a.session.download_from_peer(&[(ConnectionId(2), "empty".into())]).unwrap();
    pump(&mut [&mut server, &mut a, &mut b], |n| {
        n[1].saw(|e| matches!(e, SessionEvent::TransferComplete { .. }))
    });
    assert_eq!(fs::read(a.path("empty")).unwrap(), Vec::<u8>::new());
}

#[test]
fn upload_copies_file_under_its_base_name() {
    let (mut server, mut a, mut b) = connected();
    let data = random_bytes(2048);
    let src = a.path("report.dat");
    fs::write(&src, &data).unwrap();

    a.session.upload_to_peer(ConnectionId(2), &src).unwrap();
    pump(&mut [&mut server, &mut a, &mut b], |n| {
        n[2].saw(|e| matches!(e, SessionEvent::TransferComplete { .. }))
            && n[1].saw(|e| matches!(e, SessionEvent::TransferComplete { .. }))
    });

    assert_eq!(fs::read(b.path("report.dat")).unwrap(), data);
    assert!(a.saw(|e| matches!(e, SessionEvent::UploadStarted { size: 2048, .. })));
    assert!(b.saw(|e| matches!(e,
        SessionEvent::ReceivingFile { file, .. } if file == "report.dat")));
}

#[test]
fn busy_connection_and_bad_targets_are_refused() {
    let (_server, mut a, _b) = connected();
    let src = a.path("x.bin");
    fs::write(&src, random_bytes(10)).unwrap();

    assert!(matches!(
        a.session.upload_to_peer(ConnectionId(1), &src),
        Err(SessionError::ServerLink)
    ));
    assert!(matches!(
        a.session.upload_to_peer(ConnectionId(9), &src),
        Err(SessionError::InvalidConnectionId(ConnectionId(9)))
    ));
    let missing = a.path("nope");
    assert!(matches!(
        a.session.upload_to_peer(ConnectionId(2), &missing),
        Err(SessionError::File { .. })
    ));

    a.session.upload_to_peer(ConnectionId(2), &src).unwrap();
    assert!(matches!(
        a.session.upload_to_peer(ConnectionId(2), &src),
        Err(SessionError::Busy(ConnectionId(2)))
    ));
    assert!(matches!(
        a.session.download_from_peer(&[(ConnectionId(2), "y".into())]),
        Err(SessionError::NoDownloadsStarted)
    ));
    let events = a.session.take_events();
    assert!(events.iter().any(|e| matches!(e, SessionEvent::DownloadSkipped { .. })));
    assert!(matches!(
        a.session.download_from_peer(&[
            (ConnectionId(2), "1".into()),
            (ConnectionId(2), "2".into()),
            (ConnectionId(2), "3".into()),
            (ConnectionId(2), "4".into()),
        ]),
        Err(SessionError::TooManyDownloads { .. })
    ));
}

#[test]
fn terminate_closes_both_ends() {
    let (mut server, mut a, mut b) = connected();

    assert!(matches!(
        a.session.terminate_connection(ConnectionId(7)),
        Err(SessionError::InvalidConnectionId(_))
    ));
    a.session.terminate_connection(ConnectionId(2)).unwrap();
    assert_eq!(a.session.connections().len(), 1);
    pump(&mut [&mut server, &mut a, &mut b], |n| {
        n[2].saw(|e| {
            matches!(e, SessionEvent::ConnectionClosed { reason: CloseReason::PeerClosed, .. })
        })
    });
    assert_eq!(b.session.connections().len(), 1);
}

#[test]
fn departing_client_triggers_rebroadcast() {
    let (mut server, mut a, mut b) = network();
    b.session.shutdown();
    drop(b);
    pump(&mut [&mut server, &mut a], |n| n[1].session.available_peers().len() == 1);
    assert_eq!(
        a.session.available_peers(),
        &[AvailablePeer::new(Ipv4Addr::LOCALHOST, a.port())]
    );
    assert_eq!(server.session.connections().len(), 1);
}

#[test]
fn losing_the_server_closes_every_peer() {
    let (mut server, mut a, mut b) = connected();
    server.session.shutdown();
    pump(&mut [&mut a, &mut b], |n| n[0].saw(|e| *e == SessionEvent::ServerLost));
    assert!(a.session.connections().is_empty());
    assert!(!a.session.is_registered());
    assert!(a.session.available_peers().is_empty());
}

#[test]
fn garbage_first_message_is_dropped() {
    let mut server = Node::new(Role::Server);
    let mut raw = raw_peer(server.port());
    raw.write_all(&[0xff, 0xff, 0, 0]).unwrap();

    assert!(closed_by(&mut server, &mut raw));
    assert!(server.session.connections().is_empty());
    assert!(server.events.is_empty());
}

#[test]
fn half_sent_announcement_then_close_is_dropped() {
    let mut server = Node::new(Role::Server);
    let mut raw = raw_peer(server.port());
    raw.write_all(&[0x11]).unwrap();
    raw.shutdown(Shutdown::Write).unwrap();

    assert!(closed_by(&mut server, &mut raw));
    assert!(server.session.connections().is_empty());
    assert!(server.events.is_empty());

    // Nothing is left reporting end-of-stream, so an idle poll sits out its timeout.
    let started = Instant::now();
    server.session.poll_once(Some(Duration::from_millis(50))).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[test]
fn partial_message_then_close_tears_down_peer() {
    let (mut a, mut raw) = raw_connected();
    raw.write_all(&[0x31]).unwrap();
    raw.shutdown(Shutdown::Write).unwrap();

    assert!(closed_by(&mut a, &mut raw));
    assert!(a.saw(|e| {
        matches!(e, SessionEvent::ConnectionClosed { reason: CloseReason::PeerClosed, .. })
    }));
    assert!(a.session.connections().is_empty());
}

#[test]
fn unexpected_messages_on_peer_connection_are_violations() {
    let (mut a, mut raw) = raw_connected();
    raw.write_all(&[0xff, 0xff, 0, 0]).unwrap();
    assert!(closed_by(&mut a, &mut raw));
    assert!(a.saw(|e| matches!(e,
        SessionEvent::ConnectionClosed { id: Some(ConnectionId(1)), reason, .. }
            if matches!(reason, CloseReason::Violation(_)))));

    // A well-formed message that only a server may send.
    let mut other = raw_peer(a.port());
    send(&mut other, &Message::ConnectRequest { port: 10 });
    send(&mut other, &Message::MyPort { port: 10 });
    assert!(closed_by(&mut a, &mut other));
    assert!(a.saw(|e| matches!(e,
        SessionEvent::ConnectionClosed { id: Some(ConnectionId(2)), reason, .. }
            if matches!(reason, CloseReason::Violation(_)))));
    assert!(a.session.connections().is_empty());
}

#[test]
fn peer_closing_mid_upload_fails_the_receive() {
    let (mut a, mut raw) = raw_connected();
    send(&mut raw, &Message::UploadRequest { size: 10_000, name: "part.bin".into() });
    assert_eq!(receive(&mut a, &mut raw), Message::UploadAccept);
    assert_eq!(a.session.active_receives(), 1);
    assert!(a.session.is_input_held());

    raw.write_all(&random_bytes(4000)).unwrap();
    drop(raw);
    pump(&mut [&mut a], |n| n[0].saw(|e| matches!(e, SessionEvent::TransferFailed { .. })));

    assert!(a.saw(|e| matches!(e,
        SessionEvent::TransferFailed { file, .. } if file == "part.bin")));
    assert!(a.saw(|e| *e == SessionEvent::InputResumed));
    assert_eq!(a.session.active_receives(), 0);
    assert!(!a.session.is_input_held());
    assert!(a.session.connections().is_empty());
    assert_eq!(fs::metadata(a.path("part.bin")).unwrap().len(), 4000);
}

#[test]
fn batch_across_peers_settles_with_one_started() {
    let (mut server, mut a, mut b) = network();
    let mut c = Node::new(Role::Client);
    c.session.register_to_server("127.0.0.1", server.port()).unwrap();
    pump(&mut [&mut server, &mut a, &mut b, &mut c], |n| {
        n[1].session.available_peers().len() == 3
    });
    let (b_port, c_port) = (b.port(), c.port());
    assert_eq!(a.session.connect_to_peer("127.0.0.1", b_port).unwrap(), ConnectionId(2));
    assert_eq!(a.session.connect_to_peer("127.0.0.1", c_port).unwrap(), ConnectionId(3));
    pump(&mut [&mut server, &mut a, &mut b, &mut c], |n| {
        n[2].saw(|e| matches!(e, SessionEvent::PeerConnected { .. }))
            && n[3].saw(|e| matches!(e, SessionEvent::PeerConnected { .. }))
    });
    let data = random_bytes(2500);
    fs::write(b.path("have.bin"), &data).unwrap();

    let pairs = [
        (ConnectionId(2), "have.bin".to_string()),
        (ConnectionId(3), "lack.bin".to_string()),
    ];
    assert_eq!(a.session.download_from_peer(&pairs).unwrap(), 2);
    pump(&mut [&mut server, &mut a, &mut b, &mut c], |n| {
        n[1].saw(|e| matches!(e, SessionEvent::DownloadsSettled { .. }))
            && n[1].saw(|e| matches!(e, SessionEvent::TransferComplete { .. }))
    });

    assert!(a.saw(|e| *e == SessionEvent::DownloadsSettled { requested: 2, started: 1 }));
    assert!(a.saw(|e| matches!(e,
        SessionEvent::DownloadRejected { id: ConnectionId(3), file } if file == "lack.bin")));
    assert_eq!(fs::read(a.path("have.bin")).unwrap(), data);
    assert!(!a.path("lack.bin").exists());
    assert!(!a.session.is_input_held());
}
