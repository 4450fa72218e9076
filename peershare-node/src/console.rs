//! Interactive console. Stdin lines and shutdown signals are collected on a
//! helper thread running a small tokio runtime, which wakes the reactor; commands
//! run on the session thread between polls.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use mio::Waker;
use peershare_core::Direction;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, warn};

use crate::command::{self, Command};
use crate::session::{Role, Session, SessionError, SessionEvent};

/// Receiving end of the console helper thread.
pub struct Console {
    lines: Receiver<String>,
    shutdown: Arc<AtomicBool>,
}

impl Console {
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Start the helper thread. Each line read (and a shutdown signal) wakes `waker`.
pub fn spawn(waker: Arc<Waker>) -> io::Result<Console> {
    let (tx, rx) = mpsc::channel();
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    thread::Builder::new()
        .name("console".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "console runtime failed to start");
                    return;
                }
            };
            rt.block_on(read_input(tx, flag, waker));
        })?;
    Ok(Console {
        lines: rx,
        shutdown,
    })
}

async fn read_input(tx: Sender<String>, shutdown: Arc<AtomicBool>, waker: Arc<Waker>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let signal = shutdown_signal();
    tokio::pin!(signal);
    let mut stdin_open = true;
    let mut signals = true;
    loop {
        tokio::select! {
            res = &mut signal, if signals => match res {
                Ok(()) => {
                    shutdown.store(true, Ordering::SeqCst);
                    wake(&waker);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "signal handlers unavailable");
                    signals = false;
                }
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                    wake(&waker);
                }
                Ok(None) => {
                    debug!("console input closed");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "console read failed");
                    stdin_open = false;
                }
            },
            else => return,
        }
    }
}

fn wake(waker: &Waker) {
    if let Err(e) = waker.wake() {
        warn!(error = %e, "cannot wake reactor");
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Drive the session until EXIT or a shutdown signal, then close every connection.
pub fn run(mut session: Session, console: Console) -> io::Result<()> {
    print_banner(&session);
    prompt();
    'outer: loop {
        session.poll_once(None)?;
        render_events(&mut session);
        if console.shutdown_requested() {
            println!();
            break;
        }
        if session.is_input_held() {
            continue;
        }
        while let Ok(line) = console.lines.try_recv() {
            let flow = handle_line(&mut session, &line);
            render_events(&mut session);
            if flow == Flow::Exit {
                break 'outer;
            }
            if session.is_input_held() {
                break;
            }
            prompt();
        }
    }
    session.shutdown();
    println!("Bye.");
    Ok(())
}

fn handle_line(session: &mut Session, line: &str) -> Flow {
    match command::parse(line) {
        Ok(None) => Flow::Continue,
        Ok(Some(cmd)) => match execute(session, cmd) {
            Ok(flow) => flow,
            Err(e) => {
                println!("Error: {e}");
                Flow::Continue
            }
        },
        Err(e) => {
            println!("Error: {e}");
            Flow::Continue
        }
    }
}

/// Run one command against the session.
pub fn execute(session: &mut Session, cmd: Command) -> Result<Flow, SessionError> {
    match cmd {
        Command::Help => print_help(session.role()),
        Command::MyIp => println!("IP address: {}", session.advertised().ip()),
        Command::MyPort => println!("Listening port: {}", session.advertised().port()),
        Command::Register { host, port } => {
            let id = session.register_to_server(&host, port)?;
            println!("Registered with server {host}:{port} as connection {id}");
        }
        Command::Connect { host, port } => {
            session.connect_to_peer(&host, port)?;
        }
        Command::List => print_connections(session),
        Command::Peers => {
            if session.role() == Role::Server {
                return Err(SessionError::ServerMode("PEERS"));
            }
            print_available(session);
        }
        Command::Terminate(id) => session.terminate_connection(id)?,
        Command::Upload { id, path } => {
            session.upload_to_peer(id, &path)?;
            println!("Upload request sent for {}", path.display());
        }
        Command::Download(pairs) => {
            let sent = session.download_from_peer(&pairs)?;
            println!("{sent} download request(s) sent, waiting for replies...");
        }
        Command::Exit => return Ok(Flow::Exit),
    }
    Ok(Flow::Continue)
}

fn render_events(session: &mut Session) {
    let events = session.take_events();
    if events.is_empty() {
        return;
    }
    for event in &events {
        println!("{}", describe(event));
    }
    if !session.is_input_held() {
        prompt();
    }
}

/// One console line per event.
pub fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::ClientRegistered { addr } => format!("Client {addr} registered"),
        SessionEvent::PeerListUpdated { peers } => {
            let list: Vec<String> = peers.iter().map(ToString::to_string).collect();
            format!("Available peers updated: {}", list.join(", "))
        }
        SessionEvent::PeerConnected { id, addr, hostname } => {
            format!("Connection {id} established with {hostname} ({addr})")
        }
        SessionEvent::ConnectionClosed {
            id,
            addr,
            hostname,
            reason,
        } => match id {
            Some(id) => format!("Connection {id} to {hostname} ({addr}) closed: {reason}"),
            None => format!("Client {addr} disconnected: {reason}"),
        },
        SessionEvent::ServerLost => {
            "Server connection lost; all peer connections closed. Please register again."
                .to_string()
        }
        SessionEvent::UploadStarted { id, file, size } => {
            format!("Uploading {file} ({size} bytes) on connection {id}")
        }
        SessionEvent::UploadRejected { id, file } => {
            format!("Connection {id} rejected the upload of {file}")
        }
        SessionEvent::ReceivingFile { id, file, size } => {
            format!("Receiving {file} ({size} bytes) on connection {id}")
        }
        SessionEvent::SendingFile { id, file, size } => {
            format!("Sending {file} ({size} bytes) on connection {id}")
        }
        SessionEvent::RequestRefused { id, file, reason } => {
            format!("Refused request for {file} from connection {id}: {reason}")
        }
        SessionEvent::DownloadRejected { id, file } => {
            format!("Connection {id} rejected the download of {file}")
        }
        SessionEvent::DownloadSkipped { id, file, reason } => {
            format!("Cannot download {file} from connection {id}: {reason}")
        }
        SessionEvent::DownloadsSettled { requested, started } => {
            if *started == 0 {
                "No files could be downloaded".to_string()
            } else {
                format!("{started} of {requested} download(s) started")
            }
        }
        SessionEvent::TransferComplete {
            id,
            hostname,
            summary,
        } => {
            let (verb, dir) = match summary.direction {
                Direction::Tx => ("Sent", "to"),
                Direction::Rx => ("Received", "from"),
            };
            format!(
                "{verb} {} ({} bytes) {dir} {hostname} on connection {id} in {:.6}s, {:.0} bits/s",
                summary.file_name,
                summary.bytes,
                summary.elapsed.as_secs_f64(),
                summary.bits_per_second()
            )
        }
        SessionEvent::TransferFailed { id, file, error } => {
            format!("Transfer of {file} on connection {id} failed: {error}")
        }
        SessionEvent::InputResumed => "All downloads complete".to_string(),
    }
}

fn print_banner(session: &Session) {
    let who = match session.role() {
        Role::Server => "Server",
        Role::Client => "Client",
    };
    println!("{who} listening on {}. Type HELP for commands.", session.advertised());
}

fn print_help(role: Role) {
    println!("Commands:");
    println!("  HELP                         show this list");
    println!("  MYIP                         show this node's IP address");
    println!("  MYPORT                       show this node's listening port");
    println!("  LIST                         list open connections");
    if role == Role::Client {
        println!("  REGISTER <server> <port>     register with the server");
        println!("  CONNECT <peer> <port>        connect to an available peer");
        println!("  PEERS                        list peers available to connect to");
        println!("  TERMINATE <id>               close a connection");
        println!("  UPLOAD <id> <file>           send a file to a peer");
        println!("  DOWNLOAD <id> <file> ...     fetch up to 3 files from peers");
    }
    println!("  EXIT                         close all connections and quit");
}

fn print_connections(session: &Session) {
    let rows = session.connections();
    if rows.is_empty() {
        println!("No connections");
        return;
    }
    println!("{:<4} {:<32} {:<22} {}", "id", "hostname", "address", "status");
    for row in rows {
        let id = row.id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string());
        let status = if row.is_server {
            "server".to_string()
        } else {
            row.status.to_string()
        };
        println!("{:<4} {:<32} {:<22} {}", id, row.hostname, row.addr.to_string(), status);
    }
}

fn print_available(session: &Session) {
    if !session.is_registered() {
        println!("Not registered with a server");
        return;
    }
    let peers = session.available_peers();
    if peers.is_empty() {
        println!("No peers available");
        return;
    }
    for (n, peer) in peers.iter().enumerate() {
        println!("{:<4} {}", n + 1, peer);
    }
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}
