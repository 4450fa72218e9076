//! Console command parsing. Verbs are case-insensitive; arguments are
//! whitespace-separated.

use std::path::PathBuf;

use peershare_core::{ConnectionId, MAX_DOWNLOADS};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    MyIp,
    MyPort,
    Register { host: String, port: u16 },
    Connect { host: String, port: u16 },
    List,
    Peers,
    Terminate(ConnectionId),
    Upload { id: ConnectionId, path: PathBuf },
    Download(Vec<(ConnectionId, String)>),
    Exit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command {0:?}, type HELP for the list of commands")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("invalid connection id {0:?}")]
    InvalidId(String),
    #[error("at most {0} files per DOWNLOAD command")]
    TooManyDownloads(usize),
}

const REGISTER_USAGE: &str = "REGISTER <server ip or hostname> <port>";
const CONNECT_USAGE: &str = "CONNECT <peer ip or hostname> <port>";
const TERMINATE_USAGE: &str = "TERMINATE <connection id>";
const UPLOAD_USAGE: &str = "UPLOAD <connection id> <file>";
const DOWNLOAD_USAGE: &str = "DOWNLOAD <connection id> <file> [<connection id> <file> ...]";

/// Parse one input line. Blank lines parse to `None`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();
    let cmd = match verb.to_ascii_uppercase().as_str() {
        "HELP" => bare(&args, "HELP", Command::Help)?,
        "MYIP" => bare(&args, "MYIP", Command::MyIp)?,
        "MYPORT" => bare(&args, "MYPORT", Command::MyPort)?,
        "LIST" => bare(&args, "LIST", Command::List)?,
        "PEERS" => bare(&args, "PEERS", Command::Peers)?,
        "EXIT" => bare(&args, "EXIT", Command::Exit)?,
        "REGISTER" => {
            let [host, port] = args[..] else {
                return Err(CommandError::Usage(REGISTER_USAGE));
            };
            Command::Register {
                host: host.to_string(),
                port: parse_port(port)?,
            }
        }
        "CONNECT" => {
            let [host, port] = args[..] else {
                return Err(CommandError::Usage(CONNECT_USAGE));
            };
            Command::Connect {
                host: host.to_string(),
                port: parse_port(port)?,
            }
        }
        "TERMINATE" => {
            let [id] = args[..] else {
                return Err(CommandError::Usage(TERMINATE_USAGE));
            };
            Command::Terminate(parse_id(id)?)
        }
        "UPLOAD" => {
            let [id, path] = args[..] else {
                return Err(CommandError::Usage(UPLOAD_USAGE));
            };
            Command::Upload {
                id: parse_id(id)?,
                path: PathBuf::from(path),
            }
        }
        "DOWNLOAD" => {
            if args.is_empty() || args.len() % 2 != 0 {
                return Err(CommandError::Usage(DOWNLOAD_USAGE));
            }
            if args.len() / 2 > MAX_DOWNLOADS {
                return Err(CommandError::TooManyDownloads(MAX_DOWNLOADS));
            }
            let pairs = args
                .chunks(2)
                .map(|pair| Ok((parse_id(pair[0])?, pair[1].to_string())))
                .collect::<Result<Vec<_>, CommandError>>()?;
            Command::Download(pairs)
        }
        _ => return Err(CommandError::Unknown(verb.to_string())),
    };
    Ok(Some(cmd))
}

fn bare(args: &[&str], usage: &'static str, cmd: Command) -> Result<Command, CommandError> {
    if args.is_empty() {
        Ok(cmd)
    } else {
        Err(CommandError::Usage(usage))
    }
}

fn parse_port(s: &str) -> Result<u16, CommandError> {
    match s.parse::<u16>() {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(CommandError::InvalidPort(s.to_string())),
    }
}

fn parse_id(s: &str) -> Result<ConnectionId, CommandError> {
    match s.parse::<u32>() {
        Ok(id) if id != 0 => Ok(ConnectionId(id)),
        _ => Err(CommandError::InvalidId(s.to_string())),
    }
}
