//! Peershare node: the reactor-driven session shared by the rendezvous server and
//! the file-sharing client, plus the console, config and command-line layers
//! around it.

pub mod cli;
pub mod command;
pub mod config;
pub mod console;
pub mod host;
pub mod reactor;
pub mod session;

pub use session::{
    CloseReason, ConnectionSummary, Role, Session, SessionError, SessionEvent, SessionOptions,
};
