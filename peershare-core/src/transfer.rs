//! Transfer state machine: chunked, resumable send/receive of one file per connection.
//!
//! A connection's context is either idle or owns an open file while it moves the file
//! one block per step. Steps are driven by socket readiness, so a transfer spans many
//! wake-ups of the event loop. Reaching zero remaining bytes returns the context to
//! idle and drops the file in the same call that reports completion.

use std::fmt;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use crate::protocol::BLOCK_SIZE;

/// Coarse transfer status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Sending,
    Receiving,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Idle => "idle",
            Status::Sending => "sending",
            Status::Receiving => "receiving",
        })
    }
}

/// Which way a finished transfer moved data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

/// An in-flight transfer. Only reachable through a non-idle [`TransferContext`], so an
/// active transfer always has its file.
#[derive(Debug)]
pub struct ActiveTransfer<F> {
    file: F,
    file_name: String,
    total_size: u64,
    bytes_remaining: u64,
    elapsed: Duration,
    /// Block read from the file but not yet accepted by the socket.
    staged: Vec<u8>,
}

impl<F> ActiveTransfer<F> {
    fn new(file: F, file_name: String, total_size: u64) -> Self {
        Self {
            file,
            file_name,
            total_size,
            bytes_remaining: total_size,
            elapsed: Duration::ZERO,
            staged: Vec::new(),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn bytes_remaining(&self) -> u64 {
        self.bytes_remaining
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    fn into_summary(self, direction: Direction) -> TransferSummary {
        TransferSummary {
            direction,
            file_name: self.file_name,
            bytes: self.total_size,
            elapsed: self.elapsed,
        }
    }
}

impl<F: Read> ActiveTransfer<F> {
    /// Returns `Ok(None)` when the socket would block; the staged block is kept for the next call.
    fn send_block<W: Write + ?Sized>(
        &mut self,
        socket: &mut W,
    ) -> Result<Option<usize>, TransferError> {
        let started = Instant::now();
        if self.staged.is_empty() {
            let want = self.bytes_remaining.min(BLOCK_SIZE as u64) as usize;
            self.staged.resize(want, 0);
            let n = match self.file.read(&mut self.staged) {
                Ok(n) => n,
                Err(e) => return Err(TransferError::FileRead(e)),
            };
            if n == 0 {
                return Err(TransferError::FileTruncated {
                    remaining: self.bytes_remaining,
                });
            }
            self.staged.truncate(n);
        }
        let expected = self.staged.len();
        match socket.write(&self.staged) {
            Ok(written) if written == expected => {}
            Ok(written) => return Err(TransferError::ShortWrite { expected, written }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.elapsed += started.elapsed();
                return Ok(None);
            }
            Err(e) => return Err(TransferError::Socket(e)),
        }
        self.staged.clear();
        self.bytes_remaining -= expected as u64;
        self.elapsed += started.elapsed();
        Ok(Some(expected))
    }
}

impl<F: Write> ActiveTransfer<F> {
    fn receive_block<R: Read + ?Sized>(
        &mut self,
        socket: &mut R,
    ) -> Result<Option<usize>, TransferError> {
        let mut buf = [0u8; BLOCK_SIZE];
        let want = self.bytes_remaining.min(BLOCK_SIZE as u64) as usize;
        let started = Instant::now();
        let n = match socket.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(TransferError::PeerClosed {
                    remaining: self.bytes_remaining,
                })
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(TransferError::Socket(e)),
        };
        self.file
            .write_all(&buf[..n])
            .map_err(TransferError::FileWrite)?;
        self.bytes_remaining -= n as u64;
        self.elapsed += started.elapsed();
        Ok(Some(n))
    }
}

/// Per-connection transfer context.
#[derive(Debug)]
pub enum TransferContext<F> {
    Idle,
    Sending(ActiveTransfer<F>),
    Receiving(ActiveTransfer<F>),
}

impl<F> Default for TransferContext<F> {
    fn default() -> Self {
        TransferContext::Idle
    }
}

/// Outcome of one transfer step.
#[derive(Debug)]
pub enum Step {
    /// One block moved; the context stays active.
    Progress { moved: usize, bytes_remaining: u64 },
    /// The socket was not ready; nothing moved.
    Blocked,
    /// Nothing remains. The context is idle and the file has been released.
    Complete(TransferSummary),
}

impl<F> TransferContext<F> {
    pub fn status(&self) -> Status {
        match self {
            TransferContext::Idle => Status::Idle,
            TransferContext::Sending(_) => Status::Sending,
            TransferContext::Receiving(_) => Status::Receiving,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, TransferContext::Idle)
    }

    pub fn active(&self) -> Option<&ActiveTransfer<F>> {
        match self {
            TransferContext::Idle => None,
            TransferContext::Sending(a) | TransferContext::Receiving(a) => Some(a),
        }
    }

    pub fn bytes_remaining(&self) -> Option<u64> {
        self.active().map(ActiveTransfer::bytes_remaining)
    }

    /// Begin sending `file`. Only an idle context accepts a new transfer.
    pub fn start_sending(
        &mut self,
        file: F,
        file_name: impl Into<String>,
        size: u64,
    ) -> Result<(), TransferError> {
        self.ensure_idle()?;
        *self = TransferContext::Sending(ActiveTransfer::new(file, file_name.into(), size));
        Ok(())
    }

    /// Begin receiving `size` bytes into `file`. Only an idle context accepts a new transfer.
    pub fn start_receiving(
        &mut self,
        file: F,
        file_name: impl Into<String>,
        size: u64,
    ) -> Result<(), TransferError> {
        self.ensure_idle()?;
        *self = TransferContext::Receiving(ActiveTransfer::new(file, file_name.into(), size));
        Ok(())
    }

    /// Drop any active transfer (and its file) without completing it. Returns the status it had.
    pub fn abandon(&mut self) -> Status {
        let status = self.status();
        *self = TransferContext::Idle;
        status
    }

    fn ensure_idle(&self) -> Result<(), TransferError> {
        match self.status() {
            Status::Idle => Ok(()),
            busy => Err(TransferError::Busy(busy)),
        }
    }

    fn finish_step(&mut self, moved: usize) -> Step {
        if let Some(remaining) = self.bytes_remaining().filter(|r| *r > 0) {
            return Step::Progress {
                moved,
                bytes_remaining: remaining,
            };
        }
        match std::mem::take(self) {
            TransferContext::Sending(a) => Step::Complete(a.into_summary(Direction::Tx)),
            TransferContext::Receiving(a) => Step::Complete(a.into_summary(Direction::Rx)),
            TransferContext::Idle => Step::Blocked,
        }
    }
}

impl<F: Read> TransferContext<F> {
    /// Read one block from the file and write it to `socket`.
    ///
    /// A socket that accepts only part of a block is a hard failure; a socket that
    /// accepts nothing (`WouldBlock`) keeps the block staged for the next call. Any
    /// failure abandons the transfer.
    pub fn advance_send<W: Write + ?Sized>(
        &mut self,
        socket: &mut W,
    ) -> Result<Step, TransferError> {
        let active = match self {
            TransferContext::Sending(active) => active,
            other => {
                return Err(TransferError::WrongState {
                    expected: Status::Sending,
                    actual: other.status(),
                })
            }
        };
        let mut moved = 0;
        if active.bytes_remaining > 0 {
            match active.send_block(socket) {
                Ok(Some(n)) => moved = n,
                Ok(None) => return Ok(Step::Blocked),
                Err(e) => {
                    *self = TransferContext::Idle;
                    return Err(e);
                }
            }
        }
        Ok(self.finish_step(moved))
    }
}

impl<F: Write> TransferContext<F> {
    /// Read up to one block from `socket` and append it to the file.
    ///
    /// A zero-length read means the peer closed mid-transfer: the transfer is abandoned
    /// and whatever was written so far stays in the file.
    pub fn advance_receive<R: Read + ?Sized>(
        &mut self,
        socket: &mut R,
    ) -> Result<Step, TransferError> {
        let active = match self {
            TransferContext::Receiving(active) => active,
            other => {
                return Err(TransferError::WrongState {
                    expected: Status::Receiving,
                    actual: other.status(),
                })
            }
        };
        let mut moved = 0;
        if active.bytes_remaining > 0 {
            match active.receive_block(socket) {
                Ok(Some(n)) => moved = n,
                Ok(None) => return Ok(Step::Blocked),
                Err(e) => {
                    *self = TransferContext::Idle;
                    return Err(e);
                }
            }
        }
        let flushed = match self {
            TransferContext::Receiving(a) if a.bytes_remaining == 0 => a.file.flush(),
            _ => Ok(()),
        };
        if let Err(e) = flushed {
            *self = TransferContext::Idle;
            return Err(TransferError::FileWrite(e));
        }
        Ok(self.finish_step(moved))
    }
}

/// Completion report for one transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSummary {
    pub direction: Direction,
    pub file_name: String,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl TransferSummary {
    /// bytes * 8 / elapsed seconds; 0 when no measurable time elapsed.
    pub fn bits_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 * 8.0 / secs
    }
}

/// Error driving a transfer. Every variant except `Busy` and `WrongState` leaves the context idle.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("connection is already {0}")]
    Busy(Status),
    #[error("expected a {expected} context, found {actual}")]
    WrongState { expected: Status, actual: Status },
    #[error("reading file: {0}")]
    FileRead(#[source] io::Error),
    #[error("file ended with {remaining} bytes still expected")]
    FileTruncated { remaining: u64 },
    #[error("writing file: {0}")]
    FileWrite(#[source] io::Error),
    #[error("socket: {0}")]
    Socket(#[source] io::Error),
    #[error("short write: socket took {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },
    #[error("peer closed the connection with {remaining} bytes outstanding")]
    PeerClosed { remaining: u64 },
}
