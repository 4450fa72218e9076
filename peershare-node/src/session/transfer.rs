//! Upload and download negotiation, and block-by-block transfer driving.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path};

use peershare_core::{
    ConnectionId, Message, Negotiation, SocketKey, Step, TransferError, MAX_DOWNLOADS,
    MAX_NAME_LEN,
};
use tracing::{debug, error, info, warn};

use super::{send_message, CloseReason, DownloadBatch, Session, SessionError, SessionEvent};

impl Session {
    /// Offer a local file to a connected peer. The transfer starts when the
    /// peer's UPLOAD_ACCEPT arrives.
    pub fn upload_to_peer(&mut self, id: ConnectionId, path: &Path) -> Result<(), SessionError> {
        self.require_client("UPLOAD")?;
        let key = self.peer_key(id)?;
        if !self.registry.find_by_socket(key).is_some_and(|r| r.is_ready()) {
            return Err(SessionError::Busy(id));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| is_plain_name(n))
            .ok_or_else(|| SessionError::InvalidName(path.display().to_string()))?
            .to_string();
        let file_error = |source| SessionError::File {
            path: path.to_path_buf(),
            source,
        };
        let meta = std::fs::metadata(path).map_err(file_error)?;
        if !meta.is_file() {
            return Err(SessionError::NotAFile(path.to_path_buf()));
        }
        File::open(path).map_err(file_error)?;
        let size = meta.len();

        let Some(record) = self.registry.find_by_socket_mut(key) else {
            return Err(SessionError::InvalidConnectionId(id));
        };
        let request = Message::UploadRequest {
            size,
            name: name.clone(),
        };
        if let Err(e) = send_message(&mut record.socket, &request) {
            self.close_connection(key, CloseReason::Io(e.to_string()));
            return Err(e);
        }
        record.pending = Some(Negotiation::Upload {
            path: path.to_path_buf(),
            name,
            size,
        });
        info!(%id, path = %path.display(), size, "upload requested");
        Ok(())
    }

    /// Request up to [`MAX_DOWNLOADS`] files, each from its own connection.
    /// Returns how many requests went out; pairs that could not be requested are
    /// reported as [`SessionEvent::DownloadSkipped`]. Console input stays held
    /// until every request has been answered.
    pub fn download_from_peer(
        &mut self,
        pairs: &[(ConnectionId, String)],
    ) -> Result<usize, SessionError> {
        self.require_client("DOWNLOAD")?;
        if pairs.len() > MAX_DOWNLOADS {
            return Err(SessionError::TooManyDownloads {
                max: MAX_DOWNLOADS,
                got: pairs.len(),
            });
        }
        if self.batch.is_some() {
            return Err(SessionError::DownloadsPending);
        }
        let mut sent = 0;
        for (id, name) in pairs {
            match self.request_download(*id, name) {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(%id, file = %name, error = %e, "download not requested");
                    self.emit(SessionEvent::DownloadSkipped {
                        id: *id,
                        file: name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        if sent == 0 {
            return Err(SessionError::NoDownloadsStarted);
        }
        self.batch = Some(DownloadBatch {
            requested: pairs.len(),
            outstanding: sent,
            started: 0,
        });
        self.update_input_gate();
        Ok(sent)
    }

    fn request_download(&mut self, id: ConnectionId, name: &str) -> Result<(), SessionError> {
        if !is_plain_name(name) {
            return Err(SessionError::InvalidName(name.to_string()));
        }
        let key = self.peer_key(id)?;
        let Some(record) = self.registry.find_by_socket_mut(key) else {
            return Err(SessionError::InvalidConnectionId(id));
        };
        if !record.is_ready() {
            return Err(SessionError::Busy(id));
        }
        let request = Message::DownloadRequest {
            name: name.to_string(),
        };
        if let Err(e) = send_message(&mut record.socket, &request) {
            self.close_connection(key, CloseReason::Io(e.to_string()));
            return Err(e);
        }
        record.pending = Some(Negotiation::Download {
            name: name.to_string(),
        });
        debug!(%id, file = %name, "download requested");
        Ok(())
    }

    /// Key of a peer connection; the server link is not a file peer.
    fn peer_key(&self, id: ConnectionId) -> Result<SocketKey, SessionError> {
        let record = self
            .registry
            .find_by_id(id)
            .ok_or(SessionError::InvalidConnectionId(id))?;
        if Some(record.key()) == self.server_key {
            return Err(SessionError::ServerLink);
        }
        Ok(record.key())
    }

    /// Requests from the peer, and replies to requests we sent it.
    pub(super) fn on_peer_message(
        &mut self,
        key: SocketKey,
        msg: Message,
    ) -> Result<(), CloseReason> {
        let Some(record) = self.registry.find_by_socket_mut(key) else {
            return Ok(());
        };
        let Some(id) = record.id() else {
            return Ok(());
        };
        match (record.pending.take(), msg) {
            (Some(Negotiation::Upload { path, name, size }), Message::UploadAccept) => {
                self.begin_upload(key, id, &path, name, size)
            }
            (Some(Negotiation::Upload { name, .. }), Message::UploadReject) => {
                info!(%id, file = %name, "upload rejected");
                self.emit(SessionEvent::UploadRejected { id, file: name });
                Ok(())
            }
            (Some(Negotiation::Download { name }), Message::DownloadAccept { size }) => {
                self.begin_download(key, id, name, size)
            }
            (Some(Negotiation::Download { name }), Message::DownloadReject) => {
                info!(%id, file = %name, "download rejected");
                self.emit(SessionEvent::DownloadRejected { id, file: name });
                self.settle_download(false);
                Ok(())
            }
            (pending, Message::DownloadRequest { name }) => {
                self.restore_pending(key, pending);
                self.serve_download(key, id, name)
            }
            (pending, Message::UploadRequest { size, name }) => {
                self.restore_pending(key, pending);
                self.accept_upload(key, id, size, name)
            }
            (pending, other) => {
                self.restore_pending(key, pending);
                Err(CloseReason::Violation(format!(
                    "unexpected {:?}",
                    other.message_type()
                )))
            }
        }
    }

    fn restore_pending(&mut self, key: SocketKey, pending: Option<Negotiation>) {
        if let Some(record) = self.registry.find_by_socket_mut(key) {
            record.pending = pending;
        }
    }

    /// The peer accepted our upload: open the file and start sending.
    fn begin_upload(
        &mut self,
        key: SocketKey,
        id: ConnectionId,
        path: &Path,
        name: String,
        size: u64,
    ) -> Result<(), CloseReason> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                let error = format!("{}: {e}", path.display());
                error!(%id, %error, "cannot open local file");
                self.emit(SessionEvent::TransferFailed {
                    id,
                    file: name,
                    error: error.clone(),
                });
                return Err(CloseReason::Io(error));
            }
        };
        self.start_sending(key, file, &name, size)?;
        info!(%id, file = %name, size, "upload started");
        self.emit(SessionEvent::UploadStarted { id, file: name, size });
        Ok(())
    }

    /// The peer agreed to send `name`: create the local file and start receiving.
    fn begin_download(
        &mut self,
        key: SocketKey,
        id: ConnectionId,
        name: String,
        size: u64,
    ) -> Result<(), CloseReason> {
        let path = self.data_dir.join(&name);
        let file = match File::create(&path) {
            Ok(file) => file,
            Err(e) => {
                let error = format!("{}: {e}", path.display());
                error!(%id, %error, "cannot open local file");
                self.emit(SessionEvent::TransferFailed {
                    id,
                    file: name,
                    error: error.clone(),
                });
                self.settle_download(false);
                return Err(CloseReason::Io(error));
            }
        };
        self.start_receiving(key, file, &name, size)?;
        info!(%id, file = %name, size, "download started");
        self.emit(SessionEvent::ReceivingFile { id, file: name, size });
        self.settle_download(true);
        Ok(())
    }

    /// The peer asked for one of our files.
    fn serve_download(
        &mut self,
        key: SocketKey,
        id: ConnectionId,
        name: String,
    ) -> Result<(), CloseReason> {
        let (file, size) = match self.open_for_serving(key, &name) {
            Ok(opened) => opened,
            Err(reason) => return self.refuse(key, id, name, reason, Message::DownloadReject),
        };
        self.reply(key, &Message::DownloadAccept { size })?;
        self.start_sending(key, file, &name, size)?;
        info!(%id, file = %name, size, "serving download");
        self.emit(SessionEvent::SendingFile { id, file: name, size });
        Ok(())
    }

    /// The peer wants to store a file with us.
    fn accept_upload(
        &mut self,
        key: SocketKey,
        id: ConnectionId,
        size: u64,
        name: String,
    ) -> Result<(), CloseReason> {
        let file = match self.open_for_receiving(key, &name) {
            Ok(file) => file,
            Err(reason) => return self.refuse(key, id, name, reason, Message::UploadReject),
        };
        self.reply(key, &Message::UploadAccept)?;
        self.start_receiving(key, file, &name, size)?;
        info!(%id, file = %name, size, "receiving upload");
        self.emit(SessionEvent::ReceivingFile { id, file: name, size });
        Ok(())
    }

    fn open_for_serving(&self, key: SocketKey, name: &str) -> Result<(File, u64), String> {
        self.check_ready(key, name)?;
        let path = self.data_dir.join(name);
        let file = File::open(&path).map_err(|e| e.to_string())?;
        let meta = file.metadata().map_err(|e| e.to_string())?;
        if !meta.is_file() {
            return Err("not a regular file".to_string());
        }
        Ok((file, meta.len()))
    }

    fn open_for_receiving(&self, key: SocketKey, name: &str) -> Result<File, String> {
        self.check_ready(key, name)?;
        File::create(self.data_dir.join(name)).map_err(|e| e.to_string())
    }

    fn check_ready(&self, key: SocketKey, name: &str) -> Result<(), String> {
        if !self.registry.find_by_socket(key).is_some_and(|r| r.is_ready()) {
            return Err("connection is busy".to_string());
        }
        if !is_plain_name(name) {
            return Err("not a plain file name".to_string());
        }
        Ok(())
    }

    fn refuse(
        &mut self,
        key: SocketKey,
        id: ConnectionId,
        file: String,
        reason: String,
        reply: Message,
    ) -> Result<(), CloseReason> {
        info!(%id, %file, %reason, "refusing request");
        self.reply(key, &reply)?;
        self.emit(SessionEvent::RequestRefused { id, file, reason });
        Ok(())
    }

    fn reply(&mut self, key: SocketKey, msg: &Message) -> Result<(), CloseReason> {
        let Some(record) = self.registry.find_by_socket_mut(key) else {
            return Ok(());
        };
        send_message(&mut record.socket, msg).map_err(|e| CloseReason::Io(e.to_string()))
    }

    fn start_sending(
        &mut self,
        key: SocketKey,
        file: File,
        name: &str,
        size: u64,
    ) -> Result<(), CloseReason> {
        let Some(record) = self.registry.find_by_socket_mut(key) else {
            return Ok(());
        };
        record.transfer.start_sending(file, name, size).map_err(transfer_reason)?;
        self.active_sends += 1;
        self.reactor
            .set_writable(&mut record.socket, key, true)
            .map_err(|e| CloseReason::Io(e.to_string()))
    }

    fn start_receiving(
        &mut self,
        key: SocketKey,
        file: File,
        name: &str,
        size: u64,
    ) -> Result<(), CloseReason> {
        let Some(record) = self.registry.find_by_socket_mut(key) else {
            return Ok(());
        };
        record.transfer.start_receiving(file, name, size).map_err(transfer_reason)?;
        self.active_receives += 1;
        self.update_input_gate();
        Ok(())
    }

    /// One download request got its answer.
    pub(super) fn settle_download(&mut self, started: bool) {
        let Some(batch) = self.batch.as_mut() else {
            return;
        };
        batch.outstanding = batch.outstanding.saturating_sub(1);
        if started {
            batch.started += 1;
        }
        if batch.outstanding == 0 {
            let (requested, started) = (batch.requested, batch.started);
            self.batch = None;
            self.emit(SessionEvent::DownloadsSettled { requested, started });
        }
        self.update_input_gate();
    }

    /// Send one block of an outgoing transfer.
    pub(super) fn drive_send(&mut self, key: SocketKey) {
        let Some(record) = self.registry.find_by_socket_mut(key) else {
            return;
        };
        let file = active_name(record.transfer.active());
        match record.transfer.advance_send(&mut record.socket) {
            Ok(Step::Progress { .. } | Step::Blocked) => {}
            Ok(Step::Complete(summary)) => {
                self.active_sends = self.active_sends.saturating_sub(1);
                if let Err(e) = self.reactor.set_writable(&mut record.socket, key, false) {
                    warn!(%key, error = %e, "cannot drop write interest");
                }
                let (id, hostname) = (record.id(), record.hostname.clone());
                info!(file = %summary.file_name, bytes = summary.bytes, "send complete");
                if let Some(id) = id {
                    self.emit(SessionEvent::TransferComplete { id, hostname, summary });
                }
            }
            Err(e) => {
                self.active_sends = self.active_sends.saturating_sub(1);
                self.fail_transfer(key, file, e);
            }
        }
    }

    /// Receive one block of an incoming transfer, buffered bytes first.
    /// Returns false when the connection was closed.
    pub(super) fn drive_receive(&mut self, key: SocketKey) -> bool {
        let Some(record) = self.registry.find_by_socket_mut(key) else {
            return false;
        };
        let file = active_name(record.transfer.active());
        let mut source = Buffered {
            buffered: &mut record.inbound,
            stream: &mut record.socket,
        };
        match record.transfer.advance_receive(&mut source) {
            Ok(Step::Progress { .. } | Step::Blocked) => true,
            Ok(Step::Complete(summary)) => {
                self.active_receives = self.active_receives.saturating_sub(1);
                let (id, hostname) = (record.id(), record.hostname.clone());
                info!(file = %summary.file_name, bytes = summary.bytes, "receive complete");
                if let Some(id) = id {
                    self.emit(SessionEvent::TransferComplete { id, hostname, summary });
                }
                self.update_input_gate();
                true
            }
            Err(e) => {
                self.active_receives = self.active_receives.saturating_sub(1);
                self.fail_transfer(key, file, e);
                false
            }
        }
    }

    fn fail_transfer(&mut self, key: SocketKey, file: String, error: TransferError) {
        warn!(%key, %file, %error, "transfer failed");
        let id = self.registry.find_by_socket(key).and_then(|r| r.id());
        if let Some(id) = id {
            self.emit(SessionEvent::TransferFailed {
                id,
                file,
                error: error.to_string(),
            });
        }
        let reason = match error {
            TransferError::PeerClosed { .. } => CloseReason::PeerClosed,
            other => CloseReason::Io(other.to_string()),
        };
        self.close_connection(key, reason);
    }
}

fn transfer_reason(e: TransferError) -> CloseReason {
    CloseReason::Io(e.to_string())
}

fn active_name(active: Option<&peershare_core::transfer::ActiveTransfer<File>>) -> String {
    active.map(|a| a.file_name().to_string()).unwrap_or_default()
}

/// A file name with no directory part, usable inside the data directory.
pub(crate) fn is_plain_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let mut parts = Path::new(name).components();
    matches!((parts.next(), parts.next()), (Some(Component::Normal(_)), None))
}

/// Socket reader that hands out bytes already pulled off the socket first.
struct Buffered<'a, S> {
    buffered: &'a mut Vec<u8>,
    stream: &'a mut S,
}

impl<S: Read> Read for Buffered<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.buffered.is_empty() {
            return self.stream.read(buf);
        }
        let n = buf.len().min(self.buffered.len());
        buf[..n].copy_from_slice(&self.buffered[..n]);
        self.buffered.drain(..n);
        Ok(n)
    }
}
