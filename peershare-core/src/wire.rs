//! Framing: 2-byte LE type tag, then a fixed per-kind payload.
//!
//! Field widths are canonical: ports are 16-bit, sizes and name lengths 64-bit, all
//! little-endian; IPv4 addresses travel as their four octets in network order. A
//! variable-length field is always preceded by its length, so a decoder can tell how
//! many more bytes it needs before the name itself has arrived.

use std::net::Ipv4Addr;

use crate::protocol::{AvailablePeer, Message, MessageType, MAX_NAME_LEN};

const TAG_SIZE: usize = 2;
const PEER_ENTRY_SIZE: usize = 4 + 2;

/// Encode a message into a single buffer ready for the socket.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(TAG_SIZE + 16);
    out.extend_from_slice(&msg.message_type().tag().to_le_bytes());
    match msg {
        Message::MyPort { port } | Message::ConnectRequest { port } => {
            out.extend_from_slice(&port.to_le_bytes());
        }
        Message::PeerList { peers } => {
            let count = u8::try_from(peers.len())
                .map_err(|_| EncodeError::TooManyPeers(peers.len()))?;
            out.push(count);
            for peer in peers {
                out.extend_from_slice(&peer.ip.octets());
                out.extend_from_slice(&peer.port.to_le_bytes());
            }
        }
        Message::DownloadRequest { name } => {
            put_name(&mut out, name)?;
        }
        Message::DownloadAccept { size } => {
            out.extend_from_slice(&size.to_le_bytes());
        }
        Message::UploadRequest { size, name } => {
            out.extend_from_slice(&size.to_le_bytes());
            put_name(&mut out, name)?;
        }
        Message::DownloadReject | Message::UploadAccept | Message::UploadReject => {}
    }
    Ok(out)
}

fn put_name(out: &mut Vec<u8>, name: &str) -> Result<(), EncodeError> {
    if name.is_empty() {
        return Err(EncodeError::EmptyName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EncodeError::NameTooLong(name.len()));
    }
    out.extend_from_slice(&(name.len() as u64).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    Ok(())
}

/// Error encoding a message (a field does not fit its wire width).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("peer list of {0} entries exceeds the 8-bit count")]
    TooManyPeers(usize),
    #[error("file name of {0} bytes exceeds the {MAX_NAME_LEN}-byte limit")]
    NameTooLong(usize),
    #[error("empty file name")]
    EmptyName,
}

/// Decode one message from the front of `bytes`. Returns the message and the
/// number of bytes consumed.
/// Call with a partial buffer; `NeedMore` means the caller should retry once more bytes arrive.
pub fn decode_message(bytes: &[u8]) -> Result<(Message, usize), DecodeError> {
    let mut r = Reader::new(bytes);
    let tag = r.u16()?;
    let ty = MessageType::from_tag(tag).ok_or(DecodeError::UnknownType(tag))?;
    let msg = match ty {
        MessageType::MyPort => Message::MyPort { port: r.u16()? },
        MessageType::ConnectRequest => Message::ConnectRequest { port: r.u16()? },
        MessageType::PeerList => {
            let count = r.u8()? as usize;
            r.ensure(count * PEER_ENTRY_SIZE)?;
            let mut peers = Vec::with_capacity(count);
            for _ in 0..count {
                let o = r.take(4)?;
                let ip = Ipv4Addr::new(o[0], o[1], o[2], o[3]);
                let port = r.u16()?;
                peers.push(AvailablePeer { ip, port });
            }
            Message::PeerList { peers }
        }
        MessageType::DownloadRequest => Message::DownloadRequest { name: r.name()? },
        MessageType::DownloadAccept => Message::DownloadAccept { size: r.u64()? },
        MessageType::DownloadReject => Message::DownloadReject,
        MessageType::UploadRequest => {
            let size = r.u64()?;
            let name = r.name()?;
            Message::UploadRequest { size, name }
        }
        MessageType::UploadAccept => Message::UploadAccept,
        MessageType::UploadReject => Message::UploadReject,
    };
    Ok((msg, r.pos))
}

/// Error decoding a message (need more bytes, or a protocol violation).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("unknown message type {0:#06x}")]
    UnknownType(u16),
    #[error("declared file name length {0} exceeds the {MAX_NAME_LEN}-byte limit")]
    NameTooLong(u64),
    #[error("empty file name")]
    EmptyName,
    #[error("file name is not valid UTF-8")]
    InvalidName,
}

impl DecodeError {
    /// True when the bytes seen so far can never become a valid message.
    pub fn is_violation(&self) -> bool {
        !matches!(self, DecodeError::NeedMore)
    }
}

/// Width-checked little-endian reader over a borrowed buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn ensure(&self, n: usize) -> Result<(), DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::NeedMore);
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.ensure(n)?;
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    fn name(&mut self) -> Result<String, DecodeError> {
        let len = self.u64()?;
        if len == 0 {
            return Err(DecodeError::EmptyName);
        }
        if len > MAX_NAME_LEN as u64 {
            return Err(DecodeError::NameTooLong(len));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidName)
    }
}
