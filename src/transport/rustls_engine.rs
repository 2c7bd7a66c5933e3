//! [`TlsEngine`] implementation on top of a `rustls::ServerConnection`.
//!
//! rustls consumes and produces ciphertext as a byte stream. This adapter
//! imposes record granularity on top of it: unwrap feeds rustls exactly one
//! complete record at a time (so partial records stay with the caller as
//! leftover bytes), and wrap stages rustls output internally so it can refuse
//! a too-small destination without losing anything.

use super::buffer::RecordBuf;
use super::engine::{
    DelegatedTask, EngineFactory, EngineResult, HandshakeStatus, Status, TlsEngine,
    MAX_FRAGMENT_LEN, RECORD_HEADER_LEN,
};
use crate::error::Error;

use rustls::{ServerConfig, ServerConnection};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use tracing::trace;

// Smallest expansion any supported AEAD adds to a record fragment.
const MIN_CIPHER_OVERHEAD: usize = 16;

/// Record content types (RFC 8446 §5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl ContentType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            20 => Some(Self::ChangeCipherSpec),
            21 => Some(Self::Alert),
            22 => Some(Self::Handshake),
            23 => Some(Self::ApplicationData),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub(crate) content_type: ContentType,
    pub(crate) length: usize,
}

impl RecordHeader {
    /// Parses the header at the front of `data`. `Ok(None)` means fewer than
    /// five bytes are available yet.
    pub(crate) fn parse(data: &[u8]) -> Result<Option<Self>, Error> {
        if data.len() < RECORD_HEADER_LEN {
            return Ok(None);
        }
        let content_type = ContentType::from_byte(data[0])
            .ok_or_else(|| Error::Record(format!("unknown content type {}", data[0])))?;
        let length = u16::from_be_bytes([data[3], data[4]]) as usize;
        Ok(Some(Self {
            content_type,
            length,
        }))
    }

    pub(crate) fn record_len(&self) -> usize {
        RECORD_HEADER_LEN + self.length
    }

    /// Upper bound of the plaintext this record can decrypt to.
    pub(crate) fn max_plaintext_len(&self) -> usize {
        self.length
            .saturating_sub(MIN_CIPHER_OVERHEAD)
            .min(MAX_FRAGMENT_LEN)
    }
}

/// Server-side TLS engine backed by rustls.
pub struct RustlsEngine {
    conn: ServerConnection,
    // Ciphertext produced by rustls but not yet handed to a wrap caller.
    staged: Vec<u8>,
    // Set while a handshake is in flight so completion is reported once.
    handshaking: bool,
    outbound_closed: bool,
    inbound_closed: bool,
}

impl RustlsEngine {
    pub fn new(config: Arc<ServerConfig>) -> Result<Self, Error> {
        let conn = ServerConnection::new(config)?;
        Ok(Self {
            handshaking: conn.is_handshaking(),
            conn,
            staged: Vec::new(),
            outbound_closed: false,
            inbound_closed: false,
        })
    }

    fn stage_outbound(&mut self) -> Result<(), Error> {
        while self.conn.wants_write() {
            if self.conn.write_tls(&mut self.staged)? == 0 {
                break;
            }
        }
        Ok(())
    }

    fn read_plaintext(&mut self, dst: &mut RecordBuf) -> Result<usize, Error> {
        let mut produced = 0;
        while dst.has_remaining() {
            match self.conn.reader().read(dst.chunk_mut()) {
                Ok(0) => break,
                Ok(n) => {
                    dst.advance(n);
                    produced += n;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(produced)
    }

    // Handshake status for an operation result; the first result after the
    // handshake completes says `Finished`.
    fn report_status(&mut self) -> HandshakeStatus {
        let status = self.handshake_status();
        if status == HandshakeStatus::NotHandshaking
            && self.handshaking
            && !self.conn.is_handshaking()
        {
            self.handshaking = false;
            return HandshakeStatus::Finished;
        }
        status
    }

    fn result(&mut self, status: Status, consumed: usize, produced: usize) -> EngineResult {
        EngineResult::new(status, self.report_status(), consumed, produced)
    }
}

impl TlsEngine for RustlsEngine {
    fn begin_handshake(&mut self) -> Result<(), Error> {
        // rustls negotiates on its own; there is no server-initiated
        // renegotiation to start.
        if self.conn.is_handshaking() {
            self.handshaking = true;
        }
        Ok(())
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if !self.staged.is_empty() || self.conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.conn.is_handshaking() && !self.inbound_closed {
            HandshakeStatus::NeedUnwrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn wrap(&mut self, src: &mut RecordBuf, dst: &mut RecordBuf) -> Result<EngineResult, Error> {
        self.stage_outbound()?;

        if !self.staged.is_empty() {
            if dst.remaining() < self.staged.len() {
                return Ok(self.result(Status::BufferOverflow, 0, 0));
            }
            dst.put_slice(&self.staged);
            let produced = self.staged.len();
            self.staged.clear();
            let status = if self.outbound_closed {
                Status::Closed
            } else {
                Status::Ok
            };
            trace!(len = produced, "Wrapped staged records");
            return Ok(self.result(status, 0, produced));
        }

        if self.outbound_closed {
            return Ok(self.result(Status::Closed, 0, 0));
        }
        if self.conn.is_handshaking() || !src.has_remaining() {
            return Ok(self.result(Status::Ok, 0, 0));
        }
        if dst.remaining() < self.packet_buffer_size() {
            return Ok(self.result(Status::BufferOverflow, 0, 0));
        }

        let len = src.remaining().min(MAX_FRAGMENT_LEN);
        let consumed = self.conn.writer().write(&src.chunk()[..len])?;
        src.advance(consumed);
        self.stage_outbound()?;

        // Anything that does not fit stays staged and leads the next wrap.
        let produced = self.staged.len().min(dst.remaining());
        dst.put_slice(&self.staged[..produced]);
        self.staged.drain(..produced);
        trace!(consumed, produced, "Wrapped application data");
        Ok(self.result(Status::Ok, consumed, produced))
    }

    fn unwrap(&mut self, src: &mut RecordBuf, dst: &mut RecordBuf) -> Result<EngineResult, Error> {
        if self.inbound_closed {
            return Ok(self.result(Status::Closed, 0, 0));
        }

        // Plaintext from an earlier record that did not fit goes out first.
        if self.conn.process_new_packets()?.plaintext_bytes_to_read() > 0 {
            if !dst.has_remaining() {
                return Ok(self.result(Status::BufferOverflow, 0, 0));
            }
            let produced = self.read_plaintext(dst)?;
            return Ok(self.result(Status::Ok, 0, produced));
        }

        let Some(header) = RecordHeader::parse(src.chunk())? else {
            return Ok(self.result(Status::BufferUnderflow, 0, 0));
        };
        let record_len = header.record_len();
        if src.remaining() < record_len {
            return Ok(self.result(Status::BufferUnderflow, 0, 0));
        }
        if header.content_type == ContentType::ApplicationData
            && !self.conn.is_handshaking()
            && dst.remaining() < header.max_plaintext_len()
        {
            return Ok(self.result(Status::BufferOverflow, 0, 0));
        }

        let mut record = &src.chunk()[..record_len];
        while !record.is_empty() {
            if self.conn.read_tls(&mut record)? == 0 {
                break;
            }
        }
        src.advance(record_len);

        let state = self.conn.process_new_packets()?;
        let produced = if state.plaintext_bytes_to_read() > 0 {
            self.read_plaintext(dst)?
        } else {
            0
        };
        if state.peer_has_closed() {
            self.inbound_closed = true;
        }
        self.stage_outbound()?;

        let status = if self.inbound_closed {
            Status::Closed
        } else {
            Status::Ok
        };
        trace!(?header, produced, "Unwrapped record");
        Ok(self.result(status, record_len, produced))
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.conn.send_close_notify();
            self.outbound_closed = true;
        }
    }

    fn close_inbound(&mut self) -> Result<(), Error> {
        if self.inbound_closed {
            return Ok(());
        }
        self.inbound_closed = true;
        Err(Error::InboundTruncated)
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_closed && self.staged.is_empty() && !self.conn.wants_write()
    }
}

/// Builds a [`RustlsEngine`] per channel from a shared server configuration.
#[derive(Clone)]
pub struct RustlsEngineFactory {
    config: Arc<ServerConfig>,
}

impl RustlsEngineFactory {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }
}

impl EngineFactory for RustlsEngineFactory {
    fn create_engine(&self) -> Result<Box<dyn TlsEngine>, Error> {
        Ok(Box::new(RustlsEngine::new(self.config.clone())?))
    }
}
