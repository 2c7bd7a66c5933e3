//! The TLS engine capability driven by [`EngineWrapper`](super::EngineWrapper).
//!
//! An engine performs the cryptographic wrap/unwrap of single records and
//! reports where the handshake stands. It never touches the channel; moving
//! bytes between the engine and the socket is the wrapper's job.

use super::buffer::RecordBuf;
use crate::error::Error;

/// Largest plaintext fragment carried by one record.
pub const MAX_FRAGMENT_LEN: usize = 16 * 1024;

/// Size of a record header on the wire.
pub const RECORD_HEADER_LEN: usize = 5;

/// Upper bound of one encrypted record: header, fragment and the largest
/// expansion a TLS 1.2 cipher may add.
pub const PACKET_BUFFER_SIZE: usize = RECORD_HEADER_LEN + MAX_FRAGMENT_LEN + 2048;

/// Upper bound of the plaintext decoded from one record.
pub const APPLICATION_BUFFER_SIZE: usize = MAX_FRAGMENT_LEN;

/// Outcome of a single wrap or unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// The destination is too small; nothing was consumed or produced.
    BufferOverflow,
    /// The source does not hold a complete record; nothing was consumed.
    BufferUnderflow,
    /// This side of the session is closed.
    Closed,
}

/// Where the handshake stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NotHandshaking,
    NeedWrap,
    NeedUnwrap,
    NeedTask,
    /// Reported once, by the call that completed the handshake.
    Finished,
}

impl HandshakeStatus {
    /// True while the handshake driver still has work to do.
    pub fn is_handshaking(self) -> bool {
        !matches!(self, HandshakeStatus::NotHandshaking | HandshakeStatus::Finished)
    }
}

/// Per-call descriptor returned by [`TlsEngine::wrap`] and [`TlsEngine::unwrap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: Status,
    pub handshake_status: HandshakeStatus,
    pub bytes_consumed: usize,
    pub bytes_produced: usize,
}

impl EngineResult {
    pub fn new(
        status: Status,
        handshake_status: HandshakeStatus,
        bytes_consumed: usize,
        bytes_produced: usize,
    ) -> Self {
        Self {
            status,
            handshake_status,
            bytes_consumed,
            bytes_produced,
        }
    }
}

/// A computation the engine hands out instead of running it inline.
pub type DelegatedTask = Box<dyn FnOnce() + Send>;

/// A stateful TLS session: handshake negotiation plus per-record encryption.
///
/// Buffer conventions: `src` is in drain mode and its position advances by
/// `bytes_consumed`; `dst` is in fill mode and its position advances by
/// `bytes_produced`. `BufferOverflow` and `BufferUnderflow` leave both
/// buffers untouched.
pub trait TlsEngine: Send {
    /// Starts (or restarts) the handshake. A no-op when the session has
    /// nothing left to negotiate.
    fn begin_handshake(&mut self) -> Result<(), Error>;

    fn handshake_status(&self) -> HandshakeStatus;

    /// Encrypts plaintext from `src`, or emits pending handshake/alert
    /// records, into `dst`.
    fn wrap(&mut self, src: &mut RecordBuf, dst: &mut RecordBuf) -> Result<EngineResult, Error>;

    /// Decrypts at most one record from `src` into `dst`.
    fn unwrap(&mut self, src: &mut RecordBuf, dst: &mut RecordBuf) -> Result<EngineResult, Error>;

    /// Next pending computation, if the engine is in [`HandshakeStatus::NeedTask`].
    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    /// Queues a close_notify; subsequent wraps flush it and then report
    /// [`Status::Closed`].
    fn close_outbound(&mut self);

    /// Marks the inbound side closed. Fails with [`Error::InboundTruncated`]
    /// when the peer's close_notify was never received.
    fn close_inbound(&mut self) -> Result<(), Error>;

    /// True once close_notify has been queued and every outbound byte has
    /// been handed out by `wrap`.
    fn is_outbound_done(&self) -> bool;

    /// Size hint for ciphertext buffers.
    fn packet_buffer_size(&self) -> usize {
        PACKET_BUFFER_SIZE
    }

    /// Size hint for plaintext buffers.
    fn application_buffer_size(&self) -> usize {
        APPLICATION_BUFFER_SIZE
    }
}

/// Creates one engine per accepted channel.
pub trait EngineFactory: Send + Sync {
    fn create_engine(&self) -> Result<Box<dyn TlsEngine>, Error>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Result<Box<dyn TlsEngine>, Error> + Send + Sync,
{
    fn create_engine(&self) -> Result<Box<dyn TlsEngine>, Error> {
        self()
    }
}
