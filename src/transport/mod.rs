//! Transport layer: secure and plaintext socket managers over non-blocking
//! channels.
//!
//! A connection manager (for example [`Server`]) owns the channels. For each
//! accepted channel it calls [`SocketManager::init`], turns readiness events
//! into [`SocketManager::read`] calls, pushes outbound bytes through
//! [`SocketManager::write`] and finally calls [`SocketManager::on_close`].
//! The secure manager runs the TLS record layer in between; the plaintext
//! manager passes bytes straight through.

mod buffer;
mod engine;
mod registry;
mod rustls_engine;
mod server;
mod tcp;
mod tls_config;
mod wrapper;

pub use buffer::{grow, RecordBuf};
pub use engine::{
    DelegatedTask, EngineFactory, EngineResult, HandshakeStatus, Status, TlsEngine,
    APPLICATION_BUFFER_SIZE, MAX_FRAGMENT_LEN, PACKET_BUFFER_SIZE, RECORD_HEADER_LEN,
};
pub use registry::{PlainSocketManager, SecureSocketManager};
pub use rustls_engine::{RustlsEngine, RustlsEngineFactory};
pub use server::{Server, ServerEvent};
pub use tcp::TcpChannel;
pub use tls_config::load_tls_server_config;
pub use wrapper::EngineWrapper;

use crate::error::Error;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use tracing::warn;

// Zero-progress writes tolerated before a channel is reported as stalled.
const STALLED_WRITE_WARN_ATTEMPTS: u32 = 10;

/// Identity of a channel, unique per live connection.
pub type ChannelId = usize;

/// Outcome of a single non-blocking channel read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRead {
    /// `n` bytes were read.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// The peer closed its side of the connection.
    Eof,
}

/// A bidirectional non-blocking byte endpoint.
///
/// Methods take `&self` because a connection's read and write paths may run
/// on different threads at the same time.
pub trait Channel: Send + Sync {
    fn id(&self) -> ChannelId;

    fn read(&self, buf: &mut [u8]) -> io::Result<ChannelRead>;

    /// Writes some prefix of `buf`. Returns `Ok(0)` when the write would block.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Shuts both directions down. The connection manager still owns the
    /// channel and releases it.
    fn shutdown(&self) -> io::Result<()>;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Writer used for channels that are not secured.
pub trait RawWriter<C: Channel + ?Sized> {
    fn write_raw(&self, channel: &C, data: &[u8]) -> Result<(), Error>;
}

/// [`RawWriter`] that retries partial writes until `data` is fully drained.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainingWriter;

impl<C: Channel + ?Sized> RawWriter<C> for DrainingWriter {
    fn write_raw(&self, channel: &C, data: &[u8]) -> Result<(), Error> {
        write_all(channel, data)
    }
}

/// Per-listener strategy for turning channel bytes into application bytes.
pub trait SocketManager<C: Channel>: Send + Sync {
    /// Prepares a freshly accepted channel. Called before the first read.
    fn init(&self, channel: &Arc<C>) -> Result<(), Error>;

    /// Appends whatever is currently readable to `dest` and returns the number
    /// of bytes appended. Fails with [`Error::ChannelClosed`] once the peer is
    /// gone.
    fn read(&self, channel: &C, dest: &mut Vec<u8>) -> Result<usize, Error>;

    /// Sends `data`. Plaintext managers hand it to `raw_writer`.
    fn write(&self, channel: &C, data: &[u8], raw_writer: &dyn RawWriter<C>)
        -> Result<(), Error>;

    fn is_secure(&self, _channel: &C) -> bool {
        false
    }

    /// Releases per-channel state. Returns false when there was none, which
    /// makes a repeated call a no-op.
    fn on_close(&self, channel: &C) -> bool;
}

/// Writes all of `data`, retrying partial and would-block writes.
pub(crate) fn write_all<C: Channel + ?Sized>(channel: &C, mut data: &[u8]) -> Result<(), Error> {
    let mut stalled = 0u32;
    while !data.is_empty() {
        let n = channel.write(data)?;
        if n == 0 {
            stalled += 1;
            if stalled == STALLED_WRITE_WARN_ATTEMPTS {
                warn!(id = channel.id(), remaining = data.len(), "Channel is not draining writes");
            }
            thread::yield_now();
            continue;
        }
        data = &data[n..];
    }
    Ok(())
}
