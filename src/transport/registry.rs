//! Socket managers: the per-listener strategy the connection manager calls
//! into.
//!
//! [`SecureSocketManager`] keeps one [`EngineWrapper`] per secured channel in a
//! concurrent registry. A channel without an entry is treated as plaintext,
//! which is also what [`PlainSocketManager`] does for every channel.

use super::buffer::RecordBuf;
use super::engine::{EngineFactory, Status};
use super::rustls_engine::RustlsEngineFactory;
use super::tls_config::load_tls_server_config;
use super::wrapper::EngineWrapper;
use super::{Channel, ChannelId, ChannelRead, RawWriter, SocketManager};
use crate::config::{get_namespaced_string, get_namespaced_u64, get_optional};
use crate::error::Error;

use ::config::Config;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const PLAIN_READ_CHUNK: usize = 16 * 1024;

/// Runs TLS over every channel it initializes.
pub struct SecureSocketManager<C: Channel> {
    factory: Arc<dyn EngineFactory>,
    engines: DashMap<ChannelId, Arc<EngineWrapper<C>>>,
    handshake_timeout: Option<Duration>,
}

impl<C: Channel> SecureSocketManager<C> {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            engines: DashMap::new(),
            handshake_timeout: None,
        }
    }

    /// Loads the server credentials (`tls_server_cert`, `tls_server_key` and
    /// optionally `tls_ca_cert`) and `tls_handshake_timeout_ms` from `config`,
    /// preferring keys under `name.`.
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let (Ok(cert), Ok(key)) = (
            get_namespaced_string(config, name, "tls_server_cert"),
            get_namespaced_string(config, name, "tls_server_key"),
        ) else {
            return Err(Error::TlsServerConfigMissing);
        };
        let ca = get_optional(get_namespaced_string(config, name, "tls_ca_cert"))?;
        let timeout = get_optional(get_namespaced_u64(config, name, "tls_handshake_timeout_ms"))?
            .map(Duration::from_millis);

        let server_config = load_tls_server_config(&cert, &key, ca.as_deref())?;
        let factory = RustlsEngineFactory::new(Arc::new(server_config));
        Ok(Self::new(Arc::new(factory)).with_handshake_timeout(timeout))
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// The session registered for `channel`, if it is secured.
    pub fn wrapper(&self, channel: &C) -> Option<Arc<EngineWrapper<C>>> {
        // Cloned out so the shard lock is not held during I/O.
        self.engines.get(&channel.id()).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    fn establish(&self, channel: &Arc<C>) -> Result<(), Error> {
        let engine = self.factory.create_engine()?;
        let wrapper = EngineWrapper::new(channel.clone(), engine)
            .with_spin_timeout(self.handshake_timeout);
        wrapper.handshake()?;

        if !wrapper.is_secure() {
            return Err(Error::HandshakeFailed(
                "session closed before the handshake finished".to_string(),
            ));
        }
        self.engines.insert(channel.id(), Arc::new(wrapper));
        Ok(())
    }
}

impl<C: Channel> SocketManager<C> for SecureSocketManager<C> {
    #[instrument(skip_all, fields(id = channel.id()))]
    fn init(&self, channel: &Arc<C>) -> Result<(), Error> {
        match self.establish(channel) {
            Ok(()) => {
                info!(peer = ?channel.peer_addr(), "TLS session established");
                Ok(())
            }
            Err(err) => {
                warn!(peer = ?channel.peer_addr(), %err, "TLS handshake failed, closing channel");
                if let Err(e) = channel.shutdown() {
                    debug!(%e, "Channel shutdown after failed handshake");
                }
                Err(err)
            }
        }
    }

    fn read(&self, channel: &C, dest: &mut Vec<u8>) -> Result<usize, Error> {
        let Some(wrapper) = self.wrapper(channel) else {
            return read_plain(channel, dest, PLAIN_READ_CHUNK);
        };

        let mut scratch = RecordBuf::with_capacity(wrapper.application_buffer_size());
        let mut total = 0;
        loop {
            scratch.clear();
            let result = wrapper.receive_data(&mut scratch)?;
            dest.extend_from_slice(scratch.chunk());
            total += scratch.remaining();
            match result.status {
                Status::Ok => {}
                Status::Closed if total == 0 => return Err(Error::ChannelClosed),
                _ => break,
            }
        }
        Ok(total)
    }

    fn write(&self, channel: &C, data: &[u8], raw_writer: &dyn RawWriter<C>) -> Result<(), Error> {
        let Some(wrapper) = self.wrapper(channel) else {
            return raw_writer.write_raw(channel, data);
        };

        let mut src = RecordBuf::from_slice(data);
        let result = wrapper.send_data(&mut src)?;
        if result.status == Status::Closed {
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }

    fn is_secure(&self, channel: &C) -> bool {
        self.engines.contains_key(&channel.id())
    }

    fn on_close(&self, channel: &C) -> bool {
        let Some((id, wrapper)) = self.engines.remove(&channel.id()) else {
            return false;
        };
        if let Err(err) = wrapper.close() {
            warn!(id, %err, "Error while closing TLS session");
        }
        debug!(id, "Released TLS session");
        true
    }
}

/// Passes bytes through untouched.
#[derive(Debug, Clone, Copy)]
pub struct PlainSocketManager {
    read_chunk: usize,
}

impl PlainSocketManager {
    /// `read_chunk` bounds a single channel read.
    pub fn new(read_chunk: usize) -> Self {
        Self {
            read_chunk: read_chunk.max(1),
        }
    }
}

impl Default for PlainSocketManager {
    fn default() -> Self {
        Self::new(PLAIN_READ_CHUNK)
    }
}

impl<C: Channel> SocketManager<C> for PlainSocketManager {
    fn init(&self, _channel: &Arc<C>) -> Result<(), Error> {
        Ok(())
    }

    fn read(&self, channel: &C, dest: &mut Vec<u8>) -> Result<usize, Error> {
        read_plain(channel, dest, self.read_chunk)
    }

    fn write(&self, channel: &C, data: &[u8], raw_writer: &dyn RawWriter<C>) -> Result<(), Error> {
        raw_writer.write_raw(channel, data)
    }

    fn on_close(&self, _channel: &C) -> bool {
        false
    }
}

// Reads until the channel would block. End-of-stream with nothing read is
// reported as closed; with data read it is left for the next call.
fn read_plain<C: Channel + ?Sized>(
    channel: &C,
    dest: &mut Vec<u8>,
    read_chunk: usize,
) -> Result<usize, Error> {
    let mut chunk = vec![0u8; read_chunk];
    let mut total = 0;
    loop {
        match channel.read(&mut chunk)? {
            ChannelRead::Data(0) | ChannelRead::WouldBlock => break,
            ChannelRead::Data(n) => {
                dest.extend_from_slice(&chunk[..n]);
                total += n;
            }
            ChannelRead::Eof if total == 0 => return Err(Error::ChannelClosed),
            ChannelRead::Eof => break,
        }
    }
    Ok(total)
}
