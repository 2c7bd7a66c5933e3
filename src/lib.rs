//! tlswire - record-level TLS for non-blocking, selector-driven servers
//!
//! tlswire puts a TLS session between a connection manager and its
//! non-blocking channels. A [`SecureSocketManager`] runs the handshake when a
//! channel is accepted, decodes inbound records (buffering partial ones across
//! reads), encodes outbound plaintext into records and exchanges close_notify
//! when the channel goes away. Channels that were never secured fall through
//! as plaintext, which is also what [`PlainSocketManager`] does for all of
//! them.
//!
//! The TLS engine itself is pluggable through [`TlsEngine`]; [`RustlsEngine`]
//! is the rustls-backed implementation. [`Server`] is a small `mio` event loop
//! that drives either manager over TCP.

// Internal-only modules
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod transport;

// These are the intended public API
pub use error::Error;
pub use transport::{
    grow, load_tls_server_config, Channel, ChannelId, ChannelRead, DelegatedTask, DrainingWriter,
    EngineFactory, EngineResult, EngineWrapper, HandshakeStatus, PlainSocketManager, RawWriter,
    RecordBuf, RustlsEngine, RustlsEngineFactory, SecureSocketManager, Server, ServerEvent,
    SocketManager, Status, TcpChannel, TlsEngine, APPLICATION_BUFFER_SIZE, MAX_FRAGMENT_LEN,
    PACKET_BUFFER_SIZE, RECORD_HEADER_LEN,
};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::error::Error;
    pub use crate::transport::{
        Channel, ChannelRead, DrainingWriter, PlainSocketManager, RawWriter, SecureSocketManager,
        Server, ServerEvent, SocketManager, TcpChannel,
    };
}
