use thiserror::Error;

/// The error type for tlswire operations.
///
/// Covers channel I/O, the TLS engine, record framing and listener
/// configuration. Peer-initiated closure is reported as
/// [`Error::ChannelClosed`] and is an ordinary lifecycle event rather than a
/// failure; callers typically release the channel and move on.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Channel Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel reached end-of-stream or the secure session was closed.
    #[error("Channel closed")]
    ChannelClosed,

    /// The provided socket address could not be parsed or resolved.
    #[error("Invalid socket address")]
    InvalidAddress,

    /// Attempted to operate on a connection ID that doesn't exist.
    #[error("Connection {id} not found")]
    ConnectionNotFound {
        /// The connection ID that was not found.
        id: usize,
    },

    /// Internal polling mechanism encountered an error.
    #[error("Poll error: {0}")]
    PollError(String),

    // ============================================================================
    // TLS Session Errors
    // ============================================================================

    /// The TLS engine rejected inbound data or failed to produce outbound data.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Inbound bytes do not form a valid TLS record header.
    #[error("Malformed TLS record: {0}")]
    Record(String),

    /// Inbound side closed before the peer's close_notify arrived.
    ///
    /// The close coordinator downgrades this to an informational notice.
    #[error("Inbound closed before receiving peer's close_notify: possible truncation")]
    InboundTruncated,

    /// The handshake spin-read exceeded `tls_handshake_timeout_ms`.
    #[error("TLS handshake timed out")]
    HandshakeTimeout,

    /// The handshake loop ended without an established session.
    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(String),

    // ============================================================================
    // TLS Configuration Errors
    // ============================================================================

    /// Failed to load TLS certificate file from disk.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key file from disk.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate file format is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key file format is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Attempted to listen with TLS but server configuration is missing.
    ///
    /// When using TLS transport, you must provide `tls_server_cert` and
    /// `tls_server_key` configuration keys.
    #[error("TLS server configuration not provided - required for listen()")]
    TlsServerConfigMissing,

    /// Failed to build TLS server configuration from provided settings.
    #[error("Failed to build TLS server config: {0}")]
    TlsServerConfigBuild(String),

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Invalid value for `transport_type` configuration key.
    ///
    /// Must be one of: "tcp" or "tls".
    #[error("Invalid transport type '{got}', expected one of: {}", .valid.join(", "))]
    InvalidTransportType { got: String, valid: Vec<String> },
}

impl Error {
    /// Returns true for errors that mean the peer went away rather than
    /// something going wrong locally.
    pub fn is_peer_closed(&self) -> bool {
        match self {
            Error::ChannelClosed => true,
            Error::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
