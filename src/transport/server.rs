//! Connection manager: a single-threaded `mio` event loop that accepts TCP
//! channels and hands them to a [`SocketManager`].
//!
//! The loop calls `init` for every accepted channel (which, for TLS, runs the
//! handshake before the connection is reported), turns readable events into
//! `read` calls and routes [`Server::send_to`] through `write`.

use super::registry::{PlainSocketManager, SecureSocketManager};
use super::tcp::TcpChannel;
use super::{DrainingWriter, SocketManager};
use crate::config::{get_namespaced_string, get_namespaced_usize};
use crate::error::Error;
use ::config::Config;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, trace, warn};

const DEFAULT_POLL_CAPACITY: usize = 256;
const DEFAULT_MAX_READ_SIZE: usize = 1024 * 1024;
const CONNECTION_ID_RANGE_START: usize = 1000;

/// Events produced by [`Server::fetch_events`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// The server has no listeners or connections.
    Inactive,
    /// A connection was accepted and initialized. `secure` is true when a TLS
    /// session is established on it.
    Connected { id: usize, secure: bool },
    /// Connection closed. Clean up state associated with this `id`.
    Disconnected { id: usize },
    /// Application bytes received from a connection.
    Data { id: usize, data: Vec<u8> },
}

struct Connection {
    channel: Arc<TcpChannel>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

/// Non-blocking server over plaintext or TLS channels.
///
/// Not thread-safe; drive it from one thread.
pub struct Server {
    manager: Arc<dyn SocketManager<TcpChannel>>,
    connections: HashMap<usize, Connection>,
    listeners: HashMap<usize, TcpListener>,
    next_id: usize,
    poll: Poll,
    poll_capacity: usize,
}

// ============================================================================
// Constructors
// ============================================================================

impl Server {
    /// Creates a server from configuration.
    ///
    /// # Configuration Keys
    ///
    /// - `transport_type`: "tcp" or "tls" (defaults to "tcp")
    /// - `tls_server_cert`, `tls_server_key`: PEM files, required for "tls"
    /// - `tls_ca_cert`: optional PEM CA bundle; clients are then asked for a
    ///   certificate but may connect without one
    /// - `tls_handshake_timeout_ms`: optional bound on the handshake
    /// - `max_read_size`: largest single plaintext read (defaults to 1 MiB)
    /// - `poll_capacity`: events fetched per poll
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    /// Creates a named server. Keys under `name.` take precedence over
    /// top-level keys.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        let transport_type = get_namespaced_string(config, name, "transport_type")
            .unwrap_or_else(|_| "tcp".to_string());
        let poll_capacity =
            get_namespaced_usize(config, name, "poll_capacity").unwrap_or(DEFAULT_POLL_CAPACITY);

        let manager: Arc<dyn SocketManager<TcpChannel>> = match transport_type.as_str() {
            "tcp" => {
                let max_read_size = get_namespaced_usize(config, name, "max_read_size")
                    .unwrap_or(DEFAULT_MAX_READ_SIZE);
                Arc::new(PlainSocketManager::new(max_read_size))
            }
            "tls" => Arc::new(SecureSocketManager::from_config(config, name)?),
            _ => {
                return Err(Error::InvalidTransportType {
                    got: transport_type,
                    valid: vec!["tcp".to_string(), "tls".to_string()],
                })
            }
        };

        Self::with_manager(manager, poll_capacity)
    }

    /// Creates a server around an existing socket manager.
    pub fn with_manager(
        manager: Arc<dyn SocketManager<TcpChannel>>,
        poll_capacity: usize,
    ) -> Result<Self, Error> {
        Ok(Self {
            manager,
            connections: HashMap::new(),
            listeners: HashMap::new(),
            next_id: CONNECTION_ID_RANGE_START,
            poll: Poll::new()?,
            poll_capacity: poll_capacity.max(1),
        })
    }
}

// ============================================================================
// Connection Management
// ============================================================================

impl Server {
    /// Starts listening for incoming connections on the specified address.
    #[instrument(skip(self, addr))]
    pub fn listen<A: ToSocketAddrs>(&mut self, addr: A) -> Result<(usize, SocketAddr), Error> {
        let requested_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or(Error::InvalidAddress)?;
        let mut listener = TcpListener::bind(requested_addr)?;

        let listener_id = self.advance_connection_id();
        let local_addr = listener.local_addr()?;
        self.poll
            .registry()
            .register(&mut listener, Token(listener_id), Interest::READABLE)?;
        info!(id = listener_id, %local_addr, "Listening for connections");
        self.listeners.insert(listener_id, listener);

        Ok((listener_id, local_addr))
    }

    /// Gets the local socket addresses of all active listeners.
    pub fn get_listener_addresses(&self) -> Vec<SocketAddr> {
        self.listeners
            .values()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    /// True when a TLS session is established on connection `id`.
    pub fn is_secure(&self, id: usize) -> bool {
        self.connections
            .get(&id)
            .is_some_and(|connection| self.manager.is_secure(&connection.channel))
    }

    /// Closes a connection, sending close_notify first if it is secured.
    #[instrument(skip(self))]
    pub fn close_connection(&mut self, id: usize) {
        match self.connections.remove(&id) {
            Some(connection) => self.release(id, connection),
            None => warn!(id, "Connection not found when closing connection"),
        }
    }

    /// Closes a listener by its ID.
    #[instrument(skip(self))]
    pub fn close_listener(&mut self, id: usize) {
        match self.listeners.remove(&id) {
            Some(mut listener) => {
                if let Err(err) = self.poll.registry().deregister(&mut listener) {
                    warn!(id, ?err, "Failed to deregister listener");
                }
                info!(id, "Closed listener");
            }
            None => warn!(id, "Listener not found when closing listener"),
        }
    }

    /// Closes all listeners and connections.
    #[instrument(skip(self))]
    pub fn close_all(&mut self) {
        let listener_ids: Vec<_> = self.listeners.keys().copied().collect();
        for id in listener_ids {
            self.close_listener(id);
        }
        let connections: Vec<_> = self.connections.drain().collect();
        for (id, connection) in connections {
            self.release(id, connection);
        }
    }

    fn release(&mut self, id: usize, connection: Connection) {
        self.manager.on_close(&connection.channel);
        let Connection {
            channel,
            local_addr,
            peer_addr,
        } = connection;

        match Arc::try_unwrap(channel) {
            Ok(channel) => {
                let mut stream = channel.into_stream();
                if let Err(err) = self.poll.registry().deregister(&mut stream) {
                    debug!(id, ?err, "Failed to deregister connection");
                }
            }
            // Dropping the last reference closes the socket, which also
            // removes it from the poll.
            Err(_) => debug!(id, "Connection still referenced while closing"),
        }
        info!(id, ?local_addr, ?peer_addr, "Closed connection");
    }

    fn advance_connection_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id = self
            .next_id
            .checked_add(1)
            .unwrap_or(CONNECTION_ID_RANGE_START);
        id
    }
}

// ============================================================================
// Data Operations
// ============================================================================

impl Server {
    /// Sends data to a specific connection. A failed send closes the
    /// connection.
    #[instrument(skip(self, data))]
    pub fn send_to(&mut self, id: usize, data: &[u8]) -> Result<(), Error> {
        let connection = self
            .connections
            .get(&id)
            .ok_or(Error::ConnectionNotFound { id })?;
        debug!(len = data.len(), "Sending data");

        if let Err(err) = self.manager.write(&connection.channel, data, &DrainingWriter) {
            if err.is_peer_closed() {
                info!(id, "Peer closed connection during send");
            } else {
                warn!(id, %err, "Error sending data");
            }
            self.close_connection(id);
            return Err(err);
        }
        Ok(())
    }
}

// ============================================================================
// Event Operations
// ============================================================================

impl Server {
    /// Blocks until events are available and returns them.
    #[instrument(skip(self))]
    pub fn fetch_events(&mut self) -> Result<Vec<ServerEvent>, Error> {
        let mut dispatch_events = Vec::new();

        while dispatch_events.is_empty() {
            if self.connections.is_empty() && self.listeners.is_empty() {
                dispatch_events.push(ServerEvent::Inactive);
                return Ok(dispatch_events);
            }

            let mut poll_events = Events::with_capacity(self.poll_capacity);
            match self.poll.poll(&mut poll_events, None) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::PollError(err.to_string())),
            }

            for event in poll_events.iter() {
                let Token(id) = event.token();
                if self.listeners.contains_key(&id) {
                    self.accept_connections(id, &mut dispatch_events)?;
                } else if self.connections.contains_key(&id) {
                    self.read_connection(id, &mut dispatch_events);
                } else {
                    trace!(id, "Event for a connection that is already gone");
                }
            }
        }

        debug!(count = dispatch_events.len(), "Fetched events");
        Ok(dispatch_events)
    }

    fn accept_connections(&mut self, id: usize, events: &mut Vec<ServerEvent>) -> Result<(), Error> {
        let Some(listener) = self.listeners.get_mut(&id) else {
            return Ok(());
        };

        // Collect first, then register, to keep the listener borrow short.
        let mut new_streams = Vec::new();
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nodelay(true)?;
                    new_streams.push(stream);
                }
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(?err, "Transient accept error");
                        continue;
                    }
                    _ => {
                        error!(?err, "Error accepting connection");
                        self.close_listener(id);
                        return Err(err.into());
                    }
                },
            }
        }

        for mut stream in new_streams {
            let conn_id = self.advance_connection_id();
            let local_addr = stream.local_addr().ok();
            let peer_addr = stream.peer_addr().ok();
            info!(id = conn_id, ?local_addr, ?peer_addr, "Accepting connection");

            self.poll
                .registry()
                .register(&mut stream, Token(conn_id), Interest::READABLE)?;
            let channel = Arc::new(TcpChannel::new(conn_id, stream));

            if let Err(err) = self.manager.init(&channel) {
                debug!(id = conn_id, %err, "Dropping connection that failed to initialize");
                if let Ok(channel) = Arc::try_unwrap(channel) {
                    let mut stream = channel.into_stream();
                    if let Err(err) = self.poll.registry().deregister(&mut stream) {
                        debug!(id = conn_id, ?err, "Failed to deregister connection");
                    }
                }
                continue;
            }

            let secure = self.manager.is_secure(&channel);
            self.connections.insert(
                conn_id,
                Connection {
                    channel,
                    local_addr,
                    peer_addr,
                },
            );
            events.push(ServerEvent::Connected { id: conn_id, secure });

            // The handshake may have pulled application records in with its
            // last read; no further readiness event will announce them.
            self.read_connection(conn_id, events);
        }

        Ok(())
    }

    fn read_connection(&mut self, id: usize, events: &mut Vec<ServerEvent>) {
        let Some(connection) = self.connections.get(&id) else {
            return;
        };

        // Readiness is edge-triggered, so drain until the channel has nothing
        // more. A close that arrived with the last data only shows up on the
        // read after it.
        let mut data = Vec::new();
        let result = loop {
            match self.manager.read(&connection.channel, &mut data) {
                Ok(0) => break Ok(()),
                Ok(_) => {}
                Err(err) => break Err(err),
            }
        };
        if !data.is_empty() {
            trace!(id, len = data.len(), "Read data");
            events.push(ServerEvent::Data { id, data });
        }

        if let Err(err) = result {
            if err.is_peer_closed() {
                info!(id, "Peer closed connection");
            } else {
                error!(id, %err, "Error reading from connection");
            }
            self.close_connection(id);
            events.push(ServerEvent::Disconnected { id });
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_wrap_to_range_start() {
        let config = Config::builder().build().unwrap();
        let mut server = Server::new(&config).unwrap();
        server.next_id = usize::MAX;

        assert_eq!(server.advance_connection_id(), usize::MAX);
        assert_eq!(server.advance_connection_id(), CONNECTION_ID_RANGE_START);
        assert_eq!(server.advance_connection_id(), CONNECTION_ID_RANGE_START + 1);
    }
}
