//! Server integration tests over real TCP sockets.
//!
//! # Running with tracing
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! TEST_LOG=2 cargo test --test server -- --nocapture
//! ```

mod tls_test_helper;

use rustls::{ClientConnection, StreamOwned};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tlswire::prelude::*;
use tls_test_helper::{client_config, generate_test_tls_config, init_tracing};

const MESSAGES: [&[u8]; 3] = [b"hello", b"over the wire", &[0x5a; 20_000]];

#[test]
fn echo_tcp() {
    init_tracing();
    let config = config::Config::builder()
        .set_default("transport_type", "tcp")
        .unwrap()
        .build()
        .unwrap();
    let mut server = Server::new(&config).expect("Failed to create server");
    let (_, addr) = server.listen("127.0.0.1:0").expect("Failed to listen");

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        for message in MESSAGES {
            stream.write_all(message).unwrap();
            let mut echoed = vec![0; message.len()];
            stream.read_exact(&mut echoed).unwrap();
            assert_eq!(echoed, message);
        }
    });

    run_echo_server(&mut server, false);
    client.join().unwrap();
}

#[test]
fn echo_tls() {
    init_tracing();
    let (config, _guard, credentials) = generate_test_tls_config();
    let mut server = Server::new(&config).expect("Failed to create server");
    let (_, addr) = server.listen("127.0.0.1:0").expect("Failed to listen");
    let client_config = client_config(&credentials);

    let client = thread::spawn(move || {
        let mut tls = connect_tls(addr, client_config);
        for message in MESSAGES {
            tls.write_all(message).unwrap();
            let mut echoed = vec![0; message.len()];
            tls.read_exact(&mut echoed).unwrap();
            assert_eq!(echoed, message);
        }
        tls.conn.send_close_notify();
        tls.flush().unwrap();
    });

    run_echo_server(&mut server, true);
    client.join().unwrap();
}

#[test]
fn server_close_sends_close_notify() {
    init_tracing();
    let (config, _guard, credentials) = generate_test_tls_config();
    let mut server = Server::new_named(&config, "edge").expect("Failed to create server");
    let (_, addr) = server.listen("127.0.0.1:0").expect("Failed to listen");
    let client_config = client_config(&credentials);

    let client = thread::spawn(move || {
        let mut tls = connect_tls(addr, client_config);
        tls.write_all(b"bye").unwrap();
        let mut rest = Vec::new();
        // A clean close_notify turns into a zero-length read, not an error.
        tls.read_to_end(&mut rest).unwrap();
        rest
    });

    let id = loop {
        let events = server.fetch_events().unwrap();
        if let Some(id) = events.iter().find_map(|event| match event {
            ServerEvent::Data { id, .. } => Some(*id),
            _ => None,
        }) {
            break id;
        }
    };
    assert!(server.is_secure(id));
    server.close_connection(id);
    assert!(!server.is_secure(id));

    assert!(client.join().unwrap().is_empty());
}

#[test]
fn close_notify_with_last_data_disconnects() {
    init_tracing();
    let (config, _guard, credentials) = generate_test_tls_config();
    let mut server = Server::new(&config).expect("Failed to create server");
    let (_, addr) = server.listen("127.0.0.1:0").expect("Failed to listen");
    let client_config = client_config(&credentials);
    let (released_tx, released_rx) = mpsc::channel();

    let client = thread::spawn(move || {
        let mut tls = connect_tls(addr, client_config);
        while tls.conn.is_handshaking() {
            tls.conn.complete_io(&mut tls.sock).unwrap();
        }
        // Last record and close_notify leave in one write.
        tls.conn.writer().write_all(b"bye").unwrap();
        tls.conn.send_close_notify();
        let mut wire = Vec::new();
        while tls.conn.wants_write() {
            tls.conn.write_tls(&mut wire).unwrap();
        }
        tls.sock.write_all(&wire).unwrap();

        // Keep the socket open; the server must notice the close on its own.
        let released = released_rx.recv_timeout(Duration::from_secs(5));
        assert!(released.is_ok(), "server never released the connection");
    });

    let mut received = Vec::new();
    loop {
        let events = server.fetch_events().unwrap();
        let mut disconnected = false;
        for event in events {
            match event {
                ServerEvent::Data { data, .. } => received.extend(data),
                ServerEvent::Disconnected { id } => {
                    assert!(!server.is_secure(id));
                    disconnected = true;
                }
                _ => {}
            }
        }
        if disconnected {
            break;
        }
    }
    released_tx.send(()).unwrap();

    assert_eq!(received, b"bye");
    client.join().unwrap();
}

#[test]
fn failed_handshake_never_connects() {
    init_tracing();
    let (config, _guard, _) = generate_test_tls_config();
    let manager = SecureSocketManager::<TcpChannel>::from_config(&config, "").unwrap();
    let listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut reply = Vec::new();
        let _ = stream.read_to_end(&mut reply);
        reply
    });

    let channel = Arc::new(TcpChannel::new(1, accept_one(&listener)));
    let err = manager.init(&channel).unwrap_err();

    assert!(matches!(err, Error::Record(_)), "unexpected error: {err}");
    assert!(!manager.is_secure(&channel));
    assert!(manager.is_empty());
    drop(channel);
    assert!(client.join().unwrap().is_empty());
}

#[test]
fn plaintext_manager_passes_bytes_through() {
    init_tracing();
    let manager = PlainSocketManager::default();
    let listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"plain").unwrap();
        let mut reply = [0; 5];
        stream.read_exact(&mut reply).unwrap();
        reply
    });

    let channel = Arc::new(TcpChannel::new(1, accept_one(&listener)));
    manager.init(&channel).unwrap();
    // The manager serves any channel type, so name the one meant here.
    let tcp: &TcpChannel = &channel;
    assert!(!manager.is_secure(tcp));

    let mut received = Vec::new();
    while received.len() < 5 {
        manager.read(tcp, &mut received).unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(received, b"plain");

    manager.write(tcp, b"PLAIN", &DrainingWriter).unwrap();
    assert_eq!(&client.join().unwrap(), b"PLAIN");
    assert!(!manager.on_close(tcp));

    let err = loop {
        match manager.read(tcp, &mut received) {
            Ok(_) => thread::sleep(Duration::from_millis(1)),
            Err(err) => break err,
        }
    };
    assert!(err.is_peer_closed());
}

#[test]
fn rejects_unknown_transport_type() {
    let config = config::Config::builder()
        .set_default("transport_type", "carrier-pigeon")
        .unwrap()
        .build()
        .unwrap();
    let err = Server::new(&config).err().unwrap();
    assert!(matches!(err, Error::InvalidTransportType { .. }));
}

#[test]
fn tls_requires_credentials() {
    let config = config::Config::builder()
        .set_default("transport_type", "tls")
        .unwrap()
        .build()
        .unwrap();
    let err = Server::new(&config).err().unwrap();
    assert!(matches!(err, Error::TlsServerConfigMissing));
}

#[test]
fn inactive_without_listeners() {
    let config = config::Config::builder().build().unwrap();
    let mut server = Server::new(&config).unwrap();
    assert_eq!(server.fetch_events().unwrap(), vec![ServerEvent::Inactive]);
}

fn run_echo_server(server: &mut Server, expect_secure: bool) {
    let mut connected = false;
    loop {
        for event in server.fetch_events().unwrap() {
            match event {
                ServerEvent::Connected { id, secure } => {
                    assert_eq!(secure, expect_secure);
                    assert_eq!(server.is_secure(id), expect_secure);
                    connected = true;
                }
                ServerEvent::Data { id, data } => server.send_to(id, &data).unwrap(),
                ServerEvent::Disconnected { .. } => {
                    assert!(connected);
                    return;
                }
                ServerEvent::Inactive => panic!("server went inactive while listening"),
            }
        }
    }
}

fn connect_tls(
    addr: SocketAddr,
    config: Arc<rustls::ClientConfig>,
) -> StreamOwned<ClientConnection, TcpStream> {
    let stream = TcpStream::connect(addr).unwrap();
    let conn = ClientConnection::new(config, "localhost".try_into().unwrap()).unwrap();
    StreamOwned::new(conn, stream)
}

fn accept_one(listener: &mio::net::TcpListener) -> mio::net::TcpStream {
    loop {
        match listener.accept() {
            Ok((stream, _)) => return stream,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(1))
            }
            Err(err) => panic!("accept failed: {err}"),
        }
    }
}
