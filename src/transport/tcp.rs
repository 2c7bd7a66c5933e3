//! `mio` TCP streams as [`Channel`]s.

use super::{Channel, ChannelId, ChannelRead};

use mio::net::TcpStream;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};

/// A non-blocking TCP stream tagged with its connection id.
#[derive(Debug)]
pub struct TcpChannel {
    id: ChannelId,
    stream: TcpStream,
    peer_addr: Option<SocketAddr>,
}

impl TcpChannel {
    pub fn new(id: ChannelId, stream: TcpStream) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self {
            id,
            stream,
            peer_addr,
        }
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

impl Channel for TcpChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<ChannelRead> {
        if buf.is_empty() {
            return Ok(ChannelRead::Data(0));
        }
        match (&self.stream).read(buf) {
            Ok(0) => Ok(ChannelRead::Eof),
            Ok(n) => Ok(ChannelRead::Data(n)),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(ChannelRead::WouldBlock)
            }
            Err(err) => Err(err),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match (&self.stream).write(buf) {
            Ok(n) => Ok(n),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() == ErrorKind::NotConnected => Ok(()),
            result => result,
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}
