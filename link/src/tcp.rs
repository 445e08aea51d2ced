//! Transport for radio bridges that expose the car's serial port on a TCP socket

use crate::{Channel, Close, Transport};
use common::types::PeerAddress;
use std::io::{self, ErrorKind};
use std::net::{Shutdown, TcpStream};
use tracing::trace;
use uuid::Uuid;

/// Treats the peer address as `host:port`, the service id is not used
#[derive(Debug, Default, Copy, Clone)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    #[tracing::instrument(skip(self))]
    fn open(&self, peer: &PeerAddress, _service: Uuid) -> io::Result<Channel> {
        let stream = TcpStream::connect(peer.as_str())?;
        stream.set_nodelay(true)?;
        trace!(local = ?stream.local_addr(), "Socket open");

        let reader = stream.try_clone()?;
        let closer = stream.try_clone()?;

        Ok(Channel {
            reader: Box::new(reader),
            writer: Box::new(stream),
            closer: Box::new(TcpCloser(closer)),
        })
    }
}

struct TcpCloser(TcpStream);

impl Close for TcpCloser {
    fn close(&mut self) -> io::Result<()> {
        match self.0.shutdown(Shutdown::Both) {
            // The car already closed its side
            Err(err) if err.kind() == ErrorKind::NotConnected => Ok(()),
            res => res,
        }
    }
}
