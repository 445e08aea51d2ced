//! Owns the serial radio link between the controller and a car
//!
//! The radio itself is hidden behind [`Transport`], which only has to hand
//! out a byte stream to a peer. [`CarConnection`] runs the connection state
//! machine on top of it and [`ConnectionRegistry`] makes sure each car has at
//! most one connection.

pub mod connection;
pub mod registry;
pub mod tcp;

#[cfg(test)]
mod testing;

pub use connection::{CarConnection, ConnectionEvent, ConnectionState, Listener, StateChange};
pub use registry::ConnectionRegistry;
pub use tcp::TcpTransport;

use common::types::PeerAddress;
use crossbeam::channel::Sender;
use std::fmt::{Debug, Formatter};
use std::io::{self, Read, Write};
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

/// Well known service id of the serial port profile
pub const SPP_UUID: Uuid = Uuid::from_u128(0x0000_1101_0000_1000_8000_0080_5F9B_34FB);

/// Opens byte streams to cars
pub trait Transport: Send + Sync {
    /// Blocks until the channel is established or the attempt failed
    fn open(&self, peer: &PeerAddress, service: Uuid) -> io::Result<Channel>;
}

/// Shuts a channel down from the local side
pub trait Close: Send {
    /// Must unblock any read pending on the channel
    fn close(&mut self) -> io::Result<()>;
}

/// Both halves of an open stream to a car
pub struct Channel {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub closer: Box<dyn Close>,
}

impl Debug for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("reader", &"Read { .. }")
            .field("writer", &"Write { .. }")
            .field("closer", &"Close { .. }")
            .finish()
    }
}

pub type LinkResult<T> = Result<T, LinkError>;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Could not open link: {0}")]
    OpenFailed(#[source] io::Error),
    #[error("Could not close link: {0}")]
    CloseFailed(#[source] io::Error),
    #[error("Peer closed the link")]
    PeerDropped,
    #[error("Could not send to peer: {0}")]
    SendFailed(#[source] io::Error),
}

/// Forwards connection events into a channel, to be drained by the control thread
///
/// The sender should be unbounded, the connection blocks while delivering.
pub fn channel_listener(sender: Sender<ConnectionEvent>) -> Listener {
    Box::new(move |event| {
        if sender.send(event).is_err() {
            trace!("Event receiver gone, event dropped");
        }
    })
}
