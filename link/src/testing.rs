//! In-memory transport for exercising connections without a radio

use crate::{Channel, Close, ConnectionEvent, ConnectionState, Listener, StateChange, Transport};
use common::types::PeerAddress;
use crossbeam::channel::{self, Receiver, Sender};
use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

enum Wire {
    Byte(u8),
    /// The car hung up, reads see the end of the stream
    HangUp,
    /// Closed locally, reads fail
    Closed,
}

/// The car's end of one opened channel
#[derive(Clone)]
pub struct MockPeer {
    to_car: Sender<Wire>,
    from_car: Arc<Mutex<Vec<u8>>>,
    fail_writes: Arc<AtomicBool>,
    fail_close: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MockPeer {
    pub fn send(&self, bytes: &[u8]) {
        for byte in bytes {
            self.to_car.send(Wire::Byte(*byte)).expect("Reader gone");
        }
    }

    pub fn hang_up(&self) {
        let _ = self.to_car.send(Wire::HangUp);
    }

    pub fn received(&self) -> Vec<u8> {
        self.from_car.lock().expect("Lock").clone()
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MockReader(Receiver<Wire>);

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.recv() {
            Ok(Wire::Byte(byte)) => {
                buf[0] = byte;
                Ok(1)
            }
            Ok(Wire::HangUp) | Err(_) => Ok(0),
            Ok(Wire::Closed) => Err(io::Error::new(ErrorKind::ConnectionAborted, "Link closed")),
        }
    }
}

struct MockWriter(MockPeer);

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.0.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::BrokenPipe, "Radio out of range"));
        }

        self.0.from_car.lock().expect("Lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct MockCloser(MockPeer);

impl Close for MockCloser {
    fn close(&mut self) -> io::Result<()> {
        if self.0.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::Other, "Radio busy"));
        }

        self.0.closed.store(true, Ordering::SeqCst);
        let _ = self.0.to_car.send(Wire::Closed);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockTransport {
    peers: Mutex<Vec<(PeerAddress, MockPeer)>>,
    fail_opens: AtomicBool,
    gate: Mutex<Option<Receiver<()>>>,
}

impl MockTransport {
    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    /// Makes the next opens block until the returned sender fires
    pub fn hold_opens(&self) -> Sender<()> {
        let (tx, rx) = channel::unbounded();
        *self.gate.lock().expect("Lock") = Some(rx);
        tx
    }

    pub fn peer(&self, index: usize) -> MockPeer {
        self.peers.lock().expect("Lock")[index].1.clone()
    }

    pub fn opened(&self) -> Vec<PeerAddress> {
        self.peers
            .lock()
            .expect("Lock")
            .iter()
            .map(|(address, _)| address.clone())
            .collect()
    }
}

impl Transport for MockTransport {
    fn open(&self, peer: &PeerAddress, _service: Uuid) -> io::Result<Channel> {
        let gate = self.gate.lock().expect("Lock").clone();
        if let Some(gate) = gate {
            gate.recv().expect("Gate dropped");
        }

        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(io::Error::new(ErrorKind::ConnectionRefused, "Car not in range"));
        }

        let (to_car, rx) = channel::unbounded();
        let handle = MockPeer {
            to_car,
            from_car: Default::default(),
            fail_writes: Default::default(),
            fail_close: Default::default(),
            closed: Default::default(),
        };
        self.peers
            .lock()
            .expect("Lock")
            .push((peer.clone(), handle.clone()));

        Ok(Channel {
            reader: Box::new(MockReader(rx)),
            writer: Box::new(MockWriter(handle.clone())),
            closer: Box::new(MockCloser(handle)),
        })
    }
}

/// Listener recording every event
pub fn recorder() -> (Listener, Receiver<ConnectionEvent>) {
    let (tx, rx) = channel::unbounded();
    (crate::channel_listener(tx), rx)
}

/// Drains the state changes received so far
pub fn changes(events: &Receiver<ConnectionEvent>) -> Vec<StateChange> {
    events
        .try_iter()
        .filter_map(|event| match event {
            ConnectionEvent::StateChanged(change) => Some(change),
            ConnectionEvent::DataReceived(_) => None,
        })
        .collect()
}

pub fn states(events: &Receiver<ConnectionEvent>) -> Vec<ConnectionState> {
    changes(events).into_iter().map(|change| change.state).collect()
}

/// Blocks until `state` is announced, skipping anything before it
pub fn wait_for_state(events: &Receiver<ConnectionEvent>, state: ConnectionState) -> StateChange {
    loop {
        let event = events
            .recv_timeout(Duration::from_secs(5))
            .expect("Timed out waiting for state");

        if let ConnectionEvent::StateChanged(change) = event {
            if change.state == state {
                return change;
            }
        }
    }
}
