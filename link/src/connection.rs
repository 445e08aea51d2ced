//! Connection state machine for a single car
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected --disconnect--> Disconnecting --> Disconnected
//!                               |                  |                          |
//!                               +--err--> Failed   +--peer drop--> Disconnected  +--err--> Failed
//! ```
//!
//! While connected, a reader thread blocks on the stream to notice the car
//! going away. `disconnect` unblocks it by closing the stream, so the reader
//! is told about the teardown through a stop flag first and the teardown sets
//! the final state itself once the reader has exited. Every link gets its own
//! stop flag, a reader left behind by a failed close stays stopped.
//!
//! `connect`, `disconnect` and `update` are serialized per connection, a call
//! made while another one is in flight waits for it to finish.

use crate::{Channel, Close, LinkError, LinkResult, Transport, SPP_UUID};
use common::error::LogErrorExt;
use common::types::PeerAddress;
use std::fmt::{Debug, Formatter};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, span, trace, warn, Level};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

/// Published on every state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub peer: PeerAddress,
    pub state: ConnectionState,
    pub last_state: ConnectionState,
    /// Only set when `state` is `Failed`
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged(StateChange),
    DataReceived(u8),
}

/// Called synchronously for every event, in the order the events happen
///
/// Listeners must not call back into the connection that notifies them.
pub type Listener = Box<dyn FnMut(ConnectionEvent) + Send>;

type Writer = Box<dyn Write + Send>;

struct Status {
    peer: PeerAddress,
    state: ConnectionState,
    last_state: ConnectionState,
    error: Option<String>,
    listener: Option<Listener>,
}

impl Status {
    fn set_state(&mut self, state: ConnectionState) {
        self.last_state = self.state;
        self.state = state;
        if state != ConnectionState::Failed {
            self.error = None;
        }

        info!(peer = %self.peer, "{:?} -> {:?}", self.last_state, self.state);
        self.notify();
    }

    fn notify(&mut self) {
        let change = StateChange {
            peer: self.peer.clone(),
            state: self.state,
            last_state: self.last_state,
            error: self.error.clone(),
        };

        if let Some(listener) = &mut self.listener {
            (listener)(ConnectionEvent::StateChanged(change));
        }
    }
}

/// State shared with the reader thread
struct Shared {
    status: Mutex<Status>,
    writer: Mutex<Option<Writer>>,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn writer(&self) -> MutexGuard<'_, Option<Writer>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, state: ConnectionState) {
        self.status().set_state(state);
    }

    fn fail(&self, error: &LinkError) {
        let mut status = self.status();
        status.error = Some(error.to_string());
        status.set_state(ConnectionState::Failed);
    }

    fn deliver(&self, byte: u8) {
        trace!(byte, "Received");
        let mut status = self.status();
        if let Some(listener) = &mut status.listener {
            (listener)(ConnectionEvent::DataReceived(byte));
        }
    }

    /// The car went away on its own
    fn peer_dropped(&self) {
        *self.writer() = None;

        let mut status = self.status();
        // A failed send or a teardown already decided the state
        if status.state == ConnectionState::Connected {
            status.set_state(ConnectionState::Disconnected);
        }
    }
}

/// The parts of an open link only the lifecycle operations touch
struct Session {
    closer: Box<dyn Close>,
    reader: JoinHandle<()>,
    stopping: Arc<AtomicBool>,
}

/// Link to one car
pub struct CarConnection {
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

impl Debug for CarConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let status = self.shared.status();
        f.debug_struct("CarConnection")
            .field("peer", &status.peer)
            .field("state", &status.state)
            .field("last_state", &status.last_state)
            .field("error", &status.error)
            .finish_non_exhaustive()
    }
}

impl CarConnection {
    /// Creates a disconnected connection, without notifying the listener
    pub fn new(
        transport: Arc<dyn Transport>,
        peer: PeerAddress,
        listener: Option<Listener>,
    ) -> Self {
        let status = Status {
            peer,
            state: ConnectionState::Disconnected,
            last_state: ConnectionState::Disconnected,
            error: None,
            listener,
        };

        CarConnection {
            transport,
            shared: Arc::new(Shared {
                status: Mutex::new(status),
                writer: Mutex::new(None),
            }),
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status().state
    }

    pub fn last_state(&self) -> ConnectionState {
        self.shared.status().last_state
    }

    pub fn peer(&self) -> PeerAddress {
        self.shared.status().peer.clone()
    }

    /// Why the connection failed, only set in the `Failed` state
    pub fn error_message(&self) -> Option<String> {
        self.shared.status().error.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Opens the link, blocking until it is established or failed
    #[tracing::instrument(skip(self))]
    pub fn connect(&self) {
        let mut session = self.session();
        self.connect_locked(&mut session);
    }

    /// Tears the link down, blocking until the reader thread has exited
    #[tracing::instrument(skip(self))]
    pub fn disconnect(&self) {
        let mut session = self.session();
        self.disconnect_locked(&mut session);
    }

    /// Points the connection at `peer` and replaces the listener
    ///
    /// Staying connected to the same car only re-announces the current state
    /// to the new listener, a different car is disconnected first.
    #[tracing::instrument(skip(self, listener))]
    pub fn update(&self, peer: PeerAddress, listener: Option<Listener>) {
        let mut session = self.session();
        self.update_locked(&mut session, peer, listener);
    }

    /// Replaces the listener and runs a full disconnect and connect cycle
    #[tracing::instrument(skip(self, listener))]
    pub fn reconnect(&self, listener: Option<Listener>) {
        let mut session = self.session();
        let peer = self.peer();
        self.update_locked(&mut session, peer, listener);
        self.disconnect_locked(&mut session);
        self.connect_locked(&mut session);
    }

    /// Writes to the car without waiting for any acknowledgement
    ///
    /// Failures move the connection to `Failed`, bytes sent while not
    /// connected are dropped.
    pub fn send_bytes(&self, data: &[u8]) {
        let result = {
            let mut writer = self.shared.writer();
            let Some(stream) = writer.as_mut() else {
                debug!("Not connected, dropping {} bytes", data.len());
                return;
            };

            trace!(?data, "Sending");
            let result = stream.write_all(data).and_then(|()| stream.flush());
            if result.is_err() {
                *writer = None;
            }
            result
        };

        if let Err(err) = result {
            let err = LinkError::SendFailed(err);
            warn!("{err}");
            self.shared.fail(&err);
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect_locked(&self, session: &mut Option<Session>) {
        if self.is_connected() {
            debug!("Already connected");
            return;
        }
        // Left behind by a peer drop or a failed send
        self.release(session);

        let peer = self.peer();
        self.shared.transition(ConnectionState::Connecting);

        let channel = match self.transport.open(&peer, SPP_UUID) {
            Ok(channel) => channel,
            Err(err) => {
                let err = LinkError::OpenFailed(err);
                warn!("Could not connect to {peer}: {err}");
                self.shared.fail(&err);
                return;
            }
        };

        let Channel {
            reader,
            writer,
            mut closer,
        } = channel;

        let stopping = Arc::new(AtomicBool::new(false));
        *self.shared.writer() = Some(writer);
        // Connected before the reader starts so an early drop can't be overwritten
        self.shared.transition(ConnectionState::Connected);

        let shared = self.shared.clone();
        let stop = stopping.clone();
        let spawned = thread::Builder::new()
            .name(format!("car-reader {peer}"))
            .spawn(move || read_loop(shared, reader, stop));

        match spawned {
            Ok(reader) => {
                *session = Some(Session {
                    closer,
                    reader,
                    stopping,
                })
            }
            Err(err) => {
                *self.shared.writer() = None;
                closer.close().log_warn("Could not close unused link");
                self.shared.fail(&LinkError::OpenFailed(err));
            }
        }
    }

    fn disconnect_locked(&self, session: &mut Option<Session>) {
        self.shared.transition(ConnectionState::Disconnecting);

        let result = match session.take() {
            Some(active) => self.shutdown(active),
            None => Ok(()),
        };
        *self.shared.writer() = None;

        match result {
            // The reader may have reported a drop while we were closing, this is the final word
            Ok(()) => self.shared.transition(ConnectionState::Disconnected),
            Err(err) => {
                error!("{err}");
                self.shared.fail(&err);
            }
        }
    }

    fn update_locked(
        &self,
        session: &mut Option<Session>,
        peer: PeerAddress,
        listener: Option<Listener>,
    ) {
        let (state, current) = {
            let status = self.shared.status();
            (status.state, status.peer.clone())
        };

        if state == ConnectionState::Connected {
            if current == peer {
                debug!("Already connected to {peer}, re-announcing state");
                let mut status = self.shared.status();
                status.listener = listener;
                status.notify();
                return;
            }

            debug!("Connected to {current}, disconnecting before switching to {peer}");
            self.disconnect_locked(session);
        }
        self.release(session);

        let mut status = self.shared.status();
        status.peer = peer;
        status.listener = listener;
        status.set_state(ConnectionState::Disconnected);
    }

    /// Stops and joins the reader of a session
    fn shutdown(&self, session: Session) -> LinkResult<()> {
        let Session {
            mut closer,
            reader,
            stopping,
        } = session;

        stopping.store(true, Ordering::SeqCst);
        // A reader stuck on a stream that failed to close can't be joined, it
        // exits quietly whenever the read returns
        closer.close().map_err(LinkError::CloseFailed)?;

        if reader.join().is_err() {
            error!("Reader thread panicked");
        }

        Ok(())
    }

    /// Cleans up a session whose link is already gone, without any transitions
    fn release(&self, session: &mut Option<Session>) {
        if let Some(stale) = session.take() {
            debug!("Releasing stale link");
            *self.shared.writer() = None;
            self.shutdown(stale).log_warn("Could not release stale link");
        }
    }
}

impl Drop for CarConnection {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(session) = session {
            *self.shared.writer() = None;
            self.shutdown(session).log_warn("Could not stop link");
        }
    }
}

fn read_loop(
    shared: Arc<Shared>,
    mut reader: Box<dyn Read + Send>,
    stopping: Arc<AtomicBool>,
) {
    let span = span!(Level::INFO, "Car reader thread");
    let _enter = span.enter();

    let mut byte = [0; 1];
    let err = loop {
        match reader.read(&mut byte) {
            Ok(0) => break LinkError::PeerDropped,
            // Bytes still arriving on a link that is being torn down are not ours
            Ok(_) if stopping.load(Ordering::SeqCst) => {}
            Ok(_) => shared.deliver(byte[0]),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!("Read failed: {err}");
                break LinkError::PeerDropped;
            }
        }
    };

    if stopping.load(Ordering::SeqCst) {
        trace!("Reader stopped by teardown");
        return;
    }

    info!("{err}");
    shared.peer_dropped();
}

#[cfg(test)]
mod tests {
    use super::{CarConnection, ConnectionEvent, ConnectionState};
    use crate::testing::{recorder, states, wait_for_state, MockTransport};
    use common::types::PeerAddress;
    use crossbeam::channel::Receiver;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use ConnectionState::*;

    fn connected(transport: &Arc<MockTransport>) -> (CarConnection, Receiver<ConnectionEvent>) {
        let (listener, events) = recorder();
        let connection = CarConnection::new(transport.clone(), "car-a".into(), Some(listener));
        connection.connect();
        assert_eq!(states(&events), vec![Connecting, Connected]);

        (connection, events)
    }

    #[test]
    fn starts_quietly() {
        let transport = Arc::new(MockTransport::default());
        let (listener, events) = recorder();
        let connection = CarConnection::new(transport, "car-a".into(), Some(listener));

        assert_eq!(connection.state(), Disconnected);
        assert!(states(&events).is_empty());
    }

    #[test]
    fn connect_and_disconnect() {
        let transport = Arc::new(MockTransport::default());
        let (connection, events) = connected(&transport);
        assert!(connection.is_connected());
        assert_eq!(transport.opened(), vec![PeerAddress::from("car-a")]);

        connection.disconnect();
        assert_eq!(states(&events), vec![Disconnecting, Disconnected]);
        assert_eq!(connection.state(), Disconnected);
        assert_eq!(connection.last_state(), Disconnecting);
        assert!(transport.peer(0).is_closed());
    }

    #[test]
    fn receives_data() {
        let transport = Arc::new(MockTransport::default());
        let (_connection, events) = connected(&transport);

        transport.peer(0).send(b"D\x03\x04\x05");
        for expected in b"D\x03\x04\x05" {
            let event = events.recv_timeout(Duration::from_secs(5)).expect("Receive");
            assert_eq!(event, ConnectionEvent::DataReceived(*expected));
        }
    }

    #[test]
    fn open_failure() {
        let transport = Arc::new(MockTransport::default());
        transport.fail_opens(true);
        let (listener, events) = recorder();
        let connection = CarConnection::new(transport, "car-a".into(), Some(listener));

        connection.connect();
        assert_eq!(states(&events), vec![Connecting, Failed]);
        assert_eq!(connection.state(), Failed);
        assert_eq!(connection.last_state(), Connecting);
        let message = connection.error_message().expect("Error message");
        assert!(message.contains("Could not open link"), "{message}");

        // Nothing to write to
        connection.send_bytes(b"HS\0\0");
        assert_eq!(connection.state(), Failed);
    }

    #[test]
    fn error_cleared_after_retry() {
        let transport = Arc::new(MockTransport::default());
        transport.fail_opens(true);
        let connection = CarConnection::new(transport.clone(), "car-a".into(), None);
        connection.connect();
        assert!(connection.error_message().is_some());

        transport.fail_opens(false);
        connection.connect();
        assert_eq!(connection.state(), Connected);
        assert_eq!(connection.error_message(), None);
    }

    #[test]
    fn sends_bytes() {
        let transport = Arc::new(MockTransport::default());
        let (connection, _events) = connected(&transport);

        connection.send_bytes(b"HS\x10\x20");
        connection.send_bytes(b"HS\0\0");
        assert_eq!(transport.peer(0).received(), b"HS\x10\x20HS\0\0");
    }

    #[test]
    fn send_failure() {
        let transport = Arc::new(MockTransport::default());
        let (connection, events) = connected(&transport);

        transport.peer(0).fail_writes();
        connection.send_bytes(b"HS\0\0");
        assert_eq!(states(&events), vec![Failed]);
        assert_eq!(connection.state(), Failed);
        assert!(connection.error_message().is_some());

        // Reconnecting cleans up the broken link first
        connection.connect();
        assert_eq!(states(&events), vec![Connecting, Connected]);
        assert!(transport.peer(0).is_closed());
        assert_eq!(transport.opened().len(), 2);
    }

    #[test]
    fn peer_drop() {
        let transport = Arc::new(MockTransport::default());
        let (connection, events) = connected(&transport);

        transport.peer(0).hang_up();
        let change = wait_for_state(&events, Disconnected);
        assert_eq!(change.last_state, Connected);
        assert_eq!(change.error, None);
        assert_eq!(connection.state(), Disconnected);

        // Further sends are dropped without failing
        connection.send_bytes(b"HS\0\0");
        assert_eq!(connection.state(), Disconnected);

        connection.disconnect();
        assert_eq!(states(&events), vec![Disconnecting, Disconnected]);
    }

    #[test]
    fn peer_drop_during_disconnect() {
        for _ in 0..20 {
            let transport = Arc::new(MockTransport::default());
            let (connection, events) = connected(&transport);

            transport.peer(0).hang_up();
            connection.disconnect();

            let seen = states(&events);
            assert_eq!(seen.last(), Some(&Disconnected), "{seen:?}");
            assert!(!seen.contains(&Connected), "{seen:?}");
            assert_eq!(connection.state(), Disconnected);
        }
    }

    #[test]
    fn close_failure() {
        let transport = Arc::new(MockTransport::default());
        let (connection, events) = connected(&transport);

        transport.peer(0).fail_close();
        connection.disconnect();
        assert_eq!(states(&events), vec![Disconnecting, Failed]);
        assert_eq!(connection.state(), Failed);
        assert!(connection.error_message().expect("Error message").contains("close"));

        // Unblock the reader so the test doesn't leak a thread
        transport.peer(0).hang_up();
    }

    #[test]
    fn old_link_cannot_touch_new_one() {
        let transport = Arc::new(MockTransport::default());
        let (connection, events) = connected(&transport);

        transport.peer(0).fail_close();
        connection.disconnect();
        assert_eq!(connection.state(), Failed);

        connection.connect();
        assert_eq!(connection.state(), Connected);
        assert_eq!(states(&events), vec![Disconnecting, Failed, Connecting, Connected]);

        // The reader left on the old link wakes up now
        transport.peer(0).send(b"D\x01\x00\x00");
        transport.peer(0).hang_up();
        thread::sleep(Duration::from_millis(100));

        assert_eq!(connection.state(), Connected);
        assert!(events.try_recv().is_err());

        connection.send_bytes(b"HS\x05\x05");
        assert_eq!(transport.peer(1).received(), b"HS\x05\x05");
        transport.peer(1).send(b"D");
        let event = events.recv_timeout(Duration::from_secs(5)).expect("Receive");
        assert_eq!(event, ConnectionEvent::DataReceived(b'D'));
    }

    #[test]
    fn disconnect_when_idle() {
        let transport = Arc::new(MockTransport::default());
        let (listener, events) = recorder();
        let connection = CarConnection::new(transport, "car-a".into(), Some(listener));

        connection.disconnect();
        assert_eq!(states(&events), vec![Disconnecting, Disconnected]);
    }

    #[test]
    fn connect_twice_is_noop() {
        let transport = Arc::new(MockTransport::default());
        let (connection, events) = connected(&transport);

        connection.connect();
        assert!(states(&events).is_empty());
        assert_eq!(transport.opened().len(), 1);
    }

    #[test]
    fn update_same_peer() {
        let transport = Arc::new(MockTransport::default());
        let (connection, old_events) = connected(&transport);

        let (listener, events) = recorder();
        connection.update("car-a".into(), Some(listener));

        let changes = crate::testing::changes(&events);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].state, Connected);
        assert_eq!(changes[0].last_state, Connecting);
        assert_eq!(connection.state(), Connected);
        assert!(old_events.try_recv().is_err());
        assert!(!transport.peer(0).is_closed());
    }

    #[test]
    fn update_other_peer() {
        let transport = Arc::new(MockTransport::default());
        let (connection, events) = connected(&transport);

        let (listener, new_events) = recorder();
        connection.update("car-b".into(), Some(listener));

        // The teardown still goes to the old listener
        assert_eq!(states(&events), vec![Disconnecting, Disconnected]);
        let changes = crate::testing::changes(&new_events);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].state, Disconnected);
        assert_eq!(changes[0].peer, PeerAddress::from("car-b"));
        assert!(transport.peer(0).is_closed());

        connection.connect();
        assert_eq!(states(&new_events), vec![Connecting, Connected]);
        assert_eq!(
            transport.opened(),
            vec![PeerAddress::from("car-a"), PeerAddress::from("car-b")]
        );
    }

    #[test]
    fn update_while_connecting_waits() {
        let transport = Arc::new(MockTransport::default());
        let gate = transport.hold_opens();
        let (listener, events) = recorder();
        let connection = Arc::new(CarConnection::new(
            transport.clone(),
            "car-a".into(),
            Some(listener),
        ));

        let connecting = {
            let connection = connection.clone();
            thread::spawn(move || connection.connect())
        };
        wait_for_state(&events, Connecting);

        let updating = {
            let connection = connection.clone();
            thread::spawn(move || connection.update("car-b".into(), None))
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!updating.is_finished());
        assert_eq!(connection.state(), Connecting);

        gate.send(()).expect("Release open");
        connecting.join().expect("Connect thread");
        updating.join().expect("Update thread");

        // The attempt resolved first, then the update retargeted the connection
        assert_eq!(states(&events), vec![Connected, Disconnecting, Disconnected]);
        assert_eq!(connection.state(), Disconnected);
        assert_eq!(connection.peer(), PeerAddress::from("car-b"));
        assert_eq!(transport.opened().len(), 1);
        assert!(transport.peer(0).is_closed());
    }

    #[test]
    fn drop_stops_reader() {
        let transport = Arc::new(MockTransport::default());
        let (connection, events) = connected(&transport);

        drop(connection);
        assert!(transport.peer(0).is_closed());
        assert!(states(&events).is_empty());
    }
}
