use crate::connection::{CarConnection, Listener};
use crate::Transport;
use common::types::PeerAddress;
use fxhash::FxHashMap as HashMap;
use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::info;

/// Every car connection of the process, at most one per peer address
///
/// Built once by the application and shared from there. Connections live as
/// long as the registry does.
pub struct ConnectionRegistry {
    transport: Arc<dyn Transport>,
    connections: Mutex<HashMap<PeerAddress, Arc<CarConnection>>>,
}

impl Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("transport", &"Transport { .. }")
            .field("connections", &*self.table())
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::with_transport(Arc::new(transport))
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            connections: Mutex::new(HashMap::default()),
        }
    }

    /// Connects to `peer`, blocking until the link is up or failed
    ///
    /// A peer that is already registered keeps its connection object, which
    /// gets the new listener and goes through a full disconnect and connect
    /// cycle.
    #[tracing::instrument(skip(self, listener))]
    pub fn initialize_connection(
        &self,
        peer: PeerAddress,
        listener: Option<Listener>,
    ) -> Arc<CarConnection> {
        let mut listener = listener;

        // Only held for the lookup, connecting blocks
        let (connection, existing) = {
            let mut table = self.table();
            match table.entry(peer.clone()) {
                Entry::Occupied(entry) => (entry.get().clone(), true),
                Entry::Vacant(entry) => {
                    let connection =
                        CarConnection::new(self.transport.clone(), peer, listener.take());
                    (entry.insert(Arc::new(connection)).clone(), false)
                }
            }
        };

        if existing {
            info!("Redoing existing connection");
            connection.reconnect(listener);
        } else {
            connection.connect();
        }

        connection
    }

    /// Runs `initialize_connection` on a background thread
    pub fn spawn_initialize(
        self: &Arc<Self>,
        peer: PeerAddress,
        listener: Option<Listener>,
    ) -> io::Result<JoinHandle<Arc<CarConnection>>> {
        let registry = self.clone();
        thread::Builder::new()
            .name(format!("car-connect {peer}"))
            .spawn(move || registry.initialize_connection(peer, listener))
    }

    pub fn get(&self, peer: &PeerAddress) -> Option<Arc<CarConnection>> {
        self.table().get(peer).cloned()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<PeerAddress, Arc<CarConnection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
