use std::{collections::HashMap, fmt, net::SocketAddr, sync::Arc, time::Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{error::RelayError, message::ServerEvent};

/// Outbound queue of a single connection. Fan-out shares one `Arc` per event.
pub type Outbox = mpsc::Sender<Arc<ServerEvent>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of handing one event to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The connection is gone or its writer has shut down.
    Stale,
    /// The connection's outbox is full; the event is dropped for it.
    Dropped,
}

struct ConnectionRecord {
    outbox: Outbox,
    peer: Option<SocketAddr>,
    connected_at: Instant,
}

/// Live connections, keyed by an identifier that is never handed out twice.
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionRecord>,
    next_id: Option<u64>,
    max_connections: Option<usize>,
}

impl ConnectionRegistry {
    pub fn new(max_connections: Option<usize>) -> Self {
        Self::starting_at(1, max_connections)
    }

    fn starting_at(first_id: u64, max_connections: Option<usize>) -> Self {
        Self {
            connections: HashMap::new(),
            next_id: Some(first_id),
            max_connections,
        }
    }

    pub fn register(
        &mut self,
        outbox: Outbox,
        peer: Option<SocketAddr>,
    ) -> Result<ConnectionId, RelayError> {
        if self
            .max_connections
            .is_some_and(|max| self.connections.len() >= max)
        {
            return Err(RelayError::CapacityExceeded);
        }

        // Once the counter overflows the id space is spent for good.
        let raw = self.next_id.ok_or(RelayError::CapacityExceeded)?;
        self.next_id = raw.checked_add(1);

        let id = ConnectionId(raw);
        self.connections.insert(
            id,
            ConnectionRecord {
                outbox,
                peer,
                connected_at: Instant::now(),
            },
        );
        Ok(id)
    }

    pub fn unregister(&mut self, id: ConnectionId) -> bool {
        self.connections.remove(&id).is_some()
    }

    pub fn exists(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn peer(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.connections.get(&id).and_then(|record| record.peer)
    }

    pub fn connected_for(&self, id: ConnectionId) -> Option<std::time::Duration> {
        self.connections
            .get(&id)
            .map(|record| record.connected_at.elapsed())
    }

    /// Queues an event for one connection without waiting.
    pub fn send(&self, id: ConnectionId, event: Arc<ServerEvent>) -> Delivery {
        let Some(record) = self.connections.get(&id) else {
            return Delivery::Stale;
        };

        match record.outbox.try_send(event) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Stale,
        }
    }
}
