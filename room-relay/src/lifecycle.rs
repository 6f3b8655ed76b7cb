use std::{net::SocketAddr, sync::Arc};

use tracing::{debug, warn};

use crate::{
    error::RelayError,
    message::RoomName,
    registry::{ConnectionId, Outbox},
    relay::Relay,
};

/// Connect and disconnect handling around a shared [`Relay`].
#[derive(Clone)]
pub struct Lifecycle {
    relay: Arc<Relay>,
}

impl Lifecycle {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Registers a new connection. Rooms are untouched until it joins one.
    pub async fn connect(
        &self,
        outbox: Outbox,
        peer: Option<SocketAddr>,
    ) -> Result<Session, RelayError> {
        let id = self.relay.register(outbox, peer).await?;
        Ok(Session {
            id,
            relay: Arc::clone(&self.relay),
            closed: false,
        })
    }
}

/// A registered connection.
///
/// Call [`Session::close`] when the transport ends. If the session is dropped
/// instead (aborted task, panic), the same cleanup is scheduled on the
/// runtime, so every connection is purged even on abrupt failure.
pub struct Session {
    id: ConnectionId,
    relay: Arc<Relay>,
    closed: bool,
}

impl Session {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Leaves every room, then unregisters. Returns the rooms that were left.
    pub async fn close(mut self) -> Vec<RoomName> {
        let left = self.relay.purge(self.id).await.unwrap_or_default();
        self.closed = true;
        left
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        let id = self.id;
        let relay = Arc::clone(&self.relay);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(connection = %id, "session dropped without close, purging");
                handle.spawn(async move {
                    relay.purge(id).await;
                });
            }
            Err(_) => warn!(connection = %id, "session dropped outside a runtime, not purged"),
        }
    }
}
