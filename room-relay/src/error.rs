use thiserror::Error;

use crate::registry::ConnectionId;

/// Failures a single relay event can produce.
///
/// Every variant is contained to the event that raised it: the requester may
/// be told about it, other connections never are.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// A join, leave or message named a room that is empty or malformed.
    #[error("invalid room: {0}")]
    InvalidRoom(String),

    /// An inbound frame could not be decoded into a client event.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The event came from a connection that is no longer registered.
    #[error("connection {0} is no longer registered")]
    StaleConnection(ConnectionId),

    /// No identifier or connection slot is available for a new connection.
    #[error("relay is at capacity")]
    CapacityExceeded,
}
