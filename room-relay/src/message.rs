use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::RelayError, registry::ConnectionId};

const ROOM_FIELD: &str = "room";
const FROM_FIELD: &str = "from";
const TEXT_FIELD: &str = "message";

/// Client-chosen room identifier, kept exactly as supplied.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomName(String);

impl RoomName {
    pub fn parse(raw: impl Into<String>) -> Result<Self, RelayError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(RelayError::InvalidRoom("room name cannot be empty".to_string()));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomName {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RoomName> for String {
    fn from(room: RoomName) -> Self {
        room.0
    }
}

impl Borrow<str> for RoomName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Audience of a message.
///
/// `Global` is the implicit room every registered connection belongs to. It
/// never appears in the room directory and no client-supplied name maps to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Global,
    Room(RoomName),
}

/// A message payload as submitted by a client.
///
/// Fields are kept verbatim so arbitrary client data survives the relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::new().with_field(TEXT_FIELD, message)
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn with_room(self, room: impl Into<String>) -> Self {
        let room: String = room.into();
        self.with_field(ROOM_FIELD, room)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn message(&self) -> Option<&str> {
        self.0.get(TEXT_FIELD).and_then(Value::as_str)
    }

    pub fn room(&self) -> Option<&str> {
        self.0.get(ROOM_FIELD).and_then(Value::as_str)
    }

    pub fn sender(&self) -> Option<ConnectionId> {
        self.0
            .get(FROM_FIELD)
            .and_then(Value::as_u64)
            .map(ConnectionId::new)
    }

    /// Resolves where this envelope should go.
    ///
    /// A missing, null or empty `room` means everyone.
    pub fn scope(&self) -> Result<Scope, RelayError> {
        match self.0.get(ROOM_FIELD) {
            None | Some(Value::Null) => Ok(Scope::Global),
            Some(Value::String(room)) if room.is_empty() => Ok(Scope::Global),
            Some(Value::String(room)) => RoomName::parse(room.as_str()).map(Scope::Room),
            Some(_) => Err(RelayError::InvalidRoom(
                "room must be a string".to_string(),
            )),
        }
    }

    /// Tags the envelope with its sender, replacing any client-supplied `from`.
    pub fn stamped(mut self, from: ConnectionId) -> Self {
        self.0.insert(FROM_FIELD.to_string(), Value::from(from.get()));
        self
    }
}

impl From<Map<String, Value>> for Envelope {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom(String),
    LeaveRoom(String),
    Message(Envelope),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Connected { id: ConnectionId },
    RoomJoined(RoomName),
    RoomLeft(RoomName),
    Message(Envelope),
    Error { message: String },
}

impl ServerEvent {
    pub fn error(err: &RelayError) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Decodes one inbound text frame.
///
/// Returns `Ok(None)` for event names the relay does not handle so that
/// clients can emit extra events without being disconnected.
pub fn decode_client_event(text: &str) -> Result<Option<ClientEvent>, RelayError> {
    let frame: Frame =
        serde_json::from_str(text).map_err(|err| RelayError::InvalidPayload(err.to_string()))?;

    let event = match frame.event.as_str() {
        "join-room" => ClientEvent::JoinRoom(room_argument(frame.data)?),
        "leave-room" => ClientEvent::LeaveRoom(room_argument(frame.data)?),
        "message" => match frame.data {
            Value::Object(fields) => ClientEvent::Message(Envelope(fields)),
            _ => {
                return Err(RelayError::InvalidPayload(
                    "message data must be an object".to_string(),
                ));
            }
        },
        _ => return Ok(None),
    };

    Ok(Some(event))
}

fn room_argument(data: Value) -> Result<String, RelayError> {
    match data {
        Value::String(room) => Ok(room),
        _ => Err(RelayError::InvalidRoom("room must be a string".to_string())),
    }
}

pub fn decode_server_event(text: &str) -> serde_json::Result<ServerEvent> {
    serde_json::from_str(text)
}

pub fn encode<T: Serialize>(event: &T) -> serde_json::Result<String> {
    serde_json::to_string(event)
}
