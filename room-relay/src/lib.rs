//! Real-time room relay over WebSockets.
//!
//! Clients hold one persistent connection, join any number of named rooms,
//! and send messages either to a room or to every connected peer. The relay
//! stamps each message with the sender's connection id and fans it out
//! best-effort; nothing is persisted.
//!
//! - [`registry`] tracks live connections and their outbound queues.
//! - [`directory`] maps room names to member sets and drops empty rooms.
//! - [`relay`] routes join, leave and message events under one lock.
//! - [`lifecycle`] registers connections and purges them exactly once.
//! - [`message`] defines the named-event JSON protocol.
//! - [`server`] serves the WebSocket endpoint with axum.
//! - [`client`] is a line-oriented terminal client.
//! - [`cli`] parses the command-line interface for both modes.

pub mod cli;
pub mod client;
pub mod directory;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod registry;
pub mod relay;
pub mod server;

pub use error::RelayError;
pub use lifecycle::{Lifecycle, Session};
pub use message::{ClientEvent, Envelope, RoomName, Scope, ServerEvent};
pub use registry::{ConnectionId, Delivery};
pub use relay::{FanOut, Relay};
pub use server::{RelayServer, ServerConfig};
