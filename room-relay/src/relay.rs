use std::{collections::BTreeSet, net::SocketAddr, sync::Arc};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    directory::RoomDirectory,
    error::RelayError,
    message::{ClientEvent, Envelope, RoomName, Scope, ServerEvent},
    registry::{ConnectionId, ConnectionRegistry, Delivery, Outbox},
};

/// Per-event delivery report.
///
/// A fan-out with zero targets is still a success; stale and dropped targets
/// are counted, never surfaced to the sender.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub targets: usize,
    pub delivered: usize,
    pub stale: usize,
    pub dropped: usize,
}

struct RelayState {
    connections: ConnectionRegistry,
    rooms: RoomDirectory,
}

impl RelayState {
    fn audience(&self, scope: &Scope) -> Vec<ConnectionId> {
        match scope {
            Scope::Global => self.connections.ids(),
            Scope::Room(room) => self.rooms.members(room.as_str()).into_iter().collect(),
        }
    }

    fn fan_out(&self, targets: Vec<ConnectionId>, event: ServerEvent) -> FanOut {
        let event = Arc::new(event);
        let mut report = FanOut {
            targets: targets.len(),
            ..FanOut::default()
        };

        for target in targets {
            match self.connections.send(target, Arc::clone(&event)) {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Stale => report.stale += 1,
                Delivery::Dropped => {
                    warn!(connection = %target, "outbox full, dropping event");
                    report.dropped += 1;
                }
            }
        }

        report
    }

    fn ensure_connected(&self, id: ConnectionId) -> Result<(), RelayError> {
        if self.connections.exists(id) {
            Ok(())
        } else {
            Err(RelayError::StaleConnection(id))
        }
    }
}

/// Routes client events to rooms or to every connection.
///
/// Registry and directory share one lock so that membership changes and
/// fan-out resolution never interleave. Sends are non-blocking, so the lock
/// is held only for in-memory work.
pub struct Relay {
    state: Mutex<RelayState>,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Relay {
    pub fn new(max_connections: Option<usize>) -> Self {
        Self {
            state: Mutex::new(RelayState {
                connections: ConnectionRegistry::new(max_connections),
                rooms: RoomDirectory::new(),
            }),
        }
    }

    pub(crate) async fn register(
        &self,
        outbox: Outbox,
        peer: Option<SocketAddr>,
    ) -> Result<ConnectionId, RelayError> {
        let mut state = self.state.lock().await;
        let id = state.connections.register(outbox, peer)?;
        info!(connection = %id, ?peer, live = state.connections.len(), "connection registered");
        Ok(id)
    }

    /// Drops every membership of `id`, then the connection itself.
    ///
    /// Returns the rooms it left, or `None` if it was already gone.
    pub(crate) async fn purge(&self, id: ConnectionId) -> Option<Vec<RoomName>> {
        let mut state = self.state.lock().await;
        let left = state.rooms.leave_all(id);
        let peer = state.connections.peer(id);
        let uptime = state.connections.connected_for(id);

        if !state.connections.unregister(id) {
            return None;
        }

        info!(
            connection = %id,
            ?peer,
            ?uptime,
            rooms = left.len(),
            live = state.connections.len(),
            "connection disconnected"
        );
        Some(left)
    }

    pub async fn handle(&self, id: ConnectionId, event: ClientEvent) -> Result<FanOut, RelayError> {
        match event {
            ClientEvent::JoinRoom(room) => self.join_room(id, &room).await,
            ClientEvent::LeaveRoom(room) => self.leave_room(id, &room).await,
            ClientEvent::Message(envelope) => self.message(id, envelope).await,
        }
    }

    /// Adds `id` to `room` and announces it to every member, the joiner included.
    pub async fn join_room(&self, id: ConnectionId, room: &str) -> Result<FanOut, RelayError> {
        let room = RoomName::parse(room)?;
        let mut state = self.state.lock().await;
        state.ensure_connected(id)?;

        let newly_joined = state.rooms.join(&room, id);
        let members = state.audience(&Scope::Room(room.clone()));
        let report = state.fan_out(members, ServerEvent::RoomJoined(room.clone()));

        info!(connection = %id, %room, newly_joined, members = report.targets, "joined room");
        Ok(report)
    }

    /// Removes `id` from `room` and acknowledges to the leaver only.
    pub async fn leave_room(&self, id: ConnectionId, room: &str) -> Result<FanOut, RelayError> {
        let room = RoomName::parse(room)?;
        let mut state = self.state.lock().await;
        state.ensure_connected(id)?;

        let was_member = state.rooms.leave(room.as_str(), id);
        let report = state.fan_out(vec![id], ServerEvent::RoomLeft(room.clone()));

        info!(connection = %id, %room, was_member, "left room");
        Ok(report)
    }

    /// Stamps the envelope with its sender and fans it out to the resolved scope.
    pub async fn message(&self, id: ConnectionId, envelope: Envelope) -> Result<FanOut, RelayError> {
        let scope = envelope.scope()?;
        let state = self.state.lock().await;
        state.ensure_connected(id)?;

        let targets = state.audience(&scope);
        let report = state.fan_out(targets, ServerEvent::Message(envelope.stamped(id)));

        match &scope {
            Scope::Global => debug!(from = %id, ?report, "message sent to all"),
            Scope::Room(room) if report.targets == 0 => {
                debug!(from = %id, %room, "message sent to empty room")
            }
            Scope::Room(room) => debug!(from = %id, %room, ?report, "message sent to room"),
        }
        Ok(report)
    }

    /// Sends an event to one connection only.
    pub async fn notify(&self, id: ConnectionId, event: ServerEvent) -> Delivery {
        let state = self.state.lock().await;
        state.connections.send(id, Arc::new(event))
    }

    /// Tells every connection that the relay is going away.
    pub async fn shutdown(&self) -> FanOut {
        let state = self.state.lock().await;
        let everyone = state.audience(&Scope::Global);
        state.fan_out(
            everyone,
            ServerEvent::Error {
                message: "relay shutting down".to_string(),
            },
        )
    }

    pub async fn members(&self, room: &str) -> BTreeSet<ConnectionId> {
        self.state.lock().await.rooms.members(room)
    }

    pub async fn rooms(&self) -> Vec<RoomName> {
        self.state.lock().await.rooms.rooms()
    }

    pub async fn rooms_of(&self, id: ConnectionId) -> Vec<RoomName> {
        self.state.lock().await.rooms.rooms_of(id)
    }

    pub async fn is_connected(&self, id: ConnectionId) -> bool {
        self.state.lock().await.connections.exists(id)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    type Inbox = mpsc::Receiver<Arc<ServerEvent>>;

    async fn connect(relay: &Relay) -> (ConnectionId, Inbox) {
        let (tx, rx) = mpsc::channel(16);
        let id = relay.register(tx, None).await.expect("register");
        (id, rx)
    }

    fn drain(inbox: &mut Inbox) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = inbox.try_recv() {
            events.push((*event).clone());
        }
        events
    }

    fn room(name: &str) -> RoomName {
        RoomName::parse(name).expect("valid room name")
    }

    #[tokio::test]
    async fn join_then_purge_updates_membership() {
        let relay = Relay::default();
        let (a, _inbox) = connect(&relay).await;

        relay.join_room(a, "lobby").await.expect("join");
        relay.join_room(a, "games").await.expect("join");
        assert!(relay.members("lobby").await.contains(&a));

        let left = relay.purge(a).await.expect("was registered");
        assert_eq!(left, vec![room("games"), room("lobby")]);
        assert!(relay.members("lobby").await.is_empty());
        assert!(relay.members("games").await.is_empty());
        assert!(relay.rooms().await.is_empty());
        assert_eq!(relay.purge(a).await, None);
    }

    #[tokio::test]
    async fn room_joined_reaches_existing_members_and_joiner_once() {
        let relay = Relay::default();
        let (a, mut a_inbox) = connect(&relay).await;
        let (b, mut b_inbox) = connect(&relay).await;

        relay.join_room(b, "lobby").await.expect("b joins");
        drain(&mut b_inbox);

        let report = relay.join_room(a, "lobby").await.expect("a joins");
        assert_eq!(report.delivered, 2);

        let joined = ServerEvent::RoomJoined(room("lobby"));
        assert_eq!(drain(&mut a_inbox), vec![joined.clone()]);
        assert_eq!(drain(&mut b_inbox), vec![joined]);
    }

    #[tokio::test]
    async fn rejoin_keeps_membership_unchanged() {
        let relay = Relay::default();
        let (a, _inbox) = connect(&relay).await;

        relay.join_room(a, "lobby").await.expect("join");
        let before = relay.members("lobby").await;
        relay.join_room(a, "lobby").await.expect("rejoin");

        assert_eq!(relay.members("lobby").await, before);
    }

    #[tokio::test]
    async fn invalid_room_has_no_side_effects() {
        let relay = Relay::default();
        let (a, mut a_inbox) = connect(&relay).await;

        let result = relay.join_room(a, "").await;
        assert!(matches!(result, Err(RelayError::InvalidRoom(_))));
        assert!(relay.rooms().await.is_empty());
        assert!(drain(&mut a_inbox).is_empty());

        let result = relay
            .message(a, Envelope::text("hi").with_field("room", true))
            .await;
        assert!(matches!(result, Err(RelayError::InvalidRoom(_))));
        assert!(drain(&mut a_inbox).is_empty());
    }

    #[tokio::test]
    async fn any_non_empty_room_name_can_be_joined() {
        let relay = Relay::default();
        let (a, mut a_inbox) = connect(&relay).await;
        let long = "r".repeat(200);

        for name in ["   ", long.as_str(), "a\tb"] {
            relay.join_room(a, name).await.expect("join");
            assert!(relay.members(name).await.contains(&a));
            assert_eq!(
                drain(&mut a_inbox),
                vec![ServerEvent::RoomJoined(room(name))]
            );
        }
        assert_eq!(relay.rooms().await.len(), 3);
    }

    #[tokio::test]
    async fn non_member_reaches_room_members_only() {
        let relay = Relay::default();
        let (a, mut a_inbox) = connect(&relay).await;
        let (b, mut b_inbox) = connect(&relay).await;
        let (c, mut c_inbox) = connect(&relay).await;

        relay.join_room(a, "lobby").await.expect("a joins");
        relay.join_room(b, "lobby").await.expect("b joins");
        drain(&mut a_inbox);
        drain(&mut b_inbox);

        let report = relay
            .message(c, Envelope::text("hello").with_room("lobby"))
            .await
            .expect("message");
        assert_eq!(report.delivered, 2);

        let expected = ServerEvent::Message(
            Envelope::text("hello").with_room("lobby").stamped(c),
        );
        assert_eq!(drain(&mut a_inbox), vec![expected.clone()]);
        assert_eq!(drain(&mut b_inbox), vec![expected]);
        assert!(drain(&mut c_inbox).is_empty());
    }

    #[tokio::test]
    async fn unscoped_message_reaches_everyone_including_sender() {
        let relay = Relay::default();
        let (a, mut a_inbox) = connect(&relay).await;
        let (_b, mut b_inbox) = connect(&relay).await;
        let (_c, mut c_inbox) = connect(&relay).await;

        let report = relay.message(a, Envelope::text("hi all")).await.expect("message");
        assert_eq!(report.targets, 3);
        assert_eq!(report.delivered, 3);

        for inbox in [&mut a_inbox, &mut b_inbox, &mut c_inbox] {
            let events = drain(inbox);
            assert_eq!(events.len(), 1, "exactly one copy per connection");
            let ServerEvent::Message(envelope) = &events[0] else {
                panic!("expected message, got {events:?}");
            };
            assert_eq!(envelope.sender(), Some(a));
        }
    }

    #[tokio::test]
    async fn message_to_room_emptied_by_disconnect_is_a_noop() {
        let relay = Relay::default();
        let (a, _a_inbox) = connect(&relay).await;
        let (b, mut b_inbox) = connect(&relay).await;

        relay.join_room(a, "x").await.expect("join");
        relay.purge(a).await;

        let report = relay
            .message(b, Envelope::text("anyone?").with_room("x"))
            .await
            .expect("empty room is not an error");
        assert_eq!(report, FanOut::default());
        assert!(drain(&mut b_inbox).is_empty());
    }

    #[tokio::test]
    async fn closed_outbox_is_skipped_without_blocking_others() {
        let relay = Relay::default();
        let (a, a_inbox) = connect(&relay).await;
        let (b, mut b_inbox) = connect(&relay).await;
        relay.join_room(a, "lobby").await.expect("join");
        relay.join_room(b, "lobby").await.expect("join");
        drain(&mut b_inbox);
        drop(a_inbox);

        let report = relay
            .message(b, Envelope::text("still here").with_room("lobby"))
            .await
            .expect("message");

        assert_eq!(report.stale, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(drain(&mut b_inbox).len(), 1);
    }

    #[tokio::test]
    async fn events_from_unregistered_connections_are_rejected() {
        let relay = Relay::default();
        let ghost = ConnectionId::new(42);

        assert_eq!(
            relay.join_room(ghost, "lobby").await,
            Err(RelayError::StaleConnection(ghost))
        );
        assert!(relay.rooms().await.is_empty());
    }

    #[tokio::test]
    async fn leave_room_acks_the_leaver_only() {
        let relay = Relay::default();
        let (a, mut a_inbox) = connect(&relay).await;
        let (b, mut b_inbox) = connect(&relay).await;
        relay.join_room(a, "lobby").await.expect("join");
        relay.join_room(b, "lobby").await.expect("join");
        drain(&mut a_inbox);
        drain(&mut b_inbox);

        relay.leave_room(a, "lobby").await.expect("leave");

        assert_eq!(
            drain(&mut a_inbox),
            vec![ServerEvent::RoomLeft(room("lobby"))]
        );
        assert!(drain(&mut b_inbox).is_empty());
        assert_eq!(relay.members("lobby").await, BTreeSet::from([b]));
        assert_eq!(relay.rooms_of(a).await, Vec::<RoomName>::new());
    }

    #[tokio::test]
    async fn concurrent_joins_to_a_new_room_are_not_lost() {
        let relay = Arc::new(Relay::default());
        let mut ids = Vec::new();
        let mut inboxes = Vec::new();
        for _ in 0..32 {
            let (id, inbox) = connect(&relay).await;
            ids.push(id);
            inboxes.push(inbox);
        }

        let joins = ids.iter().map(|&id| {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.join_room(id, "lobby").await })
        });
        for join in joins.collect::<Vec<_>>() {
            join.await.expect("task").expect("join");
        }

        let members = relay.members("lobby").await;
        assert_eq!(members.len(), ids.len());
    }

    #[tokio::test]
    async fn shutdown_notifies_every_connection() {
        let relay = Relay::default();
        let (_a, mut a_inbox) = connect(&relay).await;
        let (_b, mut b_inbox) = connect(&relay).await;

        let report = relay.shutdown().await;
        assert_eq!(report.delivered, 2);
        assert!(matches!(
            drain(&mut a_inbox).as_slice(),
            [ServerEvent::Error { .. }]
        ));
        assert_eq!(drain(&mut b_inbox).len(), 1);
    }
}
