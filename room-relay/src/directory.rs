use std::collections::{BTreeMap, BTreeSet};

use crate::{message::RoomName, registry::ConnectionId};

/// Room name to member set.
///
/// Rooms exist only while they have members: the entry is created by the
/// first join and removed by the last leave.
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: BTreeMap<RoomName, BTreeSet<ConnectionId>>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when `id` was already a member.
    pub fn join(&mut self, room: &RoomName, id: ConnectionId) -> bool {
        self.rooms.entry(room.clone()).or_default().insert(id)
    }

    pub fn leave(&mut self, room: &str, id: ConnectionId) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };

        let removed = members.remove(&id);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }

    /// Removes `id` from every room and returns the rooms it was in.
    pub fn leave_all(&mut self, id: ConnectionId) -> Vec<RoomName> {
        let mut left = Vec::new();
        self.rooms.retain(|room, members| {
            if members.remove(&id) {
                left.push(room.clone());
            }
            !members.is_empty()
        });
        left
    }

    pub fn members(&self, room: &str) -> BTreeSet<ConnectionId> {
        self.rooms.get(room).cloned().unwrap_or_default()
    }

    pub fn contains(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    pub fn rooms(&self) -> Vec<RoomName> {
        self.rooms.keys().cloned().collect()
    }

    pub fn rooms_of(&self, id: ConnectionId) -> Vec<RoomName> {
        self.rooms
            .iter()
            .filter(|(_, members)| members.contains(&id))
            .map(|(room, _)| room.clone())
            .collect()
    }
}
