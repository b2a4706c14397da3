// Room Tracking
//
// In-memory record of which connections are subscribed to which rooms, kept
// as two indices (room -> connections, connection -> rooms) that always
// agree. Group rooms and direct pairings share one key space through
// `RoomKey`. A room with no subscribers is dropped entirely.

use parley_core::{ConnectionId, RoomKey, UserId};
use std::collections::{BTreeMap, HashMap, HashSet};

/// One distinct user subscribed to a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMember {
    pub user_id: UserId,

    /// How many of the user's connections are subscribed
    pub connections: usize,
}

/// Membership of a room at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room: RoomKey,

    /// Distinct users, sorted by user id
    pub members: Vec<RoomMember>,
}

impl RoomSnapshot {
    pub fn user_ids(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.user_id.as_str()).collect()
    }

    pub fn contains_user(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m.user_id == user_id)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RoomTracker {
    /// room -> (connection -> user bound to it)
    subscribers: HashMap<RoomKey, HashMap<ConnectionId, UserId>>,

    /// connection -> rooms
    by_connection: HashMap<ConnectionId, HashSet<RoomKey>>,
}

impl RoomTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection. Joining twice is a no-op.
    pub fn join(&mut self, room: &RoomKey, connection_id: &str, user_id: &str) -> RoomSnapshot {
        self.subscribers
            .entry(room.clone())
            .or_default()
            .insert(connection_id.to_string(), user_id.to_string());
        self.by_connection
            .entry(connection_id.to_string())
            .or_default()
            .insert(room.clone());
        self.snapshot(room)
    }

    /// Unsubscribe a connection. Leaving a room never joined is a no-op.
    pub fn leave(&mut self, room: &RoomKey, connection_id: &str) -> RoomSnapshot {
        self.unlink(room, connection_id);
        self.snapshot(room)
    }

    pub fn subscribers_of(&self, room: &RoomKey) -> HashSet<ConnectionId> {
        self.subscribers
            .get(room)
            .map(|subs| subs.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn rooms_of(&self, connection_id: &str) -> HashSet<RoomKey> {
        self.by_connection
            .get(connection_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, room: &RoomKey, connection_id: &str) -> bool {
        self.subscribers
            .get(room)
            .is_some_and(|subs| subs.contains_key(connection_id))
    }

    pub fn snapshot(&self, room: &RoomKey) -> RoomSnapshot {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        if let Some(subs) = self.subscribers.get(room) {
            for user_id in subs.values() {
                *counts.entry(user_id.as_str()).or_insert(0) += 1;
            }
        }

        RoomSnapshot {
            room: room.clone(),
            members: counts
                .into_iter()
                .map(|(user_id, connections)| RoomMember {
                    user_id: user_id.to_string(),
                    connections,
                })
                .collect(),
        }
    }

    /// Number of rooms with at least one subscriber
    pub fn room_count(&self) -> usize {
        self.subscribers.len()
    }

    fn unlink(&mut self, room: &RoomKey, connection_id: &str) {
        if let Some(subs) = self.subscribers.get_mut(room) {
            subs.remove(connection_id);
            if subs.is_empty() {
                self.subscribers.remove(room);
            }
        }
        if let Some(rooms) = self.by_connection.get_mut(connection_id) {
            rooms.remove(room);
            if rooms.is_empty() {
                self.by_connection.remove(connection_id);
            }
        }
    }
}
