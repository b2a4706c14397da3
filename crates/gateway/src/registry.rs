// Connection Registry
//
// This module tracks live transport connections and the user bound to each.
// It owns no locks: the session controller serializes access to it.

use crate::error::RelayError;
use chrono::{DateTime, Utc};
use parley_core::{ConnectionId, RoomKey, UserId};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// One live transport connection
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    /// Connection ID
    pub id: ConnectionId,

    /// Bound user (set once by identify)
    pub user_id: Option<UserId>,

    /// Rooms this connection is subscribed to
    pub rooms: HashSet<RoomKey>,

    /// Transport open timestamp
    pub connected_at: DateTime<Utc>,
}

impl ConnectionRecord {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: None,
            rooms: HashSet::new(),
            connected_at: Utc::now(),
        }
    }
}

/// What a removed connection leaves behind for cascade cleanup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub connection_id: ConnectionId,
    pub user_id: Option<UserId>,
    pub rooms: HashSet<RoomKey>,
}

/// Result of a successful bind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// First bind for this connection
    Bound,
    /// Connection was already bound to the same user
    Unchanged,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ConnectionRecord>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an anonymous connection with no subscriptions
    pub fn register(&mut self) -> ConnectionId {
        let record = ConnectionRecord::new();
        let id = record.id.clone();
        self.connections.insert(id.clone(), record);
        id
    }

    /// Bind `user_id` to the connection; a binding never changes once set
    pub fn bind_user(
        &mut self,
        connection_id: &str,
        user_id: &str,
    ) -> Result<BindOutcome, RelayError> {
        let record = self
            .connections
            .get_mut(connection_id)
            .ok_or_else(|| RelayError::UnknownConnection(connection_id.to_string()))?;

        match &record.user_id {
            Some(existing) if existing == user_id => Ok(BindOutcome::Unchanged),
            Some(existing) => Err(RelayError::AlreadyBound {
                existing: existing.clone(),
                requested: user_id.to_string(),
            }),
            None => {
                record.user_id = Some(user_id.to_string());
                Ok(BindOutcome::Bound)
            }
        }
    }

    /// Remove the connection. Unknown ids are ignored.
    pub fn unregister(&mut self, connection_id: &str) -> Option<Departure> {
        self.connections.remove(connection_id).map(|record| Departure {
            connection_id: record.id,
            user_id: record.user_id,
            rooms: record.rooms,
        })
    }

    /// Record a room subscription; false if the connection is gone
    pub fn note_joined(&mut self, connection_id: &str, room: &RoomKey) -> bool {
        match self.connections.get_mut(connection_id) {
            Some(record) => {
                record.rooms.insert(room.clone());
                true
            }
            None => false,
        }
    }

    pub fn note_left(&mut self, connection_id: &str, room: &RoomKey) {
        if let Some(record) = self.connections.get_mut(connection_id) {
            record.rooms.remove(room);
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<&ConnectionRecord> {
        self.connections.get(connection_id)
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn user_of(&self, connection_id: &str) -> Option<&str> {
        self.connections
            .get(connection_id)
            .and_then(|r| r.user_id.as_deref())
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
