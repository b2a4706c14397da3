// In-memory store
//
// Process-local implementation of the collaborator traits. Used by the
// `memory` store backend and by the gateway's tests.

use async_trait::async_trait;
use chrono::Utc;
use parley_core::{
    DisplayInfo, MessageBody, MessageStore, RoomKey, RoomRoster, StoreError, StoredMessage,
    UserDirectory,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct RoomRecord {
    name: String,
    participants: HashSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    messages: Vec<StoredMessage>,
    next_seq: i64,
    users: HashMap<String, DisplayInfo>,
    rooms: HashMap<String, RoomRecord>,
}

/// Volatile message store, user directory and room roster
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a directory entry
    pub async fn add_user(&self, user_id: &str, name: &str, avatar: Option<&str>) {
        let mut inner = self.inner.write().await;
        inner.users.insert(
            user_id.to_string(),
            DisplayInfo {
                name: name.to_string(),
                avatar: avatar.map(ToString::to_string),
            },
        );
    }

    /// Create a room if missing; existing participants are kept
    pub async fn add_room(&self, room_id: &str, name: &str) {
        let mut inner = self.inner.write().await;
        inner
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| RoomRecord {
                name: name.to_string(),
                participants: HashSet::new(),
            });
    }

    pub async fn add_member(&self, room_id: &str, user_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let room = inner
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| StoreError::NotFound(format!("room {}", room_id)))?;
        room.participants.insert(user_id.to_string());
        Ok(())
    }

    pub async fn room_name(&self, room_id: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner.rooms.get(room_id).map(|r| r.name.clone())
    }

    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    async fn insert(
        &self,
        room_id: Option<&str>,
        sender_id: &str,
        receiver_id: Option<&str>,
        body: &MessageBody,
    ) -> StoredMessage {
        let mut inner = self.inner.write().await;
        inner.next_seq += 1;
        let message = StoredMessage {
            id: format!("msg_{}", Uuid::new_v4()),
            seq: inner.next_seq,
            room_id: room_id.map(ToString::to_string),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.map(ToString::to_string),
            body: body.clone(),
            is_read: false,
            created_at: Utc::now(),
        };
        inner.messages.push(message.clone());
        message
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn persist_group_message(
        &self,
        room_id: &str,
        sender_id: &str,
        body: &MessageBody,
    ) -> Result<StoredMessage, StoreError> {
        Ok(self.insert(Some(room_id), sender_id, None, body).await)
    }

    async fn persist_direct_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        body: &MessageBody,
    ) -> Result<StoredMessage, StoreError> {
        Ok(self.insert(None, sender_id, Some(receiver_id), body).await)
    }

    async fn fetch_history(&self, room: &RoomKey) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.inner.read().await;
        let history = inner
            .messages
            .iter()
            .filter(|m| m.room_key().as_ref() == Some(room))
            .cloned()
            .collect();
        Ok(history)
    }

    async fn mark_read(&self, reader_id: &str, peer_id: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let mut updated = 0;
        for message in inner.messages.iter_mut().filter(|m| {
            m.room_id.is_none()
                && m.sender_id == peer_id
                && m.receiver_id.as_deref() == Some(reader_id)
                && !m.is_read
        }) {
            message.is_read = true;
            updated += 1;
        }
        Ok(updated)
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn display_info(&self, user_id: &str) -> Result<Option<DisplayInfo>, StoreError> {
        Ok(self.inner.read().await.users.get(user_id).cloned())
    }
}

#[async_trait]
impl RoomRoster for MemoryStore {
    async fn room_exists(&self, room_id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.read().await.rooms.contains_key(room_id))
    }

    async fn is_member(&self, room_id: &str, user_id: &str) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .rooms
            .get(room_id)
            .map(|r| r.participants.contains(user_id))
            .unwrap_or(false))
    }
}
