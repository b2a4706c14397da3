// Message Relay
//
// Validates, persists, enriches and fans out chat messages. A message is
// delivered only after the store has accepted it, and messages to one room
// are persisted and delivered under a per-room lock so every subscriber sees
// them in the same order as the store's sequence.

use crate::error::RelayError;
use crate::protocol::GatewayEvent;
use async_trait::async_trait;
use parley_core::{
    Collaborators, DisplayInfo, EnrichedMessage, MessageBody, RelayConfig, RoomKey, StoredMessage,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Pushes an event to the connections subscribed to a room
#[async_trait]
pub trait Fanout: Send + Sync {
    /// Returns how many connections the event was queued for
    async fn deliver(&self, room: &RoomKey, event: GatewayEvent) -> usize;
}

/// A persisted message and how far it reached
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: EnrichedMessage,
    pub recipients: usize,
}

pub struct MessageRelay {
    collaborators: Collaborators,
    max_message_len: usize,
    history_limit: usize,
    room_locks: Mutex<HashMap<RoomKey, Weak<Mutex<()>>>>,
}

impl MessageRelay {
    pub fn new(collaborators: Collaborators, config: &RelayConfig) -> Self {
        Self {
            collaborators,
            max_message_len: config.max_message_len,
            history_limit: config.history_limit,
            room_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    /// Normalize a body and reject it if empty or oversized
    pub fn validate(&self, body: MessageBody) -> Result<MessageBody, RelayError> {
        let body = body.normalized();
        if body.is_empty() {
            return Err(RelayError::InvalidPayload(
                "message has neither text nor attachment".to_string(),
            ));
        }
        if let Some(text) = &body.text {
            if text.chars().count() > self.max_message_len {
                return Err(RelayError::InvalidPayload(format!(
                    "message exceeds {} characters",
                    self.max_message_len
                )));
            }
        }
        Ok(body)
    }

    /// Persist a group message, then deliver it to the room's subscribers
    pub async fn send_to_room(
        &self,
        room_id: &str,
        sender_id: &str,
        body: MessageBody,
        fanout: &dyn Fanout,
    ) -> Result<Delivery, RelayError> {
        let body = self.validate(body)?;
        let room = RoomKey::group(room_id);

        let lock = self.room_lock(&room).await;
        let _guard = lock.lock().await;

        let stored = self
            .collaborators
            .store
            .persist_group_message(room_id, sender_id, &body)
            .await
            .map_err(|e| {
                warn!("Failed to persist message from {} to {}: {}", sender_id, room, e);
                RelayError::from(e)
            })?;

        let message = self.enrich(stored).await;
        let recipients = fanout
            .deliver(&room, GatewayEvent::GroupMessage(message.clone()))
            .await;
        debug!(
            "Relayed {} (seq {}) to {} connection(s) in {}",
            message.message.id, message.message.seq, recipients, room
        );

        Ok(Delivery {
            message,
            recipients,
        })
    }

    /// Persist a direct message, then deliver it to the pairing's subscribers.
    /// The receiver does not need to be online or subscribed.
    pub async fn send_direct(
        &self,
        sender_id: &str,
        receiver_id: &str,
        body: MessageBody,
        fanout: &dyn Fanout,
    ) -> Result<Delivery, RelayError> {
        if receiver_id.trim().is_empty() {
            return Err(RelayError::InvalidRequest(
                "direct message needs a receiver".to_string(),
            ));
        }
        if sender_id == receiver_id {
            return Err(RelayError::InvalidPayload(
                "cannot send a direct message to yourself".to_string(),
            ));
        }
        let body = self.validate(body)?;
        let room = RoomKey::direct(sender_id, receiver_id);

        let lock = self.room_lock(&room).await;
        let _guard = lock.lock().await;

        let stored = self
            .collaborators
            .store
            .persist_direct_message(sender_id, receiver_id, &body)
            .await
            .map_err(|e| {
                warn!("Failed to persist message in {}: {}", room, e);
                RelayError::from(e)
            })?;

        let message = self.enrich(stored).await;
        let recipients = fanout
            .deliver(&room, GatewayEvent::DirectMessage(message.clone()))
            .await;
        debug!(
            "Relayed {} (seq {}) to {} connection(s) in {}",
            message.message.id, message.message.seq, recipients, room
        );

        Ok(Delivery {
            message,
            recipients,
        })
    }

    /// The most recent messages of a room, oldest first.
    /// `limit` is capped by the configured history limit.
    pub async fn history(
        &self,
        room: &RoomKey,
        limit: Option<usize>,
    ) -> Result<Vec<EnrichedMessage>, RelayError> {
        let limit = limit
            .unwrap_or(self.history_limit)
            .min(self.history_limit);
        let messages = self.collaborators.store.fetch_history(room).await?;
        let skip = messages.len().saturating_sub(limit);

        let mut senders: HashMap<String, DisplayInfo> = HashMap::new();
        let mut enriched = Vec::with_capacity(messages.len() - skip);
        for message in messages.into_iter().skip(skip) {
            let sender = match senders.get(&message.sender_id) {
                Some(info) => info.clone(),
                None => {
                    let info = self.display_info(&message.sender_id).await;
                    senders.insert(message.sender_id.clone(), info.clone());
                    info
                }
            };
            enriched.push(EnrichedMessage { message, sender });
        }
        Ok(enriched)
    }

    /// Mark everything `peer_id` sent to `reader_id` as read
    pub async fn mark_read(&self, reader_id: &str, peer_id: &str) -> Result<usize, RelayError> {
        Ok(self.collaborators.store.mark_read(reader_id, peer_id).await?)
    }

    /// Display info for a user; a directory miss or failure falls back to the id
    pub async fn display_info(&self, user_id: &str) -> DisplayInfo {
        match self.collaborators.directory.display_info(user_id).await {
            Ok(Some(info)) => info,
            Ok(None) => DisplayInfo::fallback(user_id),
            Err(e) => {
                warn!("Directory lookup for {} failed: {}", user_id, e);
                DisplayInfo::fallback(user_id)
            }
        }
    }

    async fn enrich(&self, message: StoredMessage) -> EnrichedMessage {
        let sender = self.display_info(&message.sender_id).await;
        EnrichedMessage { message, sender }
    }

    async fn room_lock(&self, room: &RoomKey) -> Arc<Mutex<()>> {
        let mut locks = self.room_locks.lock().await;

        if locks.len() > 128 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(room).and_then(Weak::upgrade) {
            return existing;
        }

        let lock = Arc::new(Mutex::new(()));
        locks.insert(room.clone(), Arc::downgrade(&lock));
        lock
    }
}
