//! External collaborators consumed by the relay core.
//!
//! The gateway never talks to a database or an auth backend directly; it goes
//! through these traits. `parley_store` provides in-memory and SQLite
//! implementations, and the gateway's token registry implements
//! [`IdentityProvider`].

use crate::error::StoreError;
use crate::types::{DisplayInfo, Identity, MessageBody, RoomKey, StoredMessage};
use async_trait::async_trait;
use std::sync::Arc;

/// Durable message history
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn persist_group_message(
        &self,
        room_id: &str,
        sender_id: &str,
        body: &MessageBody,
    ) -> Result<StoredMessage, StoreError>;

    async fn persist_direct_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        body: &MessageBody,
    ) -> Result<StoredMessage, StoreError>;

    /// All messages of a group room or pairing, oldest first
    async fn fetch_history(&self, room: &RoomKey) -> Result<Vec<StoredMessage>, StoreError>;

    /// Mark every direct message from `peer_id` to `reader_id` as read
    async fn mark_read(&self, reader_id: &str, peer_id: &str) -> Result<usize, StoreError>;
}

/// Display metadata lookup
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn display_info(&self, user_id: &str) -> Result<Option<DisplayInfo>, StoreError>;
}

/// Persisted group membership
#[async_trait]
pub trait RoomRoster: Send + Sync {
    async fn room_exists(&self, room_id: &str) -> Result<bool, StoreError>;

    async fn is_member(&self, room_id: &str, user_id: &str) -> Result<bool, StoreError>;
}

/// Resolves a bearer credential to a user
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve(&self, credential: &str) -> Option<Identity>;
}

/// The three storage-side collaborators the relay needs, as trait objects
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn MessageStore>,
    pub directory: Arc<dyn UserDirectory>,
    pub roster: Arc<dyn RoomRoster>,
}

impl Collaborators {
    /// Use one backend for all three roles
    pub fn from_backend<B>(backend: B) -> Self
    where
        B: MessageStore + UserDirectory + RoomRoster + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            store: backend.clone(),
            directory: backend.clone(),
            roster: backend,
        }
    }
}
