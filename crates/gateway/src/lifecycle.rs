// Session Lifecycle
//
// The session controller owns the registry, presence and room trackers and
// every connection's outbox behind a single lock. Presence and room events
// are queued while that lock is held, so every connection observes state
// changes in the order they were applied. Store and directory calls are
// never made under the lock.

use crate::error::RelayError;
use crate::presence::PresenceTracker;
use crate::protocol::{
    GatewayEvent, GlobalPresenceEvent, MemberEntry, PeerPresenceEvent, RoomPresenceEvent,
};
use crate::registry::{BindOutcome, ConnectionRegistry};
use crate::relay::{Delivery, Fanout, MessageRelay};
use crate::rooms::{RoomSnapshot, RoomTracker};
use async_trait::async_trait;
use parley_core::{
    Collaborators, ConnectionId, DisplayInfo, EnrichedMessage, Identity, MessageBody, PairingKey,
    RelayConfig, RoomKey, UserId,
};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Per-connection event queue drained by the transport task. Bounded, so a
/// peer that stops reading loses events instead of growing memory.
pub type Outbox = mpsc::Sender<GatewayEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Identified(UserId),
    Closed,
}

/// Returned when a transport connection opens
#[derive(Debug, Clone)]
pub struct OpenedSession {
    pub connection_id: ConnectionId,
    pub online_user_ids: Vec<UserId>,
    pub state_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectJoin {
    pub pairing_key: PairingKey,
    pub peer_online: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub connections: usize,
    pub online_users: usize,
    pub active_rooms: usize,
    pub state_version: u64,
    pub uptime_ms: u64,
}

#[derive(Default)]
struct RelayState {
    registry: ConnectionRegistry,
    presence: PresenceTracker,
    rooms: RoomTracker,
    outboxes: HashMap<ConnectionId, Outbox>,

    /// Display info of online users, fetched at identify time
    profiles: HashMap<UserId, DisplayInfo>,
}

impl RelayState {
    fn identified(&self, connection_id: &str, action: &'static str) -> Result<UserId, RelayError> {
        let record = self
            .registry
            .get(connection_id)
            .ok_or_else(|| RelayError::UnknownConnection(connection_id.to_string()))?;
        record
            .user_id
            .clone()
            .ok_or(RelayError::NotIdentified(action))
    }

    /// Queue an event for one connection without waiting. A closed outbox is
    /// not an error: the connection is on its way out and `close` will clean
    /// it up. A full outbox drops the event.
    fn push(&self, connection_id: &str, event: GatewayEvent) -> bool {
        let Some(outbox) = self.outboxes.get(connection_id) else {
            return false;
        };
        match outbox.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    "Outbox for {} is full, dropping {} event",
                    connection_id,
                    event.name()
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Outbox for {} is closed, dropping event", connection_id);
                false
            }
        }
    }

    fn broadcast(&self, event: &GatewayEvent) -> usize {
        self.outboxes
            .keys()
            .filter(|id| self.push(id, event.clone()))
            .count()
    }

    fn push_room(&self, room: &RoomKey, event: &GatewayEvent, except: Option<&str>) -> usize {
        self.rooms
            .subscribers_of(room)
            .iter()
            .filter(|id| Some(id.as_str()) != except)
            .filter(|id| self.push(id, event.clone()))
            .count()
    }

    fn global_presence(&self) -> GatewayEvent {
        GatewayEvent::GlobalPresence(GlobalPresenceEvent {
            online_user_ids: self.presence.snapshot_online_users().into_iter().collect(),
            state_version: self.presence.state_version(),
        })
    }

    fn room_presence(&self, room_id: &str, snapshot: &RoomSnapshot) -> GatewayEvent {
        let members = snapshot
            .members
            .iter()
            .map(|member| MemberEntry {
                user_id: member.user_id.clone(),
                display: self
                    .profiles
                    .get(&member.user_id)
                    .cloned()
                    .unwrap_or_else(|| DisplayInfo::fallback(&member.user_id)),
                connections: member.connections,
            })
            .collect();

        GatewayEvent::RoomPresence(RoomPresenceEvent {
            room_id: room_id.to_string(),
            members,
        })
    }

    fn peer_presence(key: &PairingKey, user_id: &str, snapshot: &RoomSnapshot) -> GatewayEvent {
        GatewayEvent::PeerPresence(PeerPresenceEvent {
            pairing_key: key.to_string(),
            user_id: user_id.to_string(),
            is_online: snapshot.contains_user(user_id),
        })
    }
}

pub struct SessionController {
    state: Mutex<RelayState>,
    relay: MessageRelay,
    started_at: Instant,
}

impl SessionController {
    pub fn new(collaborators: Collaborators, config: &RelayConfig) -> Self {
        Self {
            state: Mutex::new(RelayState::default()),
            relay: MessageRelay::new(collaborators, config),
            started_at: Instant::now(),
        }
    }

    pub fn relay(&self) -> &MessageRelay {
        &self.relay
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Register a new anonymous connection and attach its outbox
    pub async fn open(&self, outbox: Outbox) -> OpenedSession {
        let mut state = self.state.lock().await;
        let connection_id = state.registry.register();
        state.outboxes.insert(connection_id.clone(), outbox);
        debug!("Connection {} opened", connection_id);

        OpenedSession {
            connection_id,
            online_user_ids: state.presence.snapshot_online_users().into_iter().collect(),
            state_version: state.presence.state_version(),
        }
    }

    pub async fn session_state(&self, connection_id: &str) -> SessionState {
        let state = self.state.lock().await;
        match state.registry.get(connection_id) {
            None => SessionState::Closed,
            Some(record) => match &record.user_id {
                Some(user_id) => SessionState::Identified(user_id.clone()),
                None => SessionState::Anonymous,
            },
        }
    }

    /// Bind an already resolved identity to the connection
    pub async fn identify(
        &self,
        connection_id: &str,
        identity: &Identity,
    ) -> Result<BindOutcome, RelayError> {
        let display = self.relay.display_info(&identity.user_id).await;

        let mut state = self.state.lock().await;
        let outcome = state.registry.bind_user(connection_id, &identity.user_id)?;
        if outcome == BindOutcome::Bound {
            let user_id = &identity.user_id;
            state.profiles.insert(user_id.clone(), display);
            if state.presence.add_connection(user_id) {
                info!("User {} is online", user_id);
                let event = state.global_presence();
                state.broadcast(&event);
            }
            debug!("Connection {} identified as {}", connection_id, user_id);
        }
        Ok(outcome)
    }

    pub async fn join_room(
        &self,
        connection_id: &str,
        room_id: &str,
    ) -> Result<RoomSnapshot, RelayError> {
        let user_id = self
            .state
            .lock()
            .await
            .identified(connection_id, "joining a room")?;
        self.authorize_group(room_id, &user_id).await?;

        let mut state = self.state.lock().await;
        // The connection may have closed while the roster was consulted
        if !state.registry.contains(connection_id) {
            return Err(RelayError::UnknownConnection(connection_id.to_string()));
        }

        let room = RoomKey::group(room_id);
        let snapshot = state.rooms.join(&room, connection_id, &user_id);
        state.registry.note_joined(connection_id, &room);

        let event = state.room_presence(room_id, &snapshot);
        state.push_room(&room, &event, None);
        debug!("{} joined {}", user_id, room);
        Ok(snapshot)
    }

    /// Leaving a room the connection never joined is a no-op
    pub async fn leave_room(
        &self,
        connection_id: &str,
        room_id: &str,
    ) -> Result<RoomSnapshot, RelayError> {
        let mut state = self.state.lock().await;
        if !state.registry.contains(connection_id) {
            return Err(RelayError::UnknownConnection(connection_id.to_string()));
        }

        let room = RoomKey::group(room_id);
        let was_subscribed = state.rooms.is_subscribed(&room, connection_id);
        let snapshot = state.rooms.leave(&room, connection_id);
        state.registry.note_left(connection_id, &room);

        if was_subscribed {
            let event = state.room_presence(room_id, &snapshot);
            state.push_room(&room, &event, None);
        }
        Ok(snapshot)
    }

    pub async fn join_direct(
        &self,
        connection_id: &str,
        peer_id: &str,
    ) -> Result<DirectJoin, RelayError> {
        let mut state = self.state.lock().await;
        let user_id = state.identified(connection_id, "joining a direct conversation")?;
        if peer_id.trim().is_empty() || peer_id == user_id {
            return Err(RelayError::InvalidRequest(format!(
                "invalid peer '{}'",
                peer_id
            )));
        }

        let key = PairingKey::new(&user_id, peer_id);
        let room = RoomKey::Direct(key.clone());
        let snapshot = state.rooms.join(&room, connection_id, &user_id);
        state.registry.note_joined(connection_id, &room);

        let event = RelayState::peer_presence(&key, &user_id, &snapshot);
        state.push_room(&room, &event, Some(connection_id));

        Ok(DirectJoin {
            peer_online: state.presence.is_online(peer_id),
            pairing_key: key,
        })
    }

    pub async fn leave_direct(
        &self,
        connection_id: &str,
        peer_id: &str,
    ) -> Result<PairingKey, RelayError> {
        let mut state = self.state.lock().await;
        let user_id = state.identified(connection_id, "leaving a direct conversation")?;

        let key = PairingKey::new(&user_id, peer_id);
        let room = RoomKey::Direct(key.clone());
        let was_subscribed = state.rooms.is_subscribed(&room, connection_id);
        let snapshot = state.rooms.leave(&room, connection_id);
        state.registry.note_left(connection_id, &room);

        if was_subscribed {
            let event = RelayState::peer_presence(&key, &user_id, &snapshot);
            state.push_room(&room, &event, None);
        }
        Ok(key)
    }

    pub async fn send_group(
        &self,
        connection_id: &str,
        room_id: &str,
        body: MessageBody,
    ) -> Result<Delivery, RelayError> {
        let user_id = self
            .state
            .lock()
            .await
            .identified(connection_id, "sending a message")?;
        self.authorize_group(room_id, &user_id).await?;
        self.relay.send_to_room(room_id, &user_id, body, self).await
    }

    pub async fn send_direct(
        &self,
        connection_id: &str,
        peer_id: &str,
        body: MessageBody,
    ) -> Result<Delivery, RelayError> {
        let user_id = self
            .state
            .lock()
            .await
            .identified(connection_id, "sending a message")?;
        self.relay.send_direct(&user_id, peer_id, body, self).await
    }

    pub async fn group_history(
        &self,
        connection_id: &str,
        room_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<EnrichedMessage>, RelayError> {
        let user_id = self
            .state
            .lock()
            .await
            .identified(connection_id, "reading history")?;
        self.authorize_group(room_id, &user_id).await?;
        self.relay.history(&RoomKey::group(room_id), limit).await
    }

    pub async fn direct_history(
        &self,
        connection_id: &str,
        peer_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<EnrichedMessage>, RelayError> {
        let user_id = self
            .state
            .lock()
            .await
            .identified(connection_id, "reading history")?;
        self.relay
            .history(&RoomKey::direct(&user_id, peer_id), limit)
            .await
    }

    pub async fn mark_read(&self, connection_id: &str, peer_id: &str) -> Result<usize, RelayError> {
        let user_id = self
            .state
            .lock()
            .await
            .identified(connection_id, "marking messages read")?;
        self.relay.mark_read(&user_id, peer_id).await
    }

    /// Tear down a connection: unsubscribe it everywhere, tell the rooms it
    /// was in, then drop its presence. Safe to call more than once.
    pub async fn close(&self, connection_id: &str) {
        let mut state = self.state.lock().await;
        let Some(departure) = state.registry.unregister(connection_id) else {
            return;
        };
        state.outboxes.remove(connection_id);

        let mut rooms: Vec<&RoomKey> = departure.rooms.iter().collect();
        rooms.sort();
        for room in rooms {
            let snapshot = state.rooms.leave(room, connection_id);
            let event = match (room, &departure.user_id) {
                (RoomKey::Group(room_id), _) => state.room_presence(room_id, &snapshot),
                (RoomKey::Direct(key), Some(user_id)) => {
                    RelayState::peer_presence(key, user_id, &snapshot)
                }
                (RoomKey::Direct(_), None) => continue,
            };
            state.push_room(room, &event, None);
        }

        if let Some(user_id) = &departure.user_id {
            if state.presence.remove_connection(user_id) {
                state.profiles.remove(user_id);
                info!("User {} is offline", user_id);
                let event = state.global_presence();
                state.broadcast(&event);
            }
        }

        debug!(
            "Connection {} closed, left {} room(s)",
            connection_id,
            departure.rooms.len()
        );
    }

    /// Queue an event for every open connection
    pub async fn broadcast(&self, event: GatewayEvent) -> usize {
        self.state.lock().await.broadcast(&event)
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        let state = self.state.lock().await;
        state.presence.snapshot_online_users().into_iter().collect()
    }

    pub async fn room_snapshot(&self, room: &RoomKey) -> RoomSnapshot {
        self.state.lock().await.rooms.snapshot(room)
    }

    pub async fn stats(&self) -> GatewayStats {
        let state = self.state.lock().await;
        GatewayStats {
            connections: state.registry.len(),
            online_users: state.presence.online_count(),
            active_rooms: state.rooms.room_count(),
            state_version: state.presence.state_version(),
            uptime_ms: self.uptime_ms(),
        }
    }

    async fn authorize_group(&self, room_id: &str, user_id: &str) -> Result<(), RelayError> {
        let roster = &self.relay.collaborators().roster;
        if !roster.room_exists(room_id).await? {
            return Err(RelayError::UnknownRoom(room_id.to_string()));
        }
        if !roster.is_member(room_id, user_id).await? {
            return Err(RelayError::Unauthorized(format!(
                "{} is not a member of {}",
                user_id, room_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Fanout for SessionController {
    async fn deliver(&self, room: &RoomKey, event: GatewayEvent) -> usize {
        self.state.lock().await.push_room(room, &event, None)
    }
}
