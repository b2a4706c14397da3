use async_trait::async_trait;
use parley_core::{
    Collaborators, Identity, MessageBody, MessageStore, RelayConfig, RoomKey, StoreError,
    StoredMessage,
};
use parley_gateway::{GatewayEvent, RelayError, SessionController};
use parley_store::MemoryStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver};

/// Wraps the in-memory store and fails every write while `broken` is set
struct FlakyStore {
    inner: MemoryStore,
    broken: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<(), StoreError> {
        if self.broken.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("database is down".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn persist_group_message(
        &self,
        room_id: &str,
        sender_id: &str,
        body: &MessageBody,
    ) -> Result<StoredMessage, StoreError> {
        self.check()?;
        self.inner
            .persist_group_message(room_id, sender_id, body)
            .await
    }

    async fn persist_direct_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        body: &MessageBody,
    ) -> Result<StoredMessage, StoreError> {
        self.check()?;
        self.inner
            .persist_direct_message(sender_id, receiver_id, body)
            .await
    }

    async fn fetch_history(&self, room: &RoomKey) -> Result<Vec<StoredMessage>, StoreError> {
        self.inner.fetch_history(room).await
    }

    async fn mark_read(&self, reader_id: &str, peer_id: &str) -> Result<usize, StoreError> {
        self.inner.mark_read(reader_id, peer_id).await
    }
}

struct Harness {
    controller: SessionController,
    store: Arc<FlakyStore>,
}

impl Harness {
    async fn new() -> Self {
        let memory = MemoryStore::new();
        memory.add_user("u1", "Alice", Some("/avatars/alice.png")).await;
        memory.add_user("u2", "Bob", None).await;
        memory.add_room("r", "General").await;
        memory.add_member("r", "u1").await.unwrap();
        memory.add_member("r", "u2").await.unwrap();

        let store = Arc::new(FlakyStore {
            inner: memory.clone(),
            broken: AtomicBool::new(false),
        });
        let collaborators = Collaborators {
            store: store.clone(),
            directory: Arc::new(memory.clone()),
            roster: Arc::new(memory),
        };
        Self {
            controller: SessionController::new(collaborators, &RelayConfig::default()),
            store,
        }
    }

    async fn connect(&self) -> (String, Receiver<GatewayEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (self.controller.open(tx).await.connection_id, rx)
    }

    async fn connect_as(&self, user_id: &str) -> (String, Receiver<GatewayEvent>) {
        let (conn, rx) = self.connect().await;
        self.controller
            .identify(
                &conn,
                &Identity {
                    user_id: user_id.to_string(),
                    role: "user".to_string(),
                },
            )
            .await
            .unwrap();
        (conn, rx)
    }
}

fn drain(rx: &mut Receiver<GatewayEvent>) -> Vec<GatewayEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn online_sets(events: &[GatewayEvent]) -> Vec<Vec<String>> {
    events
        .iter()
        .filter_map(|event| match event {
            GatewayEvent::GlobalPresence(p) => Some(p.online_user_ids.clone()),
            _ => None,
        })
        .collect()
}

fn group_texts(events: &[GatewayEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            GatewayEvent::GroupMessage(m) => m.message.body.text.clone(),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_multi_connection_user_goes_offline_once() {
    let harness = Harness::new().await;
    let (watcher, mut watcher_rx) = harness.connect().await;

    let (c1, _rx1) = harness.connect_as("u1").await;
    let (c2, _rx2) = harness.connect_as("u1").await;
    assert_eq!(online_sets(&drain(&mut watcher_rx)), vec![vec!["u1"]]);
    assert_eq!(harness.controller.online_users().await, vec!["u1"]);

    harness.controller.close(&c1).await;
    assert!(drain(&mut watcher_rx).is_empty());
    assert_eq!(harness.controller.online_users().await, vec!["u1"]);

    harness.controller.close(&c2).await;
    assert_eq!(
        online_sets(&drain(&mut watcher_rx)),
        vec![Vec::<String>::new()]
    );

    // The anonymous watcher saw both transitions and nothing else
    harness.controller.close(&watcher).await;
    assert_eq!(harness.controller.stats().await.connections, 0);
}

#[tokio::test]
async fn test_open_snapshot_lists_online_users() {
    let harness = Harness::new().await;
    let (_c1, _rx1) = harness.connect_as("u2").await;
    let (_c2, _rx2) = harness.connect_as("u1").await;

    let (tx, _rx) = mpsc::channel(64);
    let opened = harness.controller.open(tx).await;
    assert_eq!(opened.online_user_ids, vec!["u1", "u2"]);
    assert_eq!(opened.state_version, 2);
}

#[tokio::test]
async fn test_rebind_keeps_original_identity() {
    let harness = Harness::new().await;
    let (c1, _rx) = harness.connect_as("u1").await;

    let err = harness
        .controller
        .identify(
            &c1,
            &Identity {
                user_id: "u2".to_string(),
                role: "user".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::AlreadyBound { .. }));
    assert_eq!(harness.controller.online_users().await, vec!["u1"]);
}

#[tokio::test]
async fn test_group_send_delivered_only_after_persist() {
    let harness = Harness::new().await;
    let (c1, mut rx1) = harness.connect_as("u1").await;
    let (c2, mut rx2) = harness.connect_as("u2").await;
    harness.controller.join_room(&c1, "r").await.unwrap();
    harness.controller.join_room(&c2, "r").await.unwrap();
    drain(&mut rx1);
    drain(&mut rx2);

    let delivery = harness
        .controller
        .send_group(&c1, "r", MessageBody::text("hi"))
        .await
        .unwrap();
    assert_eq!(delivery.recipients, 2);
    assert_eq!(delivery.message.sender.name, "Alice");
    assert_eq!(group_texts(&drain(&mut rx1)), vec!["hi"]);
    assert_eq!(group_texts(&drain(&mut rx2)), vec!["hi"]);

    harness.store.broken.store(true, Ordering::SeqCst);
    let err = harness
        .controller
        .send_group(&c1, "r", MessageBody::text("lost"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Persistence(_)));
    assert!(drain(&mut rx1).is_empty());
    assert!(drain(&mut rx2).is_empty());

    // Sender retries once the store is back
    harness.store.broken.store(false, Ordering::SeqCst);
    harness
        .controller
        .send_group(&c1, "r", MessageBody::text("lost"))
        .await
        .unwrap();
    assert_eq!(group_texts(&drain(&mut rx2)), vec!["lost"]);
}

#[tokio::test]
async fn test_invalid_payload_never_reaches_store() {
    let harness = Harness::new().await;
    let (c1, mut rx1) = harness.connect_as("u1").await;
    harness.controller.join_room(&c1, "r").await.unwrap();
    drain(&mut rx1);

    let err = harness
        .controller
        .send_group(&c1, "r", MessageBody::text("   "))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::InvalidPayload(_)));
    assert_eq!(harness.store.inner.message_count().await, 0);
    assert!(drain(&mut rx1).is_empty());
}

#[tokio::test]
async fn test_direct_message_to_absent_peer_is_kept() {
    let harness = Harness::new().await;
    let (u3, _rx3) = harness.connect_as("u3").await;
    let (u4, mut rx4) = harness.connect_as("u4").await;
    harness.controller.join_direct(&u3, "u4").await.unwrap();
    drain(&mut rx4);

    let delivery = harness
        .controller
        .send_direct(&u3, "u4", MessageBody::text("ping"))
        .await
        .unwrap();
    assert_eq!(delivery.recipients, 1);
    assert!(drain(&mut rx4)
        .iter()
        .all(|e| !matches!(e, GatewayEvent::DirectMessage(_))));

    let history = harness
        .controller
        .direct_history(&u4, "u3", None)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].message.body.text.as_deref(), Some("ping"));
    assert!(!history[0].message.is_read);

    assert_eq!(harness.controller.mark_read(&u4, "u3").await.unwrap(), 1);
    let history = harness
        .controller
        .direct_history(&u3, "u4", None)
        .await
        .unwrap();
    assert!(history[0].message.is_read);
}

#[tokio::test]
async fn test_both_directions_share_one_conversation() {
    let harness = Harness::new().await;
    let (a, mut rx_a) = harness.connect_as("u1").await;
    let (b, mut rx_b) = harness.connect_as("u2").await;

    let joined = harness.controller.join_direct(&a, "u2").await.unwrap();
    assert!(joined.peer_online);
    harness.controller.join_direct(&b, "u1").await.unwrap();
    drain(&mut rx_a);
    drain(&mut rx_b);

    harness
        .controller
        .send_direct(&a, "u2", MessageBody::text("a->b"))
        .await
        .unwrap();
    harness
        .controller
        .send_direct(&b, "u1", MessageBody::text("b->a"))
        .await
        .unwrap();

    for rx in [&mut rx_a, &mut rx_b] {
        let texts: Vec<_> = drain(rx)
            .into_iter()
            .filter_map(|e| match e {
                GatewayEvent::DirectMessage(m) => m.message.body.text,
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["a->b", "b->a"]);
    }
}

#[tokio::test]
async fn test_peer_presence_on_join_leave_and_disconnect() {
    let harness = Harness::new().await;
    let (a, mut rx_a) = harness.connect_as("u1").await;
    let (b, mut rx_b) = harness.connect_as("u2").await;
    harness.controller.join_direct(&a, "u2").await.unwrap();
    drain(&mut rx_a);

    harness.controller.join_direct(&b, "u1").await.unwrap();
    let events = drain(&mut rx_a);
    assert!(matches!(
        events.as_slice(),
        [GatewayEvent::PeerPresence(p)] if p.user_id == "u2" && p.is_online && p.pairing_key == "u1:u2"
    ));
    // The joiner is not told about itself
    assert!(drain(&mut rx_b)
        .iter()
        .all(|e| !matches!(e, GatewayEvent::PeerPresence(_))));

    harness.controller.close(&b).await;
    let events = drain(&mut rx_a);
    assert!(events.iter().any(
        |e| matches!(e, GatewayEvent::PeerPresence(p) if p.user_id == "u2" && !p.is_online)
    ));
    assert_eq!(online_sets(&events), vec![vec!["u1"]]);
}

#[tokio::test]
async fn test_room_presence_follows_membership() {
    let harness = Harness::new().await;
    let (c1, mut rx1) = harness.connect_as("u1").await;
    let (c2, _rx2) = harness.connect_as("u2").await;
    harness.controller.join_room(&c1, "r").await.unwrap();
    harness.controller.join_room(&c1, "r").await.unwrap();
    drain(&mut rx1);

    harness.controller.join_room(&c2, "r").await.unwrap();
    let members: Vec<_> = drain(&mut rx1)
        .into_iter()
        .filter_map(|e| match e {
            GatewayEvent::RoomPresence(p) => Some(p.members),
            _ => None,
        })
        .collect();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].len(), 2);
    assert_eq!(members[0][0].display.name, "Alice");
    assert_eq!(members[0][0].connections, 1);

    harness.controller.leave_room(&c2, "r").await.unwrap();
    harness.controller.leave_room(&c2, "r").await.unwrap();
    let events = drain(&mut rx1);
    assert_eq!(events.len(), 1);

    // Disconnect removes the connection from every room exactly once
    harness.controller.close(&c1).await;
    let snapshot = harness
        .controller
        .room_snapshot(&RoomKey::group("r"))
        .await;
    assert!(snapshot.is_empty());
    assert_eq!(harness.controller.stats().await.active_rooms, 0);
}

#[tokio::test]
async fn test_non_member_cannot_join_or_send() {
    let harness = Harness::new().await;
    let (c, mut rx) = harness.connect_as("mallory").await;
    drain(&mut rx);

    assert!(matches!(
        harness.controller.join_room(&c, "r").await,
        Err(RelayError::Unauthorized(_))
    ));
    assert!(matches!(
        harness.controller.join_room(&c, "missing").await,
        Err(RelayError::UnknownRoom(_))
    ));
    assert!(matches!(
        harness
            .controller
            .send_group(&c, "r", MessageBody::text("hi"))
            .await,
        Err(RelayError::Unauthorized(_))
    ));
    assert!(harness
        .controller
        .room_snapshot(&RoomKey::group("r"))
        .await
        .is_empty());
    assert!(drain(&mut rx).is_empty());
}
