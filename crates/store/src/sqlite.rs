// SQLite store
//
// Durable implementation of the collaborator traits on a single rusqlite
// connection. Every call hops onto the blocking pool so the async relay is
// never stalled by disk I/O.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::{
    DisplayInfo, MessageBody, MessageStore, RoomKey, RoomRoster, StoreError, StoredMessage,
    UserDirectory,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    avatar      TEXT
);

CREATE TABLE IF NOT EXISTS rooms (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    created_by  TEXT,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS room_members (
    room_id     TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    PRIMARY KEY (room_id, user_id)
);

CREATE TABLE IF NOT EXISTS messages (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    room_id     TEXT,
    sender_id   TEXT NOT NULL,
    receiver_id TEXT,
    text        TEXT,
    attachment  TEXT,
    is_read     INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_room ON messages (room_id, seq);
CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages (sender_id, receiver_id, seq);
"#;

const MESSAGE_COLUMNS: &str =
    "seq, id, room_id, sender_id, receiver_id, text, attachment, is_read, created_at";

struct MessageRow {
    seq: i64,
    id: String,
    room_id: Option<String>,
    sender_id: String,
    receiver_id: Option<String>,
    text: Option<String>,
    attachment: Option<String>,
    is_read: bool,
    created_at: String,
}

impl MessageRow {
    fn map(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            room_id: row.get(2)?,
            sender_id: row.get(3)?,
            receiver_id: row.get(4)?,
            text: row.get(5)?,
            attachment: row.get(6)?,
            is_read: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_message(self) -> Result<StoredMessage, StoreError> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| StoreError::Invalid(format!("message {}: {}", self.id, e)))?
            .with_timezone(&Utc);
        Ok(StoredMessage {
            id: self.id,
            seq: self.seq,
            room_id: self.room_id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            body: MessageBody {
                text: self.text,
                attachment: self.attachment,
            },
            is_read: self.is_read,
            created_at,
        })
    }
}

/// SQLite-backed message store, user directory and room roster
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (and migrate) the database at `path`, creating parent directories
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("{}: {}", parent.display(), e)))?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!("Opened message store at {}", path.display());
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
    }

    /// Add or replace a directory entry
    pub async fn add_user(
        &self,
        user_id: &str,
        name: &str,
        avatar: Option<&str>,
    ) -> Result<(), StoreError> {
        let (user_id, name) = (user_id.to_string(), name.to_string());
        let avatar = avatar.map(ToString::to_string);
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO users (id, name, avatar) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, avatar = excluded.avatar",
                params![user_id, name, avatar],
            )?;
            Ok(())
        })
        .await
    }

    /// Create a room; the creator (if any) becomes its first member
    pub async fn add_room(
        &self,
        room_id: &str,
        name: &str,
        created_by: Option<&str>,
    ) -> Result<(), StoreError> {
        let (room_id, name) = (room_id.to_string(), name.to_string());
        let created_by = created_by.map(ToString::to_string);
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO rooms (id, name, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![room_id, name, created_by, Utc::now().to_rfc3339()],
            )?;
            if let Some(creator) = created_by {
                conn.execute(
                    "INSERT OR IGNORE INTO room_members (room_id, user_id) VALUES (?1, ?2)",
                    params![room_id, creator],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn add_member(&self, room_id: &str, user_id: &str) -> Result<(), StoreError> {
        let (room_id, user_id) = (room_id.to_string(), user_id.to_string());
        self.call(move |conn| {
            let exists: Option<String> = conn
                .query_row(
                    "SELECT id FROM rooms WHERE id = ?1",
                    params![room_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("room {}", room_id)));
            }
            conn.execute(
                "INSERT OR IGNORE INTO room_members (room_id, user_id) VALUES (?1, ?2)",
                params![room_id, user_id],
            )?;
            Ok(())
        })
        .await
    }

    fn insert_message(
        conn: &Connection,
        room_id: Option<String>,
        sender_id: String,
        receiver_id: Option<String>,
        body: MessageBody,
    ) -> Result<StoredMessage, StoreError> {
        let id = format!("msg_{}", Uuid::new_v4());
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO messages (id, room_id, sender_id, receiver_id, text, attachment, is_read, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![
                id,
                room_id,
                sender_id,
                receiver_id,
                body.text,
                body.attachment,
                created_at.to_rfc3339()
            ],
        )?;
        Ok(StoredMessage {
            id,
            seq: conn.last_insert_rowid(),
            room_id,
            sender_id,
            receiver_id,
            body,
            is_read: false,
            created_at,
        })
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn persist_group_message(
        &self,
        room_id: &str,
        sender_id: &str,
        body: &MessageBody,
    ) -> Result<StoredMessage, StoreError> {
        let (room_id, sender_id, body) = (room_id.to_string(), sender_id.to_string(), body.clone());
        self.call(move |conn| Self::insert_message(conn, Some(room_id), sender_id, None, body))
            .await
    }

    async fn persist_direct_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        body: &MessageBody,
    ) -> Result<StoredMessage, StoreError> {
        let (sender_id, receiver_id, body) =
            (sender_id.to_string(), receiver_id.to_string(), body.clone());
        self.call(move |conn| Self::insert_message(conn, None, sender_id, Some(receiver_id), body))
            .await
    }

    async fn fetch_history(&self, room: &RoomKey) -> Result<Vec<StoredMessage>, StoreError> {
        let room = room.clone();
        self.call(move |conn| {
            let rows = match &room {
                RoomKey::Group(room_id) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM messages WHERE room_id = ?1 ORDER BY seq ASC",
                        MESSAGE_COLUMNS
                    ))?;
                    let rows = stmt
                        .query_map(params![room_id], MessageRow::map)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                RoomKey::Direct(key) => {
                    let (a, b) = key.participants();
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM messages
                         WHERE room_id IS NULL
                           AND ((sender_id = ?1 AND receiver_id = ?2)
                             OR (sender_id = ?2 AND receiver_id = ?1))
                         ORDER BY seq ASC",
                        MESSAGE_COLUMNS
                    ))?;
                    let rows = stmt
                        .query_map(params![a, b], MessageRow::map)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
            };
            rows.into_iter().map(MessageRow::into_message).collect()
        })
        .await
    }

    async fn mark_read(&self, reader_id: &str, peer_id: &str) -> Result<usize, StoreError> {
        let (reader_id, peer_id) = (reader_id.to_string(), peer_id.to_string());
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_read = 1
                 WHERE room_id IS NULL AND sender_id = ?1 AND receiver_id = ?2 AND is_read = 0",
                params![peer_id, reader_id],
            )?;
            Ok(changed)
        })
        .await
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    async fn display_info(&self, user_id: &str) -> Result<Option<DisplayInfo>, StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let info = conn
                .query_row(
                    "SELECT name, avatar FROM users WHERE id = ?1",
                    params![user_id],
                    |row| {
                        Ok(DisplayInfo {
                            name: row.get(0)?,
                            avatar: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(info)
        })
        .await
    }
}

#[async_trait]
impl RoomRoster for SqliteStore {
    async fn room_exists(&self, room_id: &str) -> Result<bool, StoreError> {
        let room_id = room_id.to_string();
        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM rooms WHERE id = ?1",
                params![room_id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    async fn is_member(&self, room_id: &str, user_id: &str) -> Result<bool, StoreError> {
        let (room_id, user_id) = (room_id.to_string(), user_id.to_string());
        self.call(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM room_members WHERE room_id = ?1 AND user_id = ?2",
                params![room_id, user_id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }
}
