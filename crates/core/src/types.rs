//! Domain types shared by the gateway and the store implementations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque user identifier issued by the identity provider
pub type UserId = String;

/// Group room identifier assigned at room creation
pub type RoomId = String;

/// Opaque identifier of one live transport connection
pub type ConnectionId = String;

/// Order-independent key for a two-party direct conversation.
///
/// The two participant ids are stored sorted, so `new(a, b) == new(b, a)`.
/// The string form is `low:high` with `%` and `:` percent-escaped in each id,
/// so distinct pairs never render the same.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairingKey {
    low: UserId,
    high: UserId,
}

impl PairingKey {
    pub fn new(a: &str, b: &str) -> Self {
        if a <= b {
            Self {
                low: a.to_string(),
                high: b.to_string(),
            }
        } else {
            Self {
                low: b.to_string(),
                high: a.to_string(),
            }
        }
    }

    pub fn participants(&self) -> (&str, &str) {
        (&self.low, &self.high)
    }

    pub fn includes(&self, user_id: &str) -> bool {
        self.low == user_id || self.high == user_id
    }

    /// The other participant, if `user_id` is one of the two
    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if self.low == user_id {
            Some(&self.high)
        } else if self.high == user_id {
            Some(&self.low)
        } else {
            None
        }
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, user_id: &str) -> fmt::Result {
    for c in user_id.chars() {
        match c {
            '%' => f.write_str("%25")?,
            ':' => f.write_str("%3A")?,
            c => write!(f, "{}", c)?,
        }
    }
    Ok(())
}

impl fmt::Display for PairingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_escaped(f, &self.low)?;
        f.write_str(":")?;
        write_escaped(f, &self.high)
    }
}

/// A room that connections can subscribe to.
///
/// Group ids and pairing keys live in separate variants so a group named
/// `"a-b"` can never alias the direct conversation between `a` and `b`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoomKey {
    Group(RoomId),
    Direct(PairingKey),
}

impl RoomKey {
    pub fn group(room_id: impl Into<RoomId>) -> Self {
        Self::Group(room_id.into())
    }

    pub fn direct(a: &str, b: &str) -> Self {
        Self::Direct(PairingKey::new(a, b))
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct(_))
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group(id) => write!(f, "group:{}", id),
            Self::Direct(key) => write!(f, "direct:{}", key),
        }
    }
}

/// Message content: text, an attachment reference, or both
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Reference (URL or path) to an already uploaded file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            attachment: None,
        }
    }

    pub fn with_attachment(mut self, attachment: impl Into<String>) -> Self {
        self.attachment = Some(attachment.into());
        self
    }

    /// Trim both fields and drop the ones that end up empty
    pub fn normalized(self) -> Self {
        let clean = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            text: clean(self.text),
            attachment: clean(self.attachment),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.attachment.is_none()
    }
}

/// A message as recorded by the persistence store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,

    /// Store-assigned insertion order
    pub seq: i64,

    /// Set for group messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,

    pub sender_id: UserId,

    /// Set for direct messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,

    #[serde(flatten)]
    pub body: MessageBody,

    #[serde(default)]
    pub is_read: bool,

    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    /// The room this message belongs to
    pub fn room_key(&self) -> Option<RoomKey> {
        match (&self.room_id, &self.receiver_id) {
            (Some(room_id), _) => Some(RoomKey::Group(room_id.clone())),
            (None, Some(receiver)) => Some(RoomKey::direct(&self.sender_id, receiver)),
            (None, None) => None,
        }
    }
}

/// Minimal sender metadata shown next to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl DisplayInfo {
    /// Used when the directory has no entry or cannot be reached
    pub fn fallback(user_id: &str) -> Self {
        Self {
            name: user_id.to_string(),
            avatar: None,
        }
    }
}

/// A stored message plus its sender's display info
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedMessage {
    #[serde(flatten)]
    pub message: StoredMessage,

    pub sender: DisplayInfo,
}

/// Resolved identity of a credential holder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub role: String,
}
