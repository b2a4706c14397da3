// Parley WebSocket Protocol
//
// Frame types exchanged between chat clients and the relay.
//
// Protocol flow:
// 1. Client opens the socket; server immediately sends a "hello" response
//    carrying the current online-user snapshot
// 2. Client sends "identify" to bind the connection to a user
// 3. Bi-directional request/response (join, leave, send, history, ...)
// 4. Server pushes events (presence, messages, tick, shutdown)

use parley_core::{DisplayInfo, EnrichedMessage, MessageBody, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const PROTOCOL_VERSION: u32 = 1;

/// Request id used for the unsolicited hello response
pub const HELLO_ID: &str = "hello";

/// Gateway frame - top-level message type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayFrame {
    #[serde(rename = "req")]
    Request(GatewayRequest),

    #[serde(rename = "res")]
    Response(GatewayResponse),

    #[serde(rename = "event")]
    Event(GatewayEvent),
}

/// Request frame from client to gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Unique request ID
    pub id: String,

    /// Method name (e.g., "identify", "joinRoom", "sendGroupMessage")
    pub method: String,

    /// Method parameters
    #[serde(default)]
    pub params: JsonValue,

    /// Bearer credential; accepted by identify as an alternative to params.token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl GatewayRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: JsonValue) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
            signature: None,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }
}

/// Response frame from gateway to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    /// Request ID being responded to
    pub id: String,

    /// Success flag
    pub ok: bool,

    /// Response payload (if ok)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,

    /// Error details (if not ok)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProtocolError>,
}

impl GatewayResponse {
    pub fn ok(id: String, payload: JsonValue) -> Self {
        Self {
            id,
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(id: String, error: ProtocolError) -> Self {
        Self {
            id,
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Protocol error type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolError {
    /// Error code
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,

    /// Whether the request is retryable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,

    /// Retry after milliseconds (if retryable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ProtocolError {
    // Standard error codes
    pub const INVALID_REQUEST: &'static str = "INVALID_REQUEST";
    pub const UNAUTHORIZED: &'static str = "UNAUTHORIZED";
    pub const NOT_FOUND: &'static str = "NOT_FOUND";
    pub const INTERNAL_ERROR: &'static str = "INTERNAL_ERROR";

    // Relay error codes
    pub const ALREADY_BOUND: &'static str = "ALREADY_BOUND";
    pub const NOT_IDENTIFIED: &'static str = "NOT_IDENTIFIED";
    pub const INVALID_PAYLOAD: &'static str = "INVALID_PAYLOAD";
    pub const PERSISTENCE_ERROR: &'static str = "PERSISTENCE_ERROR";
    pub const UNKNOWN_ROOM: &'static str = "UNKNOWN_ROOM";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retryable(mut self, retry_after_ms: u64) -> Self {
        self.retryable = Some(true);
        self.retry_after_ms = Some(retry_after_ms);
        self
    }
}

/// Event frame from gateway to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum GatewayEvent {
    /// A user came online or went offline
    #[serde(rename = "globalPresence")]
    GlobalPresence(GlobalPresenceEvent),

    /// Membership of a group room changed
    #[serde(rename = "roomPresence")]
    RoomPresence(RoomPresenceEvent),

    /// The other party joined or left a direct conversation
    #[serde(rename = "peerPresence")]
    PeerPresence(PeerPresenceEvent),

    #[serde(rename = "groupMessage")]
    GroupMessage(EnrichedMessage),

    #[serde(rename = "directMessage")]
    DirectMessage(EnrichedMessage),

    /// Keepalive tick
    #[serde(rename = "tick")]
    Tick { ts: i64 },

    /// Gateway shutting down
    #[serde(rename = "shutdown")]
    Shutdown(ShutdownEvent),
}

impl GatewayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GlobalPresence(_) => "globalPresence",
            Self::RoomPresence(_) => "roomPresence",
            Self::PeerPresence(_) => "peerPresence",
            Self::GroupMessage(_) => "groupMessage",
            Self::DirectMessage(_) => "directMessage",
            Self::Tick { .. } => "tick",
            Self::Shutdown(_) => "shutdown",
        }
    }
}

/// Full online set, sent on every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalPresenceEvent {
    /// Sorted online user ids
    pub online_user_ids: Vec<UserId>,

    /// State version for delta tracking
    pub state_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomPresenceEvent {
    pub room_id: String,

    /// Distinct users currently subscribed, sorted by user id
    pub members: Vec<MemberEntry>,
}

/// One user present in a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEntry {
    pub user_id: UserId,

    #[serde(flatten)]
    pub display: DisplayInfo,

    /// Number of this user's connections subscribed to the room
    pub connections: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerPresenceEvent {
    /// Canonical "low-high" pairing key
    pub pairing_key: String,

    pub user_id: UserId,

    pub is_online: bool,
}

/// Shutdown event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownEvent {
    /// Shutdown reason
    pub reason: String,

    /// Expected restart time (milliseconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_expected_ms: Option<u64>,
}

/// Hello payload (sent unsolicited when the socket opens)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloOkPayload {
    /// Protocol version info
    pub protocol: ProtocolVersion,

    /// ID assigned to this connection
    pub connection_id: String,

    /// Users online right now, sorted
    pub online_user_ids: Vec<UserId>,

    /// Presence state version
    pub state_version: u64,

    /// Gateway uptime (milliseconds)
    pub uptime_ms: u64,

    /// Gateway policy
    pub policy: GatewayPolicy,
}

/// Protocol version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolVersion {
    /// Minimum supported version
    pub min: u32,

    /// Maximum supported version
    pub max: u32,
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self {
            min: PROTOCOL_VERSION,
            max: PROTOCOL_VERSION,
        }
    }
}

/// Gateway policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPolicy {
    /// Maximum payload size
    pub max_payload: usize,

    /// Maximum message length in characters
    pub max_message_len: usize,

    /// Tick interval (milliseconds)
    pub tick_interval_ms: u64,
}

// ============================================================================
// Method parameters
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentifyParams {
    #[serde(default)]
    pub token: Option<String>,

    /// Trusted only when the gateway allows unauthenticated identify
    #[serde(default)]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomParams {
    pub room_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerParams {
    pub peer_id: UserId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendGroupParams {
    pub room_id: String,

    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendDirectParams {
    pub peer_id: UserId,

    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    pub room_id: Option<String>,

    #[serde(default)]
    pub peer_id: Option<UserId>,

    #[serde(default)]
    pub limit: Option<usize>,
}
