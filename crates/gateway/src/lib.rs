// Parley Gateway - presence tracking and message relay over WebSocket
//
// This crate tracks which users are online and which connections sit in which
// rooms, and relays persisted group and direct messages to subscribers.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod rooms;
pub mod server;

pub use auth::TokenAuth;
pub use error::RelayError;
pub use handlers::MethodHandlers;
pub use lifecycle::{
    DirectJoin, GatewayStats, OpenedSession, Outbox, SessionController, SessionState,
};
pub use presence::PresenceTracker;
pub use protocol::*;
pub use registry::{BindOutcome, ConnectionRecord, ConnectionRegistry, Departure};
pub use relay::{Delivery, Fanout, MessageRelay};
pub use rooms::{RoomMember, RoomSnapshot, RoomTracker};
pub use server::GatewayServer;
