// Relay Errors
//
// Every failure of a client action ends up here and is reported only to the
// connection that issued it.

use crate::protocol::ProtocolError;
use parley_core::{StoreError, UserId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("connection is already bound to user '{existing}' (requested '{requested}')")]
    AlreadyBound { existing: UserId, requested: UserId },

    #[error("identify before {0}")]
    NotIdentified(&'static str),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("message could not be stored: {0}")]
    Persistence(String),

    #[error("unknown room: {0}")]
    UnknownRoom(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("unknown connection: {0}")]
    UnknownConnection(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RelayError {
    /// Stable protocol error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyBound { .. } => ProtocolError::ALREADY_BOUND,
            Self::NotIdentified(_) => ProtocolError::NOT_IDENTIFIED,
            Self::InvalidPayload(_) => ProtocolError::INVALID_PAYLOAD,
            Self::Persistence(_) => ProtocolError::PERSISTENCE_ERROR,
            Self::UnknownRoom(_) => ProtocolError::UNKNOWN_ROOM,
            Self::Unauthorized(_) => ProtocolError::UNAUTHORIZED,
            Self::UnknownConnection(_) => ProtocolError::NOT_FOUND,
            Self::InvalidRequest(_) => ProtocolError::INVALID_REQUEST,
        }
    }
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<RelayError> for ProtocolError {
    fn from(err: RelayError) -> Self {
        let error = ProtocolError::new(err.code(), err.to_string());
        match err {
            RelayError::AlreadyBound {
                existing,
                requested,
            } => error.with_details(serde_json::json!({
                "existing": existing,
                "requested": requested,
            })),
            // The sender may simply resend once the store recovers
            RelayError::Persistence(_) => error.with_retryable(1000),
            _ => error,
        }
    }
}
