//! Parley Error Types
//!
//! This module defines a layered error hierarchy:
//! - `DomainError`: Business logic errors (config, store, gateway)
//! - `InfraError`: Infrastructure errors (IO, database, serialization)
//! - `ParleyError`: Top-level error that wraps both categories
//!
//! `StoreError` is the narrower error returned by the collaborator traits in
//! [`crate::ports`]; the relay maps it onto its own persistence failure.

use std::fmt;
use thiserror::Error;

/// Domain-level errors representing business logic failures
#[derive(Debug)]
pub enum DomainError {
    /// Configuration file not found at the specified path
    ConfigNotFound { path: String },
    /// Configuration validation failed
    ConfigInvalid { field: String, reason: String },
    /// Configuration parsing failed
    ConfigParse { source: String },
    /// Store operation failed
    Store { operation: String, reason: String },
    /// Gateway could not start or serve
    Gateway { reason: String },
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigNotFound { path } => write!(f, "Config not found: {}", path),
            Self::ConfigInvalid { field, reason } => {
                write!(f, "Config invalid [{}]: {}", field, reason)
            }
            Self::ConfigParse { source } => write!(f, "Config parse error: {}", source),
            Self::Store { operation, reason } => {
                write!(f, "Store {} failed: {}", operation, reason)
            }
            Self::Gateway { reason } => write!(f, "Gateway error: {}", reason),
        }
    }
}

impl std::error::Error for DomainError {}

/// Infrastructure-level errors representing external system failures
#[derive(Debug)]
pub enum InfraError {
    /// IO operation failed
    Io(std::io::Error),
    /// JSON serialization/deserialization failed
    Json(serde_json::Error),
    /// YAML serialization/deserialization failed
    Yaml(serde_yml::Error),
    /// Database operation failed
    Database(rusqlite::Error),
}

impl fmt::Display for InfraError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "IO error: {}", err),
            Self::Json(err) => write!(f, "JSON error: {}", err),
            Self::Yaml(err) => write!(f, "YAML error: {}", err),
            Self::Database(err) => write!(f, "Database error: {}", err),
        }
    }
}

impl std::error::Error for InfraError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Yaml(e) => Some(e),
            Self::Database(e) => Some(e),
        }
    }
}

/// Top-level error type for Parley
#[derive(Debug)]
pub enum ParleyError {
    /// Business logic error
    Domain(DomainError),
    /// Infrastructure/external system error
    Infra(InfraError),
    /// Generic error for edge cases
    Other(String),
}

impl fmt::Display for ParleyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(e) => write!(f, "{}", e),
            Self::Infra(e) => write!(f, "{}", e),
            Self::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for ParleyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Domain(e) => Some(e),
            Self::Infra(e) => Some(e),
            Self::Other(_) => None,
        }
    }
}

impl From<DomainError> for ParleyError {
    fn from(err: DomainError) -> Self {
        Self::Domain(err)
    }
}

impl From<InfraError> for ParleyError {
    fn from(err: InfraError) -> Self {
        Self::Infra(err)
    }
}

impl From<std::io::Error> for ParleyError {
    fn from(err: std::io::Error) -> Self {
        Self::Infra(InfraError::Io(err))
    }
}

impl From<serde_json::Error> for ParleyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Infra(InfraError::Json(err))
    }
}

impl From<serde_yml::Error> for ParleyError {
    fn from(err: serde_yml::Error) -> Self {
        Self::Infra(InfraError::Yaml(err))
    }
}

impl From<rusqlite::Error> for ParleyError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Infra(InfraError::Database(err))
    }
}

impl From<StoreError> for ParleyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(e) => Self::Infra(InfraError::Database(e)),
            other => Self::Domain(DomainError::Store {
                operation: "request".to_string(),
                reason: other.to_string(),
            }),
        }
    }
}

impl From<anyhow::Error> for ParleyError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(format!("{:#}", err))
    }
}

impl ParleyError {
    pub fn config_not_found(path: impl Into<String>) -> Self {
        Self::Domain(DomainError::ConfigNotFound { path: path.into() })
    }

    pub fn config_parse_error(source: impl Into<String>) -> Self {
        Self::Domain(DomainError::ConfigParse {
            source: source.into(),
        })
    }

    pub fn config_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Domain(DomainError::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        })
    }
}

/// Errors surfaced by the persistence, directory and roster collaborators
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid record: {0}")]
    Invalid(String),
}
