//! Parley Configuration
//!
//! This module defines the configuration structures with proper defaults
//! using derive macros and serde attributes for cleaner code.

use crate::error::ParleyError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ============================================================================
// Constants
// ============================================================================

/// Default gateway host
pub const DEFAULT_GATEWAY_HOST: &str = "127.0.0.1";
/// Default gateway port
pub const DEFAULT_GATEWAY_PORT: u16 = 18790;
/// Default WebSocket path
pub const DEFAULT_WS_PATH: &str = "/ws";
/// Default maximum inbound frame size (bytes)
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;
/// Default keepalive tick interval (milliseconds)
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 30_000;
/// Default number of events queued per connection before new ones are dropped
pub const DEFAULT_OUTBOX_CAPACITY: usize = 256;
/// Default maximum message text length (characters)
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 4000;
/// Default number of messages returned by a history request
pub const DEFAULT_HISTORY_LIMIT: usize = 200;
/// Minimum bearer token length
pub const MIN_TOKEN_LENGTH: usize = 32;

// ============================================================================
// Helper functions for paths (required for serde defaults)
// ============================================================================

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_parley_dir() -> PathBuf {
    home_dir().join(".parley")
}

// ============================================================================
// Main Config
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Persistence backend configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Relay behaviour
    #[serde(default)]
    pub relay: RelayConfig,
    /// Static bearer tokens
    #[serde(default)]
    pub auth: AuthConfig,
}

// ============================================================================
// Gateway Config
// ============================================================================

/// Gateway server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway host
    #[serde(default = "GatewayConfig::default_host")]
    pub host: String,
    /// Gateway port
    #[serde(default = "GatewayConfig::default_port")]
    pub port: u16,
    /// WebSocket path
    #[serde(default = "GatewayConfig::default_ws_path")]
    pub ws_path: String,
    /// Trust `identify` requests that carry a bare user id and no token
    #[serde(default)]
    pub allow_unauthenticated: bool,
    /// Maximum inbound frame size
    #[serde(default = "GatewayConfig::default_max_payload")]
    pub max_payload: usize,
    /// Keepalive tick interval; 0 disables ticks
    #[serde(default = "GatewayConfig::default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Events buffered per connection; a full outbox drops further events
    #[serde(default = "GatewayConfig::default_outbox_capacity")]
    pub outbox_capacity: usize,
}

impl GatewayConfig {
    fn default_host() -> String {
        DEFAULT_GATEWAY_HOST.to_string()
    }
    fn default_port() -> u16 {
        DEFAULT_GATEWAY_PORT
    }
    fn default_ws_path() -> String {
        DEFAULT_WS_PATH.to_string()
    }
    fn default_max_payload() -> usize {
        DEFAULT_MAX_PAYLOAD
    }
    fn default_tick_interval_ms() -> u64 {
        DEFAULT_TICK_INTERVAL_MS
    }
    fn default_outbox_capacity() -> usize {
        DEFAULT_OUTBOX_CAPACITY
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_GATEWAY_HOST.to_string(),
            port: DEFAULT_GATEWAY_PORT,
            ws_path: DEFAULT_WS_PATH.to_string(),
            allow_unauthenticated: false,
            max_payload: DEFAULT_MAX_PAYLOAD,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

// ============================================================================
// Store Config
// ============================================================================

/// Which persistence backend to use
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local, lost on restart
    Memory,
    /// SQLite database file
    #[default]
    Sqlite,
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Database path (sqlite backend)
    #[serde(default = "StoreConfig::default_db_path")]
    pub db_path: PathBuf,
}

impl StoreConfig {
    fn default_db_path() -> PathBuf {
        default_parley_dir().join("parley.sqlite")
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            db_path: Self::default_db_path(),
        }
    }
}

// ============================================================================
// Relay Config
// ============================================================================

/// Message relay behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Maximum message text length in characters
    #[serde(default = "RelayConfig::default_max_message_len")]
    pub max_message_len: usize,
    /// Maximum messages returned by `history`
    #[serde(default = "RelayConfig::default_history_limit")]
    pub history_limit: usize,
}

impl RelayConfig {
    fn default_max_message_len() -> usize {
        DEFAULT_MAX_MESSAGE_LEN
    }
    fn default_history_limit() -> usize {
        DEFAULT_HISTORY_LIMIT
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

// ============================================================================
// Auth Config
// ============================================================================

/// Statically configured bearer tokens
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

/// One bearer token and the identity it resolves to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user_id: String,
    #[serde(default = "TokenEntry::default_role")]
    pub role: String,
}

impl TokenEntry {
    fn default_role() -> String {
        "user".to_string()
    }
}

// ============================================================================
// Config Loading and Validation
// ============================================================================

/// Configuration loader with validation
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file or default locations
    pub fn load(path: Option<&str>) -> Result<Config, ParleyError> {
        let config_path = Self::resolve_config_path(path)?;
        tracing::debug!("Loading config from {}", config_path.display());
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ParleyError::config_parse_error(format!("Failed to read: {}", e)))?;
        let config: Config = serde_yml::from_str(&content)
            .map_err(|e| ParleyError::config_parse_error(format!("Failed to parse: {}", e)))?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when no file exists
    pub fn load_or_default(path: Option<&str>) -> Result<Config, ParleyError> {
        match Self::load(path) {
            Err(ParleyError::Domain(crate::error::DomainError::ConfigNotFound { .. }))
                if path.is_none() =>
            {
                tracing::info!("No config file found, using defaults");
                Ok(Config::default())
            }
            other => other,
        }
    }

    /// Resolve configuration file path
    fn resolve_config_path(path: Option<&str>) -> Result<PathBuf, ParleyError> {
        if let Some(p) = path {
            let p = PathBuf::from(p);
            if !p.exists() {
                return Err(ParleyError::config_not_found(p.display().to_string()));
            }
            return Ok(p);
        }

        let default_paths = [
            default_parley_dir().join("config.yaml"),
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("parley.yaml"),
            PathBuf::from("./parley.yaml"),
        ];

        default_paths
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| {
                ParleyError::config_not_found(
                    "Config not found. Run `parley init` or create ~/.parley/config.yaml",
                )
            })
    }
}

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate configuration
    pub fn validate(config: &Config) -> Result<(), ParleyError> {
        if config.gateway.port == 0 {
            return Err(ParleyError::config_invalid(
                "gateway.port",
                "Port cannot be 0",
            ));
        }

        if !config.gateway.ws_path.starts_with('/') {
            return Err(ParleyError::config_invalid(
                "gateway.ws_path",
                format!("Path '{}' must start with '/'", config.gateway.ws_path),
            ));
        }

        if config.gateway.outbox_capacity == 0 {
            return Err(ParleyError::config_invalid(
                "gateway.outbox_capacity",
                "Must be greater than 0",
            ));
        }

        if config.relay.max_message_len == 0 {
            return Err(ParleyError::config_invalid(
                "relay.max_message_len",
                "Must be greater than 0",
            ));
        }

        if config.relay.history_limit == 0 {
            return Err(ParleyError::config_invalid(
                "relay.history_limit",
                "Must be greater than 0",
            ));
        }

        for (i, entry) in config.auth.tokens.iter().enumerate() {
            if entry.token.len() < MIN_TOKEN_LENGTH {
                return Err(ParleyError::config_invalid(
                    format!("auth.tokens[{}].token", i),
                    format!("Token too short (min {} chars)", MIN_TOKEN_LENGTH),
                ));
            }
            if entry.user_id.trim().is_empty() {
                return Err(ParleyError::config_invalid(
                    format!("auth.tokens[{}].user_id", i),
                    "User id cannot be empty",
                ));
            }
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration (see [`ConfigLoader::load`])
    pub fn load(path: &Option<String>) -> Result<Self, ParleyError> {
        ConfigLoader::load(path.as_deref())
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ParleyError> {
        let content = serde_yml::to_string(self).map_err(|e| {
            ParleyError::config_parse_error(format!("Serialization failed: {}", e))
        })?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default location written by `parley init`
    pub fn default_path() -> PathBuf {
        default_parley_dir().join("config.yaml")
    }

    /// Generate a sample configuration
    pub fn sample() -> Self {
        Config {
            gateway: GatewayConfig::default(),
            store: StoreConfig::default(),
            relay: RelayConfig::default(),
            auth: AuthConfig {
                tokens: vec![TokenEntry {
                    token: "replace-me-with-a-long-random-token-0001".to_string(),
                    user_id: "alice".to_string(),
                    role: "user".to_string(),
                }],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.gateway.host, DEFAULT_GATEWAY_HOST);
        assert_eq!(config.gateway.port, DEFAULT_GATEWAY_PORT);
        assert!(!config.gateway.allow_unauthenticated);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_field_defaults() {
        let yaml = "gateway:\n  port: 9000\nstore:\n  backend: memory\n";
        let config: Config = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.ws_path, DEFAULT_WS_PATH);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.relay.history_limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(config.gateway.outbox_capacity, DEFAULT_OUTBOX_CAPACITY);
    }

    #[test]
    fn test_validate_rejects_zero_outbox_capacity() {
        let mut config = Config::default();
        config.gateway.outbox_capacity = 0;
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("gateway.outbox_capacity"));
    }

    #[test]
    fn test_validate_rejects_short_token() {
        let mut config = Config::default();
        config.auth.tokens.push(TokenEntry {
            token: "short".to_string(),
            user_id: "u1".to_string(),
            role: "user".to_string(),
        });
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("auth.tokens[0].token"));
    }

    #[test]
    fn test_validate_rejects_bad_ws_path() {
        let mut config = Config::default();
        config.gateway.ws_path = "ws".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/parley.yaml");
        let sample = Config::sample();
        sample.save(&path).unwrap();

        let loaded = ConfigLoader::load(path.to_str()).unwrap();
        assert_eq!(loaded.auth.tokens.len(), 1);
        assert_eq!(loaded.auth.tokens[0].user_id, "alice");
    }

    #[test]
    fn test_explicit_missing_path_is_not_found() {
        let err = ConfigLoader::load(Some("/definitely/not/here.yaml")).unwrap_err();
        assert!(matches!(
            err,
            ParleyError::Domain(crate::error::DomainError::ConfigNotFound { .. })
        ));
    }
}
