// Bearer Token Authentication
//
// Static bearer tokens mapped to user identities. Tokens are kept only as
// SHA-256 digests; the plaintext lives in the config file and on the client.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_core::config::MIN_TOKEN_LENGTH;
use parley_core::{AuthConfig, Identity, IdentityProvider, UserId};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Length of tokens produced by [`TokenAuth::generate_token`]
pub const GENERATED_TOKEN_LENGTH: usize = 48;

/// Token authentication system
pub struct TokenAuth {
    tokens: Arc<RwLock<HashMap<String, TokenInfo>>>,
}

/// Token information
#[derive(Clone, Debug)]
pub struct TokenInfo {
    pub user_id: UserId,
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
}

fn strip_bearer(token: &str) -> &str {
    token.strip_prefix("Bearer ").unwrap_or(token).trim()
}

fn digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn well_formed(token: &str) -> bool {
    if token.len() < MIN_TOKEN_LENGTH {
        tracing::warn!("Token validation failed: too short ({} chars)", token.len());
        return false;
    }
    if !token
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        tracing::warn!("Token validation failed: invalid characters");
        return false;
    }
    true
}

impl TokenAuth {
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Build the registry from the `auth` config section
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let mut tokens = HashMap::new();
        for entry in &config.tokens {
            let token = strip_bearer(&entry.token);
            if !well_formed(token) {
                return Err(anyhow::anyhow!(
                    "Malformed token for user '{}' (min {} chars, [A-Za-z0-9._-])",
                    entry.user_id,
                    MIN_TOKEN_LENGTH
                ));
            }
            tokens.insert(
                digest(token),
                TokenInfo {
                    user_id: entry.user_id.clone(),
                    role: entry.role.clone(),
                    created_at: Utc::now(),
                    last_used: None,
                },
            );
        }
        tracing::info!("Loaded {} bearer token(s)", tokens.len());

        Ok(Self {
            tokens: Arc::new(RwLock::new(tokens)),
        })
    }

    /// Random alphanumeric token suitable for the `auth` config section
    pub fn generate_token() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(GENERATED_TOKEN_LENGTH)
            .map(char::from)
            .collect()
    }

    /// Validate a token
    pub async fn validate(&self, token: &str) -> bool {
        let token = strip_bearer(token);
        if !well_formed(token) {
            return false;
        }

        let tokens = self.tokens.read().await;
        if tokens.contains_key(&digest(token)) {
            tracing::debug!("Token validated successfully");
            true
        } else {
            tracing::warn!("Token validation failed: token not found in registry");
            false
        }
    }

    /// Register a new token
    pub async fn register(&self, token: &str, user_id: &str, role: &str) -> Result<()> {
        let token = strip_bearer(token);
        if token.len() < MIN_TOKEN_LENGTH {
            return Err(anyhow::anyhow!(
                "Token too short (min {} chars)",
                MIN_TOKEN_LENGTH
            ));
        }

        let info = TokenInfo {
            user_id: user_id.to_string(),
            role: role.to_string(),
            created_at: Utc::now(),
            last_used: None,
        };

        self.tokens.write().await.insert(digest(token), info);
        tracing::info!("Token registered for user {}", user_id);
        Ok(())
    }

    /// Get token info
    pub async fn get_token_info(&self, token: &str) -> Option<TokenInfo> {
        let key = digest(strip_bearer(token));
        self.tokens.read().await.get(&key).cloned()
    }

    /// Update last used timestamp
    pub async fn update_last_used(&self, token: &str) {
        let key = digest(strip_bearer(token));
        if let Some(info) = self.tokens.write().await.get_mut(&key) {
            info.last_used = Some(Utc::now());
        }
    }

    /// Revoke a token. Connections already identified with it stay bound.
    pub async fn revoke(&self, token: &str) -> Result<()> {
        let key = digest(strip_bearer(token));
        self.tokens.write().await.remove(&key);
        tracing::info!("Token revoked successfully");
        Ok(())
    }

    /// Get registered token count
    pub async fn token_count(&self) -> usize {
        self.tokens.read().await.len()
    }
}

impl Default for TokenAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for TokenAuth {
    async fn resolve(&self, credential: &str) -> Option<Identity> {
        if !self.validate(credential).await {
            return None;
        }
        self.update_last_used(credential).await;
        self.get_token_info(credential).await.map(|info| Identity {
            user_id: info.user_id,
            role: info.role,
        })
    }
}
