pub mod config;
pub mod error;
pub mod ports;
pub mod types;

// Re-export commonly used types
pub use config::{
    AuthConfig, Config, ConfigLoader, GatewayConfig, RelayConfig, StoreBackend, StoreConfig,
    TokenEntry,
};
pub use error::{DomainError, InfraError, ParleyError, StoreError};
pub use ports::{Collaborators, IdentityProvider, MessageStore, RoomRoster, UserDirectory};
pub use types::{
    ConnectionId, DisplayInfo, EnrichedMessage, Identity, MessageBody, PairingKey, RoomId,
    RoomKey, StoredMessage, UserId,
};
