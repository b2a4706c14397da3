//! parley_store
//! Persistence, user directory and room roster backends for the relay.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use parley_core::{Collaborators, StoreBackend, StoreConfig, StoreError};

/// Open the backend selected by `config`
pub fn open_backend(config: &StoreConfig) -> Result<Collaborators, StoreError> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store: history is lost on restart");
            Ok(Collaborators::from_backend(MemoryStore::new()))
        }
        StoreBackend::Sqlite => Ok(Collaborators::from_backend(SqliteStore::open(
            &config.db_path,
        )?)),
    }
}
