//! Durable key-value storage for wallet secrets and state.
//!
//! Only the authority writes here. Values are JSON so the persisted layout
//! stays readable from any tool that can open the backing store.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Capability store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt value for key {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key-value capability exposed to the authority.
#[async_trait]
pub trait CapabilityStore: Send + Sync {
    /// Fetch the requested keys. Missing keys are absent from the map.
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, StoreError>;

    /// Write every entry of `entries`, replacing existing values.
    async fn set(&self, entries: HashMap<String, Value>) -> Result<(), StoreError>;

    /// Remove every key.
    async fn clear(&self) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn CapabilityStore>;
