//! Durable document storage.
//!
//! The sync layer only ever reads a document once (initial load) and then
//! issues whole-content overwrites keyed by document id:
//!
//! ```text
//! Session::start ──get(id)──────────────► ┌──────────────────┐
//!                                         │ DocumentStorage  │
//! PersistenceBridge ──update(id, …)─────► │  MemoryStorage   │
//!   (debounced, blocking pool)            │  RocksStorage    │
//!                                         └──────────────────┘
//! ```
//!
//! Implementations are synchronous; callers on the event loop run them
//! through `tokio::task::spawn_blocking`.

pub mod memory;
pub mod rocks;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::MemoryStorage;
pub use rocks::{RocksStorage, StoreConfig};

/// The durable record for one document.
///
/// `content` is kept as raw JSON: older writers stored it as a
/// JSON-encoded string, newer ones as a structured array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub title: String,
    pub content: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

pub trait DocumentStorage: Send + Sync {
    /// Fetch a document, `Ok(None)` if it does not exist.
    fn get(&self, id: &str) -> Result<Option<StoredDocument>, StorageError>;

    /// Overwrite the content of an existing document.
    fn update(
        &self,
        id: &str,
        content: &serde_json::Value,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Create (or replace) a document.
    fn create(
        &self,
        id: &str,
        title: &str,
        content: &serde_json::Value,
    ) -> Result<StoredDocument, StorageError>;
}

impl<T: DocumentStorage + ?Sized> DocumentStorage for Arc<T> {
    fn get(&self, id: &str) -> Result<Option<StoredDocument>, StorageError> {
        (**self).get(id)
    }

    fn update(
        &self,
        id: &str,
        content: &serde_json::Value,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        (**self).update(id, content, updated_at)
    }

    fn create(
        &self,
        id: &str,
        title: &str,
        content: &serde_json::Value,
    ) -> Result<StoredDocument, StorageError> {
        (**self).create(id, title, content)
    }
}

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}
