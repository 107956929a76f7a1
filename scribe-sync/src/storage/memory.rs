//! In-memory storage for tests and ephemeral relays.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{DocumentStorage, StorageError, StoredDocument};

#[derive(Default)]
pub struct MemoryStorage {
    docs: Mutex<HashMap<String, StoredDocument>>,
    writes: AtomicU64,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style seed.
    pub fn with_document(self, id: &str, title: &str, content: serde_json::Value) -> Self {
        if let Ok(mut docs) = self.docs.lock() {
            docs.insert(
                id.to_string(),
                StoredDocument {
                    id: id.to_string(),
                    title: title.to_string(),
                    content,
                    updated_at: Utc::now(),
                },
            );
        }
        self
    }

    /// Successful `update` calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent read fail.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, StoredDocument>>, StorageError> {
        self.docs
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store poisoned".into()))
    }
}

impl DocumentStorage for MemoryStorage {
    fn get(&self, id: &str) -> Result<Option<StoredDocument>, StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("reads disabled".into()));
        }
        Ok(self.lock()?.get(id).cloned())
    }

    fn update(
        &self,
        id: &str,
        content: &serde_json::Value,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("writes disabled".into()));
        }
        let mut docs = self.lock()?;
        let doc = docs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        doc.content = content.clone();
        doc.updated_at = updated_at;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create(
        &self,
        id: &str,
        title: &str,
        content: &serde_json::Value,
    ) -> Result<StoredDocument, StorageError> {
        let doc = StoredDocument {
            id: id.to_string(),
            title: title.to_string(),
            content: content.clone(),
            updated_at: Utc::now(),
        };
        self.lock()?.insert(id.to_string(), doc.clone());
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_get_update() {
        let store = MemoryStorage::new();
        store.create("doc-1", "Notes", &json!([])).unwrap();
        assert_eq!(store.get("doc-1").unwrap().unwrap().title, "Notes");

        let at = Utc::now();
        store.update("doc-1", &json!(["x"]), at).unwrap();
        let doc = store.get("doc-1").unwrap().unwrap();
        assert_eq!(doc.content, json!(["x"]));
        assert_eq!(doc.updated_at, at);
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_update_missing_document() {
        let store = MemoryStorage::new();
        assert!(matches!(
            store.update("nope", &json!([]), Utc::now()),
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(store.write_count(), 0);
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_failure_switches() {
        let store = MemoryStorage::new().with_document("d", "t", json!([]));
        store.set_fail_reads(true);
        assert!(store.get("d").is_err());
        store.set_fail_reads(false);
        store.set_fail_writes(true);
        assert!(store.update("d", &json!([]), Utc::now()).is_err());
        assert_eq!(store.write_count(), 0);
    }
}
