//! RocksDB-backed document storage.
//!
//! Column families:
//! - `documents`: one record per document id: JSON-encoded
//!   [`StoredDocument`], LZ4 compressed (`lz4_flex`, size-prepended)
//!
//! Every save rewrites the whole record; there are no partial patches.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteOptions,
};
use serde::Deserialize;

use super::{DocumentStorage, StorageError, StoredDocument};

const CF_DOCUMENTS: &str = "documents";

/// Store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-chosen directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

pub struct RocksStorage {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStorage {
    /// Open (creating if missing) the store at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf = ColumnFamilyDescriptor::new(CF_DOCUMENTS, Self::cf_options(&config));
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, vec![cf])?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Records are already LZ4 compressed.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Ids of every stored document.
    pub fn list_ids(&self) -> Result<Vec<String>, StorageError> {
        let cf = self.cf()?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, rocksdb::IteratorMode::Start) {
            let (key, _) = item?;
            ids.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(ids)
    }

    pub fn delete(&self, id: &str) -> Result<(), StorageError> {
        let cf = self.cf()?;
        self.db.delete_cf(&cf, id.as_bytes())?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn put(&self, doc: &StoredDocument) -> Result<(), StorageError> {
        let cf = self.cf()?;
        let json = serde_json::to_vec(doc)?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(&cf, doc.id.as_bytes(), &compressed, &write_opts)?;
        log::debug!(
            "Stored {} ({} bytes, {} compressed)",
            doc.id,
            json.len(),
            compressed.len()
        );
        Ok(())
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(CF_DOCUMENTS)
            .ok_or_else(|| StorageError::Database(format!("Column family '{CF_DOCUMENTS}' not found")))
    }
}

impl DocumentStorage for RocksStorage {
    fn get(&self, id: &str) -> Result<Option<StoredDocument>, StorageError> {
        let cf = self.cf()?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(compressed) => {
                let json = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StorageError::Compression(e.to_string()))?;
                Ok(Some(serde_json::from_slice(&json)?))
            }
            None => Ok(None),
        }
    }

    fn update(
        &self,
        id: &str,
        content: &serde_json::Value,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut doc = self
            .get(id)?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        doc.content = content.clone();
        doc.updated_at = updated_at;
        self.put(&doc)
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
        self.put(&doc)?;
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_temp() -> (tempfile::TempDir, RocksStorage) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStorage::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert!(store.list_ids().unwrap().is_empty());
    }

    #[test]
    fn test_create_get() {
        let (_dir, store) = open_temp();
        let content = json!([{ "type": "paragraph", "children": [{ "text": "hello" }] }]);
        store.create("doc-1", "Greeting", &content).unwrap();

        let doc = store.get("doc-1").unwrap().unwrap();
        assert_eq!(doc.title, "Greeting");
        assert_eq!(doc.content, content);
        assert!(store.get("doc-2").unwrap().is_none());
    }

    #[test]
    fn test_update_overwrites_whole_content() {
        let (_dir, store) = open_temp();
        store.create("doc-1", "T", &json!(["a", "b", "c"])).unwrap();
        let at = Utc::now();
        store.update("doc-1", &json!(["z"]), at).unwrap();

        let doc = store.get("doc-1").unwrap().unwrap();
        assert_eq!(doc.content, json!(["z"]));
        assert_eq!(doc.updated_at, at);
        assert_eq!(doc.title, "T");
    }

    #[test]
    fn test_update_missing() {
        let (_dir, store) = open_temp();
        assert!(matches!(
            store.update("ghost", &json!([]), Utc::now()),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_string_content_preserved() {
        let (_dir, store) = open_temp();
        let encoded = json!("[{\"type\":\"paragraph\",\"children\":[{\"text\":\"x\"}]}]");
        store.create("legacy", "Old", &encoded).unwrap();
        assert_eq!(store.get("legacy").unwrap().unwrap().content, encoded);
    }

    #[test]
    fn test_list_and_delete() {
        let (_dir, store) = open_temp();
        store.create("a", "A", &json!([])).unwrap();
        store.create("b", "B", &json!([])).unwrap();
        assert_eq!(store.list_ids().unwrap(), vec!["a".to_string(), "b".to_string()]);

        store.delete("a").unwrap();
        assert_eq!(store.list_ids().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        {
            let store = RocksStorage::open(config.clone()).unwrap();
            store.create("doc-1", "T", &json!(["kept"])).unwrap();
            store.sync().unwrap();
        }
        let store = RocksStorage::open(config).unwrap();
        assert_eq!(store.get("doc-1").unwrap().unwrap().content, json!(["kept"]));
    }
}
