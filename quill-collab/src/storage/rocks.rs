//! RocksDB-backed update store.
//!
//! Column families:
//! - `updates` — Encoded Yrs updates (LZ4 compressed), keyed by
//!   `<id_len:4 bytes BE><document_id><sequence:8 bytes BE>`
//!
//! The sequence is global and strictly increasing, so a prefix scan over
//! one document id returns its updates in append order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::{StoreError, UpdateStore};

const CF_UPDATES: &str = "updates";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("quill_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, caller-provided directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable [`UpdateStore`].
pub struct RocksUpdateStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next key sequence number
    sequence: AtomicU64,
    /// Entry count per document log, filled on first write. The lock also
    /// serializes writers.
    counts: Mutex<HashMap<String, usize>>,
}

impl RocksUpdateStore {
    /// Open the store, creating the database if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let mut cf_opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        cf_opts.set_block_based_table_factory(&block_opts);
        // Values are already LZ4 framed.
        cf_opts.set_compression_type(DBCompressionType::None);
        cf_opts.set_write_buffer_size(config.write_buffer_size);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_UPDATES, cf_opts)],
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::info!("Opened update store at {} (next sequence {sequence})", config.path.display());

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            counts: Mutex::new(HashMap::new()),
        })
    }

    /// Highest stored sequence plus one.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let Some(cf) = db.cf_handle(CF_UPDATES) else {
            return Ok(0);
        };
        let mut next = 0;
        for item in db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some((_, seq)) = split_key(&key) {
                next = next.max(seq + 1);
            }
        }
        Ok(next)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_UPDATES)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_UPDATES}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn next_key(&self, document_id: &str) -> Vec<u8> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut key = key_prefix(document_id);
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    /// Keys and raw values of one document's log, in append order.
    fn scan(&self, document_id: &str) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let cf = self.cf()?;
        let prefix = key_prefix(document_id);
        let mut entries = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(&prefix) || key.len() != prefix.len() + 8 {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }
}

impl UpdateStore for RocksUpdateStore {
    fn load(&self, document_id: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        self.scan(document_id)?
            .into_iter()
            .map(|(_, value)| {
                lz4_flex::decompress_size_prepended(&value)
                    .map_err(|e| StoreError::Compression(e.to_string()))
            })
            .collect()
    }

    fn append(&self, document_id: &str, update: &[u8]) -> Result<usize, StoreError> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = match counts.get(document_id) {
            Some(&count) => count,
            None => self.scan(document_id)?.len(),
        };

        let cf = self.cf()?;
        let key = self.next_key(document_id);
        self.db
            .put_cf_opt(&cf, &key, lz4_flex::compress_prepend_size(update), &self.write_options())?;
        counts.insert(document_id.to_owned(), stored + 1);
        Ok(stored + 1)
    }

    fn replace(&self, document_id: &str, merged: &[u8]) -> Result<(), StoreError> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let cf = self.cf()?;

        let mut batch = WriteBatch::default();
        for (key, _) in self.scan(document_id)? {
            batch.delete_cf(&cf, &key);
        }
        batch.put_cf(&cf, self.next_key(document_id), lz4_flex::compress_prepend_size(merged));
        self.db.write_opt(batch, &self.write_options())?;
        counts.insert(document_id.to_owned(), 1);
        Ok(())
    }

    fn clear(&self, document_id: &str) -> Result<(), StoreError> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let cf = self.cf()?;

        let mut batch = WriteBatch::default();
        for (key, _) in self.scan(document_id)? {
            batch.delete_cf(&cf, &key);
        }
        self.db.write_opt(batch, &self.write_options())?;
        counts.insert(document_id.to_owned(), 0);
        Ok(())
    }

    fn documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf()?;
        let mut ids: Vec<String> = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some((id, _)) = split_key(&key) {
                if ids.last().map(String::as_str) != Some(id) {
                    ids.push(id.to_owned());
                }
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

fn key_prefix(document_id: &str) -> Vec<u8> {
    let bytes = document_id.as_bytes();
    let mut key = Vec::with_capacity(4 + bytes.len() + 8);
    key.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    key.extend_from_slice(bytes);
    key
}

fn split_key(key: &[u8]) -> Option<(&str, u64)> {
    let len_bytes: [u8; 4] = key.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let id = std::str::from_utf8(key.get(4..4 + len)?).ok()?;
    let seq_bytes: [u8; 8] = key.get(4 + len..)?.try_into().ok()?;
    Some((id, u64::from_be_bytes(seq_bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> RocksUpdateStore {
        RocksUpdateStore::open(StoreConfig::for_testing(dir.path())).unwrap()
    }

    #[test]
    fn test_append_load_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        assert_eq!(store.append("doc", b"first").unwrap(), 1);
        assert_eq!(store.append("doc", b"second").unwrap(), 2);
        assert_eq!(
            store.load("doc").unwrap(),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
    }

    #[test]
    fn test_prefix_does_not_leak_between_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);

        store.append("doc", b"a").unwrap();
        store.append("doc-2", b"b").unwrap();
        store.append("do", b"c").unwrap();

        assert_eq!(store.load("doc").unwrap(), vec![b"a".to_vec()]);
        assert_eq!(store.documents().unwrap(), vec!["do", "doc", "doc-2"]);
    }

    #[test]
    fn test_replace_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir);
            store.append("doc", b"one").unwrap();
            store.append("doc", b"two").unwrap();
            store.replace("doc", b"merged").unwrap();
        }

        let store = open(&dir);
        assert_eq!(store.load("doc").unwrap(), vec![b"merged".to_vec()]);
        // Sequence recovered: new appends sort after the merged entry.
        store.append("doc", b"three").unwrap();
        assert_eq!(
            store.load("doc").unwrap(),
            vec![b"merged".to_vec(), b"three".to_vec()]
        );
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        store.append("doc", b"x").unwrap();
        store.clear("doc").unwrap();
        assert!(store.load("doc").unwrap().is_empty());
        assert!(store.documents().unwrap().is_empty());
    }

    #[test]
    fn test_append_count_follows_compaction_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(&dir);
            for i in 0..3u8 {
                store.append("doc", &[i]).unwrap();
            }
            store.replace("doc", b"merged").unwrap();
            assert_eq!(store.append("doc", b"after").unwrap(), 2);
            store.clear("other").unwrap();
            assert_eq!(store.append("other", b"x").unwrap(), 1);
        }

        // Counts are rebuilt from disk after reopening.
        let store = open(&dir);
        assert_eq!(store.append("doc", b"again").unwrap(), 3);
        assert_eq!(store.load("doc").unwrap().len(), 3);
    }

    #[test]
    fn test_split_key_roundtrip() {
        let mut key = key_prefix("abc");
        key.extend_from_slice(&42u64.to_be_bytes());
        assert_eq!(split_key(&key), Some(("abc", 42)));
        assert_eq!(split_key(&[0, 0]), None);
    }
}
