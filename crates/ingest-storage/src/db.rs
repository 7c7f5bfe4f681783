//! Key-value backends for the metadata store.
//!
//! Provides:
//! - RocksDB backend with column family setup and atomic write batches
//! - In-memory backend for tests and ephemeral deployments
//!
//! Backends are synchronous and know nothing about transactions; the
//! optimistic transaction layer lives in [`crate::driver`].

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info};

use crate::column_families::{build_cf_descriptors, CF_MAINDB};
use crate::error::StorageError;

/// A buffered mutation; `None` deletes the key.
pub type WriteOp = (String, Option<Vec<u8>>);

/// Raw ordered key-value store.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Keys starting with `prefix`, in order, at most `limit` of them.
    fn scan_keys(&self, prefix: &str, limit: Option<usize>) -> Result<Vec<String>, StorageError>;

    /// Apply all operations atomically.
    fn write(&self, ops: Vec<WriteOp>) -> Result<(), StorageError>;
}

/// RocksDB-backed store
pub struct RocksKv {
    db: DB,
}

impl RocksKv {
    /// Open storage at the given path, creating if necessary
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening metadata store at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(4);

        let db = DB::open_cf_descriptors(&db_opts, path, build_cf_descriptors())?;
        Ok(Self { db })
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StorageError> {
        self.db
            .cf_handle(CF_MAINDB)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_MAINDB.to_string()))
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        let cf = self.cf()?;
        self.db.flush_cf(cf)?;
        Ok(())
    }
}

impl KvBackend for RocksKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let cf = self.cf()?;
        Ok(self.db.get_cf(cf, key.as_bytes())?)
    }

    fn scan_keys(&self, prefix: &str, limit: Option<usize>) -> Result<Vec<String>, StorageError> {
        let cf = self.cf()?;
        let mut keys = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));

        for item in iter {
            let (key, _) = item?;
            // Stop once we've passed the prefix
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StorageError::Key(format!("Invalid UTF-8: {}", e)))?;
            keys.push(key);
            if limit.is_some_and(|l| keys.len() >= l) {
                break;
            }
        }
        Ok(keys)
    }

    fn write(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        let cf = self.cf()?;
        let count = ops.len();
        let mut batch = WriteBatch::default();
        for (key, value) in ops {
            match value {
                Some(value) => batch.put_cf(cf, key.as_bytes(), value),
                None => batch.delete_cf(cf, key.as_bytes()),
            }
        }
        self.db.write(batch)?;
        debug!(ops = count, "Wrote batch");
        Ok(())
    }
}

/// Process-local ordered map
#[derive(Default)]
pub struct MemoryKv {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StorageError {
    StorageError::Key("memory store lock poisoned".to_string())
}

impl KvBackend for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(key).cloned())
    }

    fn scan_keys(&self, prefix: &str, limit: Option<usize>) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().map_err(poisoned)?;
        let iter = data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone());
        Ok(match limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    fn write(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
        let mut data = self.data.write().map_err(poisoned)?;
        for (key, value) in ops {
            match value {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (RocksKv, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = RocksKv::open(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    fn exercise(backend: &dyn KvBackend) {
        backend
            .write(vec![
                ("/kbs/a".to_string(), Some(b"1".to_vec())),
                ("/kbs/a/r/x".to_string(), Some(b"2".to_vec())),
                ("/kbs/b".to_string(), Some(b"3".to_vec())),
                ("/kbsx".to_string(), Some(b"4".to_vec())),
            ])
            .unwrap();

        assert_eq!(backend.get("/kbs/a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.get("/missing").unwrap(), None);

        let keys = backend.scan_keys("/kbs/", None).unwrap();
        assert_eq!(keys, vec!["/kbs/a", "/kbs/a/r/x", "/kbs/b"]);

        let limited = backend.scan_keys("/kbs/", Some(2)).unwrap();
        assert_eq!(limited.len(), 2);

        backend
            .write(vec![("/kbs/a".to_string(), None)])
            .unwrap();
        assert_eq!(backend.get("/kbs/a").unwrap(), None);
    }

    #[test]
    fn test_rocks_backend() {
        let (storage, _temp) = create_test_storage();
        exercise(&storage);
        storage.flush().unwrap();
    }

    #[test]
    fn test_memory_backend() {
        let storage = MemoryKv::new();
        exercise(&storage);
        assert_eq!(storage.len(), 3);
    }

    #[test]
    fn test_rocks_reopen_persists() {
        let temp_dir = TempDir::new().unwrap();
        {
            let storage = RocksKv::open(temp_dir.path()).unwrap();
            storage
                .write(vec![("/internal/ingest/txn/1".to_string(), Some(b"7".to_vec()))])
                .unwrap();
        }
        let storage = RocksKv::open(temp_dir.path()).unwrap();
        assert_eq!(
            storage.get("/internal/ingest/txn/1").unwrap(),
            Some(b"7".to_vec())
        );
    }
}
