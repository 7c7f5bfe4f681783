//! Transactional access to the metadata store.
//!
//! A [`Transaction`] buffers writes locally and applies them atomically on
//! commit. Concurrency control is optimistic: every key read through the
//! transaction is remembered together with the value observed, and commit
//! fails with [`StorageError::Conflict`] if any of them changed meanwhile.
//! Commits are serialized by a driver-wide mutex so the check and the write
//! happen as one step.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use ingest_types::{KvBackendKind, Settings};

use crate::db::{KvBackend, MemoryKv, RocksKv, WriteOp};
use crate::error::StorageError;

/// Entry point to the metadata store. Cheap to clone.
#[derive(Clone)]
pub struct Driver {
    backend: Arc<dyn KvBackend>,
    commit_lock: Arc<Mutex<()>>,
}

impl Driver {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn open_rocks(path: &Path) -> Result<Self, StorageError> {
        Ok(Self::new(Arc::new(RocksKv::open(path)?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKv::new()))
    }

    /// Build the backend selected by `kv_backend`.
    pub fn from_settings(settings: &Settings) -> Result<Self, StorageError> {
        match settings.kv_backend {
            KvBackendKind::Rocks => Self::open_rocks(Path::new(&settings.db_path)),
            KvBackendKind::Memory => Ok(Self::in_memory()),
        }
    }

    /// Start a transaction.
    pub async fn begin(&self, read_only: bool) -> Result<Transaction, StorageError> {
        Ok(Transaction {
            backend: Arc::clone(&self.backend),
            commit_lock: Arc::clone(&self.commit_lock),
            read_only,
            open: true,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
        })
    }
}

/// A unit of work against the store. Never shared between tasks.
pub struct Transaction {
    backend: Arc<dyn KvBackend>,
    commit_lock: Arc<Mutex<()>>,
    read_only: bool,
    open: bool,
    /// First value observed for every key read from the backend
    reads: HashMap<String, Option<Vec<u8>>>,
    /// Pending writes; `None` is a delete
    writes: BTreeMap<String, Option<Vec<u8>>>,
}

impl Transaction {
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the transaction holds uncommitted writes.
    pub fn has_writes(&self) -> bool {
        !self.writes.is_empty()
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::TransactionClosed)
        }
    }

    fn ensure_writable(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }

    pub async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.ensure_open()?;
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.clone());
        }
        let value = self.backend.get(key)?;
        self.reads
            .entry(key.to_string())
            .or_insert_with(|| value.clone());
        Ok(value)
    }

    pub async fn set(&mut self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.ensure_writable()?;
        self.writes.insert(key.to_string(), Some(value));
        Ok(())
    }

    pub async fn delete(&mut self, key: &str) -> Result<(), StorageError> {
        self.ensure_writable()?;
        self.writes.insert(key.to_string(), None);
        Ok(())
    }

    /// Delete every key under `prefix`. Returns how many keys were removed.
    pub async fn delete_by_prefix(&mut self, prefix: &str) -> Result<usize, StorageError> {
        self.ensure_writable()?;
        let keys = self.collect_keys(prefix, None)?;
        let count = keys.len();
        for key in keys {
            self.writes.insert(key, None);
        }
        Ok(count)
    }

    fn collect_keys(&self, prefix: &str, limit: Option<usize>) -> Result<Vec<String>, StorageError> {
        let mut merged: BTreeMap<String, bool> = self
            .backend
            .scan_keys(prefix, None)?
            .into_iter()
            .map(|k| (k, true))
            .collect();
        for (key, value) in self.writes.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            merged.insert(key.clone(), value.is_some());
        }
        let live = merged.into_iter().filter(|(_, live)| *live).map(|(k, _)| k);
        Ok(match limit {
            Some(limit) => live.take(limit).collect(),
            None => live.collect(),
        })
    }

    /// Stream the keys under `prefix`, including this transaction's own
    /// pending writes.
    pub fn keys(
        &self,
        prefix: &str,
        limit: Option<usize>,
    ) -> BoxStream<'static, Result<String, StorageError>> {
        if let Err(e) = self.ensure_open() {
            return stream::once(async move { Err(e) }).boxed();
        }
        match self.collect_keys(prefix, limit) {
            Ok(keys) => stream::iter(keys.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    /// Apply the buffered writes atomically.
    pub async fn commit(&mut self) -> Result<(), StorageError> {
        self.ensure_writable()?;
        let _guard = self.commit_lock.lock().await;

        // Validation and the batch write hit the backend synchronously
        let backend = Arc::clone(&self.backend);
        let reads = std::mem::take(&mut self.reads);
        let ops: Vec<WriteOp> = std::mem::take(&mut self.writes).into_iter().collect();
        let result = tokio::task::spawn_blocking(move || apply_commit(backend.as_ref(), &reads, ops))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?;
        self.open = false;
        let count = result?;
        debug!(writes = count, "Committed transaction");
        Ok(())
    }

    /// Drop the buffered writes. Aborting a closed transaction is a no-op.
    pub async fn abort(&mut self) -> Result<(), StorageError> {
        if self.open {
            self.writes.clear();
            self.open = false;
        }
        Ok(())
    }

    pub async fn get_json<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, StorageError> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes).await
    }

    pub async fn get_proto<M: prost::Message + Default>(
        &mut self,
        key: &str,
    ) -> Result<Option<M>, StorageError> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(M::decode(bytes.as_slice())?)),
            None => Ok(None),
        }
    }

    pub async fn set_proto<M: prost::Message>(&mut self, key: &str, value: &M) -> Result<(), StorageError> {
        self.set(key, value.encode_to_vec()).await
    }
}

/// Check that nothing read has changed, then write `ops` as one batch.
fn apply_commit(
    backend: &dyn KvBackend,
    reads: &HashMap<String, Option<Vec<u8>>>,
    ops: Vec<WriteOp>,
) -> Result<usize, StorageError> {
    for (key, observed) in reads {
        let current = backend.get(key)?;
        if &current != observed {
            warn!(key = %key, "Transaction conflict");
            return Err(StorageError::Conflict(key.clone()));
        }
    }
    let count = ops.len();
    if !ops.is_empty() {
        backend.write(ops)?;
    }
    Ok(count)
}
