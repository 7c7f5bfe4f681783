//! Back pressure materializer.
//!
//! Queue depths are polled in the background and kept in memory, so a
//! back pressure check is a stale read that never waits on the transport.
//! Only the per-KB processing backlog is fetched on demand, behind a short
//! TTL cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ingest_storage::{keys, Driver};
use ingest_types::{BackPressureSettings, ShardSet};

use crate::cache::TtlCache;
use crate::client::ProcessingClient;
use crate::error::{BackPressureError, BackPressureKind, QueueStatsError};

/// Stream the index nodes consume from.
pub const INDEXING_STREAM: &str = "indexing";

const PROCESSING_PENDING_TTL: Duration = Duration::from_secs(60);
const KB_NODES_TTL: Duration = Duration::from_secs(15 * 60);
const RESOURCE_NODES_TTL: Duration = Duration::from_secs(60 * 60);
const RETRY_AFTER_TTL: Duration = Duration::from_secs(5 * 60);
const CACHE_CAPACITY: usize = 1024;
const STATS_TIMEOUT: Duration = Duration::from_millis(500);

/// Durable consumer an index node reads its indexing queue with.
pub fn indexing_consumer(node_id: &str) -> String {
    format!("indexer-{node_id}")
}

/// Pending-message counts of transport consumers.
#[async_trait]
pub trait QueueStats: Send + Sync {
    async fn consumer_pending(&self, stream: &str, consumer: &str) -> Result<u64, QueueStatsError>;
}

/// `now + min(pending / rate, max_wait)` seconds.
pub fn estimate_try_after(rate: f64, pending: i64, max_wait: u64) -> DateTime<Utc> {
    let wait_secs = (pending.max(0) as f64 / rate).min(max_wait as f64);
    Utc::now() + chrono::Duration::milliseconds((wait_secs * 1000.0) as i64)
}

/// Hit/miss counters of the retry-after cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Remembers recent back pressure decisions per `{kbid}-{resource}`.
struct RetryAfterCache {
    entries: TtlCache<String, BackPressureError>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RetryAfterCache {
    fn new() -> Self {
        Self {
            entries: TtlCache::new(CACHE_CAPACITY, RETRY_AFTER_TTL),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn get(&self, key: &String) -> Option<BackPressureError> {
        let found = self.entries.get(key).and_then(|decision| {
            if decision.try_after > Utc::now() {
                Some(decision)
            } else {
                self.entries.remove(key);
                None
            }
        });
        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    settings: BackPressureSettings,
    driver: Driver,
    queue: Arc<dyn QueueStats>,
    processing: Option<Arc<dyn ProcessingClient>>,
    index_nodes: Vec<String>,
    ingest_stream: String,
    ingest_consumer: String,

    ingest_pending: AtomicI64,
    indexing_pending: DashMap<String, i64>,
    processing_pending: TtlCache<String, i64>,
    processing_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    kb_nodes: TtlCache<String, Vec<String>>,
    resource_nodes: TtlCache<(String, String), Vec<String>>,
    retry_after: RetryAfterCache,
}

/// In-memory view of the pipeline's queue depths. Cheap to clone.
#[derive(Clone)]
pub struct BackPressureMaterializer {
    inner: Arc<Inner>,
}

impl BackPressureMaterializer {
    /// `ingest_stream`/`ingest_consumer` name the consumer of processed
    /// messages; `index_nodes` are polled for their indexing backlog.
    pub fn new(
        settings: BackPressureSettings,
        driver: Driver,
        queue: Arc<dyn QueueStats>,
        processing: Option<Arc<dyn ProcessingClient>>,
        index_nodes: Vec<String>,
        ingest_stream: impl Into<String>,
        ingest_consumer: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                driver,
                queue,
                processing,
                index_nodes,
                ingest_stream: ingest_stream.into(),
                ingest_consumer: ingest_consumer.into(),
                ingest_pending: AtomicI64::new(0),
                indexing_pending: DashMap::new(),
                processing_pending: TtlCache::new(CACHE_CAPACITY, PROCESSING_PENDING_TTL),
                processing_locks: DashMap::new(),
                kb_nodes: TtlCache::new(CACHE_CAPACITY, KB_NODES_TTL),
                resource_nodes: TtlCache::new(CACHE_CAPACITY, RESOURCE_NODES_TTL),
                retry_after: RetryAfterCache::new(),
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.inner.settings.enabled
    }

    pub fn settings(&self) -> &BackPressureSettings {
        &self.inner.settings
    }

    /// Poll queue depths until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            nodes = self.inner.index_nodes.len(),
            "Starting back pressure materializer"
        );
        let indexing = async {
            let interval = Duration::from_secs(self.inner.settings.indexing_check_interval);
            loop {
                self.refresh_indexing().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        };
        let ingest = async {
            let interval = Duration::from_secs(self.inner.settings.ingest_check_interval);
            loop {
                self.refresh_ingest().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        };
        tokio::join!(indexing, ingest);
        info!("Back pressure materializer stopped");
    }

    /// One poll of every index node. Failures keep the previous value.
    pub async fn refresh_indexing(&self) {
        for node in &self.inner.index_nodes {
            match self
                .inner
                .queue
                .consumer_pending(INDEXING_STREAM, &indexing_consumer(node))
                .await
            {
                Ok(pending) => {
                    self.inner
                        .indexing_pending
                        .insert(node.clone(), pending as i64);
                }
                Err(e) => warn!(node = %node, error = %e, "Error getting pending messages to index"),
            }
        }
    }

    /// One poll of the processed-messages consumer. Failures keep the
    /// previous value.
    pub async fn refresh_ingest(&self) {
        match self
            .inner
            .queue
            .consumer_pending(&self.inner.ingest_stream, &self.inner.ingest_consumer)
            .await
        {
            Ok(pending) => self
                .inner
                .ingest_pending
                .store(pending as i64, Ordering::Relaxed),
            Err(e) => warn!(error = %e, "Error getting pending messages to ingest"),
        }
    }

    pub fn ingest_pending(&self) -> i64 {
        self.inner.ingest_pending.load(Ordering::Relaxed)
    }

    pub fn indexing_pending(&self) -> HashMap<String, i64> {
        self.inner
            .indexing_pending
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Processing backlog of one KB. Errors are logged, not cached, and
    /// read as zero.
    pub async fn processing_pending(&self, kbid: &str) -> i64 {
        let key = kbid.to_string();
        if let Some(pending) = self.inner.processing_pending.get(&key) {
            return pending;
        }
        let lock = self
            .inner
            .processing_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let pending = {
            let _guard = lock.lock().await;
            self.fetch_processing_pending(kbid).await
        };
        drop(lock);
        // Nobody else waiting on this KB
        self.inner
            .processing_locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        pending
    }

    async fn fetch_processing_pending(&self, kbid: &str) -> i64 {
        let key = kbid.to_string();
        // Filled while we waited
        if let Some(pending) = self.inner.processing_pending.get(&key) {
            return pending;
        }
        let Some(client) = &self.inner.processing else {
            return 0;
        };
        match client.stats(kbid, STATS_TIMEOUT).await {
            Ok(stats) => {
                if stats.incomplete > 0 {
                    info!(kbid = %kbid, pending = stats.incomplete, "Processing has pending messages for KB");
                }
                self.inner.processing_pending.insert(key, stats.incomplete);
                stats.incomplete
            }
            Err(e) => {
                warn!(kbid = %kbid, error = %e, "Error getting processing backlog; skipping processing back pressure");
                0
            }
        }
    }

    fn exceeded(
        kind: BackPressureKind,
        pending: i64,
        max_pending: i64,
        rate: f64,
        max_wait: u64,
    ) -> Result<(), BackPressureError> {
        if max_pending <= 0 || pending <= max_pending {
            return Ok(());
        }
        let try_after = estimate_try_after(rate, pending, max_wait);
        info!(kind = %kind, pending, try_after = %try_after, "Back pressure applied");
        Err(BackPressureError {
            kind,
            try_after,
            cached: false,
        })
    }

    pub fn check_ingest(&self) -> Result<(), BackPressureError> {
        let s = &self.inner.settings;
        Self::exceeded(
            BackPressureKind::Ingest,
            self.ingest_pending(),
            s.max_ingest_pending,
            s.ingest_rate,
            s.max_wait_time,
        )
    }

    /// Indexing check against the busiest index node.
    pub fn check_indexing(&self) -> Result<(), BackPressureError> {
        let highest = self
            .inner
            .indexing_pending
            .iter()
            .map(|entry| *entry.value())
            .max()
            .unwrap_or(0);
        self.check_indexing_pending(highest)
    }

    fn check_indexing_pending(&self, pending: i64) -> Result<(), BackPressureError> {
        let s = &self.inner.settings;
        Self::exceeded(
            BackPressureKind::Indexing,
            pending,
            s.max_indexing_pending,
            s.indexing_rate,
            s.max_wait_time,
        )
    }

    /// Indexing check against the nodes a write to `kbid` (and `resource`)
    /// would land on.
    pub async fn check_indexing_for(
        &self,
        kbid: &str,
        resource: Option<&str>,
    ) -> Result<(), BackPressureError> {
        if self.inner.settings.max_indexing_pending <= 0 {
            return Ok(());
        }
        let nodes = match resource {
            Some(uuid) => self.resource_nodes(kbid, uuid).await,
            None => self.kb_nodes(kbid).await,
        };
        if nodes.is_empty() {
            debug!(kbid = %kbid, resource = ?resource, "No nodes to check for pending messages");
            return Ok(());
        }
        let pending = nodes
            .iter()
            .filter_map(|node| self.inner.indexing_pending.get(node).map(|p| *p))
            .max()
            .unwrap_or(0);
        self.check_indexing_pending(pending)
    }

    pub async fn check_processing(&self, kbid: &str) -> Result<(), BackPressureError> {
        let s = &self.inner.settings;
        if s.max_processing_pending <= 0 {
            return Ok(());
        }
        let pending = self.processing_pending(kbid).await;
        Self::exceeded(
            BackPressureKind::Processing,
            pending,
            s.max_processing_pending,
            s.processing_rate,
            s.max_wait_time,
        )
    }

    /// Every check for a write to `kbid`, with cached decisions reused
    /// until their `try_after` passes.
    pub async fn maybe_back_pressure(
        &self,
        kbid: &str,
        resource: Option<&str>,
    ) -> Result<(), BackPressureError> {
        if !self.enabled() {
            return Ok(());
        }
        let key = format!("{kbid}-{}", resource.unwrap_or_default());
        if let Some(decision) = self.inner.retry_after.get(&key) {
            debug!(kbid = %kbid, kind = %decision.kind, "Back pressure applied from cache");
            return Err(BackPressureError {
                cached: true,
                ..decision
            });
        }
        let result = async {
            self.check_ingest()?;
            self.check_indexing_for(kbid, resource).await?;
            self.check_processing(kbid).await
        }
        .await;
        if let Err(decision) = &result {
            self.inner.retry_after.entries.insert(key, decision.clone());
        }
        result
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.retry_after.stats()
    }

    async fn kb_nodes(&self, kbid: &str) -> Vec<String> {
        let key = kbid.to_string();
        if let Some(nodes) = self.inner.kb_nodes.get(&key) {
            return nodes;
        }
        let nodes = match self.read_shards(kbid).await {
            Some(shards) => shards
                .active_shard()
                .map(|shard| shard.replicas.clone())
                .unwrap_or_default(),
            None => Vec::new(),
        };
        self.inner.kb_nodes.insert(key, nodes.clone());
        nodes
    }

    async fn resource_nodes(&self, kbid: &str, uuid: &str) -> Vec<String> {
        let key = (kbid.to_string(), uuid.to_string());
        if let Some(nodes) = self.inner.resource_nodes.get(&key) {
            return nodes;
        }
        let shard_id = match self.read_resource_shard(kbid, uuid).await {
            Some(shard_id) => shard_id,
            // Not indexed yet: it will go to the active shard
            None => return self.kb_nodes(kbid).await,
        };
        let nodes = self
            .read_shards(kbid)
            .await
            .and_then(|shards| shards.find(&shard_id).map(|s| s.replicas.clone()))
            .unwrap_or_default();
        self.inner.resource_nodes.insert(key, nodes.clone());
        nodes
    }

    async fn read_shards(&self, kbid: &str) -> Option<ShardSet> {
        let mut txn = self.inner.driver.begin(true).await.ok()?;
        match txn.get_json::<ShardSet>(&keys::kb_shards(kbid)).await {
            Ok(shards) => shards,
            Err(e) => {
                warn!(kbid = %kbid, error = %e, "Failed to read shards");
                None
            }
        }
    }

    async fn read_resource_shard(&self, kbid: &str, uuid: &str) -> Option<String> {
        let mut txn = self.inner.driver.begin(true).await.ok()?;
        match txn.get(&keys::resource_shard(kbid, uuid)).await {
            Ok(value) => value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => {
                warn!(kbid = %kbid, uuid = %uuid, error = %e, "Failed to read resource shard");
                None
            }
        }
    }
}
