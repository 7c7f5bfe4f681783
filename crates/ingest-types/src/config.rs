//! Configuration loading for kb-ingest.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! Default config file lives at `~/.config/kb-ingest/config.toml`.

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::IngestError;

const APP_NAME: &str = "kb-ingest";

/// Metadata store backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KvBackendKind {
    /// RocksDB on disk (default)
    #[default]
    Rocks,
    /// Process-local map, lost on restart
    Memory,
}

/// Shard lock ordering strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockStrategy {
    Fifo,
    #[default]
    Priority,
}

/// Transport consumer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSettings {
    /// Stream name on the transport
    #[serde(default = "default_stream")]
    pub stream: String,

    /// Subject prefix; the partition subject is `{prefix}.{partition}`
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    /// Subject processed messages are published to by pull workers
    #[serde(default = "default_processed_subject")]
    pub processed_subject: String,

    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,

    #[serde(default = "default_max_deliver")]
    pub max_deliver: u32,

    /// Sleep before a NAK on transient failures
    #[serde(default = "default_nak_delay_ms")]
    pub nak_delay_ms: u64,

    /// In-process retries of store conflicts before giving up
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

fn default_stream() -> String {
    "kb-ingest".to_string()
}

fn default_subject_prefix() -> String {
    "ingest".to_string()
}

fn default_processed_subject() -> String {
    "ingest-processed".to_string()
}

fn default_ack_wait_secs() -> u64 {
    60
}

fn default_max_deliver() -> u32 {
    10_000
}

fn default_nak_delay_ms() -> u64 {
    1_000
}

fn default_max_conflict_retries() -> u32 {
    4
}

fn default_fetch_timeout_ms() -> u64 {
    1_000
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            stream: default_stream(),
            subject_prefix: default_subject_prefix(),
            processed_subject: default_processed_subject(),
            ack_wait_secs: default_ack_wait_secs(),
            max_deliver: default_max_deliver(),
            nak_delay_ms: default_nak_delay_ms(),
            max_conflict_retries: default_max_conflict_retries(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl ConsumerSettings {
    pub fn subject(&self, partition: &str) -> String {
        format!("{}.{}", self.subject_prefix, partition)
    }

    pub fn durable(&self, partition: &str) -> String {
        format!("{}-{}", self.subject_prefix, partition)
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }

    /// Interval between in-progress heartbeats: two thirds of `ack_wait`.
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.ack_wait_secs * 660)
    }

    pub fn nak_delay(&self) -> Duration {
        Duration::from_millis(self.nak_delay_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Processing engine pull settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullSettings {
    /// Base URL of the processing engine; pull workers are disabled when unset
    #[serde(default)]
    pub processing_url: Option<String>,

    /// Service account key (loaded from env var, never written back)
    #[serde(default, skip_serializing)]
    pub service_account: Option<String>,

    /// Cursor namespace
    #[serde(default = "default_pull_type_id")]
    pub pull_type_id: String,

    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,

    #[serde(default = "default_empty_backoff_ms")]
    pub empty_backoff_ms: u64,

    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,

    /// Largest payload published inline; bigger ones go through blob storage
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

fn default_pull_type_id() -> String {
    "main".to_string()
}

fn default_error_backoff_secs() -> u64 {
    30
}

fn default_empty_backoff_ms() -> u64 {
    5_000
}

fn default_api_timeout_secs() -> u64 {
    60
}

fn default_max_message_size() -> usize {
    1024 * 1024
}

impl Default for PullSettings {
    fn default() -> Self {
        Self {
            processing_url: None,
            service_account: None,
            pull_type_id: default_pull_type_id(),
            error_backoff_secs: default_error_backoff_secs(),
            empty_backoff_ms: default_empty_backoff_ms(),
            api_timeout_secs: default_api_timeout_secs(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl PullSettings {
    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn empty_backoff(&self) -> Duration {
        Duration::from_millis(self.empty_backoff_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

/// Back pressure thresholds and estimation rates.
///
/// A `max_*_pending` of zero or less disables that check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackPressureSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Messages per second an index node drains
    #[serde(default = "default_indexing_rate")]
    pub indexing_rate: f64,

    #[serde(default = "default_ingest_rate")]
    pub ingest_rate: f64,

    #[serde(default = "default_processing_rate")]
    pub processing_rate: f64,

    #[serde(default = "default_max_pending")]
    pub max_indexing_pending: i64,

    #[serde(default = "default_max_pending")]
    pub max_ingest_pending: i64,

    #[serde(default = "default_max_pending")]
    pub max_processing_pending: i64,

    /// Upper bound of any try-after estimate, in seconds
    #[serde(default = "default_max_wait_time")]
    pub max_wait_time: u64,

    #[serde(default = "default_check_interval")]
    pub indexing_check_interval: u64,

    #[serde(default = "default_check_interval")]
    pub ingest_check_interval: u64,
}

fn default_indexing_rate() -> f64 {
    10.0
}

fn default_ingest_rate() -> f64 {
    4.0
}

fn default_processing_rate() -> f64 {
    1.0
}

fn default_max_pending() -> i64 {
    1_000
}

fn default_max_wait_time() -> u64 {
    60
}

fn default_check_interval() -> u64 {
    30
}

impl Default for BackPressureSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            indexing_rate: default_indexing_rate(),
            ingest_rate: default_ingest_rate(),
            processing_rate: default_processing_rate(),
            max_indexing_pending: default_max_pending(),
            max_ingest_pending: default_max_pending(),
            max_processing_pending: default_max_pending(),
            max_wait_time: default_max_wait_time(),
            indexing_check_interval: default_check_interval(),
            ingest_check_interval: default_check_interval(),
        }
    }
}

impl BackPressureSettings {
    pub fn validate(&self) -> Result<(), String> {
        for (name, rate) in [
            ("indexing_rate", self.indexing_rate),
            ("ingest_rate", self.ingest_rate),
            ("processing_rate", self.processing_rate),
        ] {
            if rate <= 0.0 {
                return Err(format!("{name} must be > 0, got {rate}"));
            }
        }
        if self.indexing_check_interval == 0 || self.ingest_check_interval == 0 {
            return Err("check intervals must be > 0".to_string());
        }
        Ok(())
    }
}

/// Shard indexing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingSettings {
    #[serde(default)]
    pub lock_strategy: LockStrategy,

    /// Concurrent index operations dispatched in the background
    #[serde(default = "default_indexing_concurrency")]
    pub max_concurrent: usize,

    /// Index node ids; new knowledge boxes get one replica on each
    #[serde(default = "default_index_nodes")]
    pub index_nodes: Vec<String>,
}

fn default_indexing_concurrency() -> usize {
    16
}

fn default_index_nodes() -> Vec<String> {
    vec!["node-0".to_string()]
}

impl Default for IndexingSettings {
    fn default() -> Self {
        Self {
            lock_strategy: LockStrategy::default(),
            max_concurrent: default_indexing_concurrency(),
            index_nodes: default_index_nodes(),
        }
    }
}

/// Task retry and migration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSettings {
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,

    #[serde(default = "default_max_concurrent_migrations")]
    pub max_concurrent_migrations: usize,

    /// Bytes per chunk when streaming export binaries
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_max_tries() -> u32 {
    5
}

fn default_max_concurrent_migrations() -> usize {
    5
}

fn default_chunk_size() -> usize {
    512 * 1024
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            max_concurrent_migrations: default_max_concurrent_migrations(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to RocksDB storage directory
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub kv_backend: KvBackendKind,

    /// Root directory of local blob storage
    #[serde(default = "default_blob_path")]
    pub blob_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Transport partitions this process consumes
    #[serde(default = "default_partitions")]
    pub partitions: Vec<String>,

    /// Single-process deployment: local processing, serial migrations
    #[serde(default)]
    pub standalone: bool,

    #[serde(default)]
    pub consumer: ConsumerSettings,

    #[serde(default)]
    pub pull: PullSettings,

    #[serde(default)]
    pub back_pressure: BackPressureSettings,

    #[serde(default)]
    pub indexing: IndexingSettings,

    #[serde(default)]
    pub tasks: TaskSettings,
}

fn default_db_path() -> String {
    ProjectDirs::from("", "", APP_NAME)
        .map(|p| p.data_local_dir().join("db"))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .to_string()
}

fn default_blob_path() -> String {
    ProjectDirs::from("", "", APP_NAME)
        .map(|p| p.data_local_dir().join("blobs"))
        .unwrap_or_else(|| PathBuf::from("./blobs"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_partitions() -> Vec<String> {
    vec!["1".to_string()]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            kv_backend: KvBackendKind::default(),
            blob_path: default_blob_path(),
            log_level: default_log_level(),
            partitions: default_partitions(),
            standalone: false,
            consumer: ConsumerSettings::default(),
            pull: PullSettings::default(),
            back_pressure: BackPressureSettings::default(),
            indexing: IndexingSettings::default(),
            tasks: TaskSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered configuration.
    ///
    /// Precedence (lowest to highest):
    /// 1. Built-in defaults
    /// 2. ~/.config/kb-ingest/config.toml
    /// 3. CLI-specified config file
    /// 4. Environment variables (INGEST_*, `__` between nested keys)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, IngestError> {
        let config_dir = ProjectDirs::from("", "", APP_NAME)
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("db_path", default_db_path())
            .map_err(|e| IngestError::Config(e.to_string()))?
            .set_default("blob_path", default_blob_path())
            .map_err(|e| IngestError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| IngestError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // INGEST_LOG_LEVEL, INGEST_BACK_PRESSURE__ENABLED, INGEST_PARTITIONS=1,2 ...
        builder = builder.add_source(
            Environment::with_prefix("INGEST")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("partitions")
                .with_list_parse_key("indexing.index_nodes")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| IngestError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| IngestError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.partitions.is_empty() {
            return Err(IngestError::Config(
                "at least one partition is required".to_string(),
            ));
        }
        if self.tasks.max_tries == 0 {
            return Err(IngestError::Config("tasks.max_tries must be > 0".to_string()));
        }
        if self.tasks.chunk_size == 0 {
            return Err(IngestError::Config("tasks.chunk_size must be > 0".to_string()));
        }
        if self.indexing.index_nodes.is_empty() {
            return Err(IngestError::Config(
                "indexing.index_nodes must not be empty".to_string(),
            ));
        }
        self.back_pressure
            .validate()
            .map_err(IngestError::Config)?;
        Ok(())
    }

    /// Concurrency allowed for knowledge box migrations.
    pub fn migration_concurrency(&self) -> usize {
        if self.standalone {
            1
        } else {
            self.tasks.max_concurrent_migrations.max(1)
        }
    }
}
