//! Background task machinery for kb-ingest.
//!
//! - [`TaskStore`]: task metadata records in the metadata store
//! - [`TaskRetryHandler`]: bounded retries with terminal-state bookkeeping
//!   for exports, imports and migrations
//! - [`DistributedLock`]: leased locks shared between processes
//! - [`Migrator`]: global and per-KB versioned migrations

pub mod error;
pub mod lock;
pub mod migrations;
pub mod migrator;
pub mod retry;
pub mod store;

pub use error::TaskError;
pub use lock::{DistributedLock, LockGuard, LockSettings};
pub use migrator::{GlobalMigrationInfo, Migration, Migrator, MIGRATIONS_LOCK};
pub use retry::TaskRetryHandler;
pub use store::TaskStore;
