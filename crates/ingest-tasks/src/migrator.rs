//! Versioned data migrations for the whole deployment and for each
//! knowledge box.
//!
//! A run holds the `migrations` lock. It records the target version
//! globally before touching any KB, migrates every KB (bounded
//! concurrency, each under its own `migration-{kbid}` lock), then runs the
//! global steps and clears the target. A run interrupted halfway leaves the
//! target in place and the next run finishes it before looking for newer
//! migrations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ingest_processor::knowledgebox;
use ingest_storage::{keys, Driver};
use ingest_types::Settings;

use crate::error::TaskError;
use crate::lock::{DistributedLock, LockSettings};
use crate::migrations;

pub const MIGRATIONS_LOCK: &str = "migrations";

/// Pause between runs of [`Migrator::run_forever`].
pub const RUN_FOREVER_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// One versioned migration. Both steps default to no-ops; each must be
/// safe to run again after a partial failure.
#[async_trait]
pub trait Migration: Send + Sync {
    fn version(&self) -> u32;

    fn name(&self) -> &str;

    /// Deployment-wide step, run after every KB is migrated.
    async fn migrate(&self, _driver: &Driver) -> Result<(), TaskError> {
        Ok(())
    }

    async fn migrate_kb(&self, _driver: &Driver, _kbid: &str) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Global migration state at `/internal/migrations/global`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalMigrationInfo {
    pub current_version: u32,
    /// Set while a run is in progress
    #[serde(default)]
    pub target_version: Option<u32>,
}

pub struct Migrator {
    driver: Driver,
    migrations: Vec<Arc<dyn Migration>>,
    max_concurrent: usize,
    lock_settings: LockSettings,
}

impl Migrator {
    pub fn new(driver: Driver, mut migrations: Vec<Arc<dyn Migration>>, max_concurrent: usize) -> Self {
        migrations.sort_by_key(|m| m.version());
        Self {
            driver,
            migrations,
            max_concurrent: max_concurrent.max(1),
            lock_settings: LockSettings::default(),
        }
    }

    /// The registered migrations with the configured concurrency.
    pub fn from_settings(driver: Driver, settings: &Settings) -> Self {
        Self::new(driver, migrations::registry(), settings.migration_concurrency())
    }

    pub fn with_lock_settings(mut self, settings: LockSettings) -> Self {
        self.lock_settings = settings;
        self
    }

    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map_or(0, |m| m.version())
    }

    pub async fn global_info(&self) -> Result<GlobalMigrationInfo, TaskError> {
        let mut txn = self.driver.begin(true).await?;
        Ok(txn
            .get_json(&keys::global_migration_version())
            .await?
            .unwrap_or_default())
    }

    /// Version a KB has been migrated to; 0 when never migrated.
    pub async fn kb_version(&self, kbid: &str) -> Result<u32, TaskError> {
        let mut txn = self.driver.begin(true).await?;
        Ok(txn
            .get_json(&keys::kb_migration_version(kbid))
            .await?
            .unwrap_or(0))
    }

    /// Migrate up to `target_version`, or to the latest registered version.
    pub async fn run(&self, target_version: Option<u32>) -> Result<(), TaskError> {
        let guard = DistributedLock::new(self.driver.clone(), MIGRATIONS_LOCK)
            .with_settings(self.lock_settings)
            .acquire()
            .await?;
        let result = self.run_locked(target_version).await;
        if let Err(e) = guard.release().await {
            warn!(error = %e, "Failed to release migrations lock");
        }
        result
    }

    /// Run every [`RUN_FOREVER_INTERVAL`] until cancelled. Failures are
    /// logged and retried on the next round.
    pub async fn run_forever(&self, cancel: CancellationToken) {
        loop {
            match self.run(None).await {
                Ok(()) => info!("Migrations up to date"),
                Err(e) => error!(error = %e, "Migration run failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Migrator stopping");
                    return;
                }
                _ = tokio::time::sleep(RUN_FOREVER_INTERVAL) => {}
            }
        }
    }

    async fn run_locked(&self, target_version: Option<u32>) -> Result<(), TaskError> {
        let info = self.global_info().await?;
        if target_version.is_none() {
            if let Some(unfinished) = info.target_version {
                info!(target_version = unfinished, "Finishing interrupted migration");
                self.migrate_to(unfinished).await?;
            }
        }

        let info = self.global_info().await?;
        let latest = self.latest_version();
        let target = target_version.unwrap_or(latest).min(latest);
        if target <= info.current_version {
            info!(current_version = info.current_version, "No migrations to run");
            return Ok(());
        }
        info!(
            current_version = info.current_version,
            target_version = target,
            "Running migrations"
        );
        self.migrate_to(target).await
    }

    async fn migrate_to(&self, target: u32) -> Result<(), TaskError> {
        self.update_global(|info| info.target_version = Some(target))
            .await?;
        self.run_kb_migrations(target).await?;
        self.run_global_migrations(target).await
    }

    fn between(&self, from: u32, to: u32) -> impl Iterator<Item = &Arc<dyn Migration>> {
        self.migrations
            .iter()
            .filter(move |m| m.version() > from && m.version() <= to)
    }

    async fn run_kb_migrations(&self, target: u32) -> Result<(), TaskError> {
        let kbids = {
            let mut txn = self.driver.begin(true).await?;
            knowledgebox::list_kbids(&mut txn).await?
        };
        let total = kbids.len();
        let semaphore = Semaphore::new(self.max_concurrent);

        let results = futures::future::join_all(kbids.iter().map(|kbid| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| TaskError::Migration(e.to_string()))?;
                self.migrate_kb(kbid, target).await
            }
        }))
        .await;

        let mut failures = 0;
        for (kbid, result) in kbids.iter().zip(results) {
            if let Err(e) = result {
                error!(kbid = %kbid, error = %e, "Knowledge box migration failed");
                failures += 1;
            }
        }
        if failures > 0 {
            return Err(TaskError::Migration(format!(
                "{failures} of {total} knowledge box migrations failed"
            )));
        }
        Ok(())
    }

    async fn migrate_kb(&self, kbid: &str, target: u32) -> Result<(), TaskError> {
        let guard = DistributedLock::new(self.driver.clone(), format!("migration-{kbid}"))
            .with_settings(self.lock_settings)
            .acquire()
            .await?;
        let result = self.migrate_kb_locked(kbid, target).await;
        if let Err(e) = guard.release().await {
            warn!(kbid = %kbid, error = %e, "Failed to release KB migration lock");
        }
        result
    }

    async fn migrate_kb_locked(&self, kbid: &str, target: u32) -> Result<(), TaskError> {
        let mut txn = self.driver.begin(false).await?;
        if !knowledgebox::exists(&mut txn, kbid).await? {
            warn!(kbid = %kbid, "Knowledge box gone, dropping its migration state");
            txn.delete(&keys::kb_migration_version(kbid)).await?;
            txn.commit().await?;
            return Ok(());
        }
        let current: u32 = txn
            .get_json(&keys::kb_migration_version(kbid))
            .await?
            .unwrap_or(0);
        txn.abort().await?;

        for migration in self.between(current, target) {
            migration.migrate_kb(&self.driver, kbid).await?;
            let mut txn = self.driver.begin(false).await?;
            txn.set_json(&keys::kb_migration_version(kbid), &migration.version())
                .await?;
            txn.commit().await?;
            info!(
                kbid = %kbid,
                version = migration.version(),
                migration = migration.name(),
                "Migrated knowledge box"
            );
        }
        Ok(())
    }

    async fn run_global_migrations(&self, target: u32) -> Result<(), TaskError> {
        let current = self.global_info().await?.current_version;
        for migration in self.between(current, target) {
            migration.migrate(&self.driver).await?;
            let version = migration.version();
            self.update_global(|info| info.current_version = version)
                .await?;
            info!(version, migration = migration.name(), "Applied global migration");
        }
        self.update_global(|info| {
            info.current_version = info.current_version.max(target);
            info.target_version = None;
        })
        .await
    }

    async fn update_global<F>(&self, update: F) -> Result<(), TaskError>
    where
        F: FnOnce(&mut GlobalMigrationInfo),
    {
        let key = keys::global_migration_version();
        let mut txn = self.driver.begin(false).await?;
        let mut info: GlobalMigrationInfo = txn.get_json(&key).await?.unwrap_or_default();
        update(&mut info);
        txn.set_json(&key, &info).await?;
        txn.commit().await?;
        Ok(())
    }
}
