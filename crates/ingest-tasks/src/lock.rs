//! Leased locks held in the metadata store.
//!
//! A lock is a JSON record `{holder, expires_at}` at `/internal/locks/{name}`.
//! Acquiring writes the record through an optimistic transaction, so two
//! processes racing for a free lock cannot both commit. While held, a
//! background task pushes `expires_at` forward; a crashed holder's lease
//! runs out after `ttl` and the lock becomes free again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ingest_storage::{keys, Driver};

use crate::error::TaskError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    holder: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    expires_at: DateTime<Utc>,
}

/// Lease timings.
#[derive(Debug, Clone, Copy)]
pub struct LockSettings {
    /// Lease length written on acquire and on every refresh
    pub ttl: Duration,
    pub refresh_interval: Duration,
    /// Give up acquiring after this long
    pub acquire_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct DistributedLock {
    driver: Driver,
    name: String,
    holder: String,
    settings: LockSettings,
}

impl DistributedLock {
    pub fn new(driver: Driver, name: impl Into<String>) -> Self {
        Self {
            driver,
            name: name.into(),
            holder: uuid::Uuid::new_v4().to_string(),
            settings: LockSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: LockSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Wait for the lock, polling until `acquire_timeout`.
    pub async fn acquire(self) -> Result<LockGuard, TaskError> {
        let started = tokio::time::Instant::now();
        loop {
            if self.try_take().await? {
                info!(lock = %self.name, holder = %self.holder, "Acquired lock");
                return Ok(self.into_guard());
            }
            let waited = started.elapsed();
            if waited >= self.settings.acquire_timeout {
                return Err(TaskError::LockTimeout {
                    name: self.name,
                    waited,
                });
            }
            debug!(lock = %self.name, "Lock busy, waiting");
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Single attempt. `false` when another live holder has it or a
    /// concurrent acquire won the race.
    async fn try_take(&self) -> Result<bool, TaskError> {
        write_lease(&self.driver, &self.name, &self.holder, self.settings.ttl, false).await
    }

    fn into_guard(self) -> LockGuard {
        let cancel = CancellationToken::new();
        let refresher = tokio::spawn(refresh_loop(
            self.driver.clone(),
            self.name.clone(),
            self.holder.clone(),
            self.settings,
            cancel.clone(),
        ));
        LockGuard {
            driver: self.driver,
            name: self.name,
            holder: self.holder,
            cancel,
            refresher: Some(refresher),
            released: false,
        }
    }
}

/// Write a lease for `holder` if the lock is free, expired or already ours.
/// With `must_hold`, only an existing lease of ours is extended.
async fn write_lease(
    driver: &Driver,
    name: &str,
    holder: &str,
    ttl: Duration,
    must_hold: bool,
) -> Result<bool, TaskError> {
    let key = keys::lock(name);
    let now = Utc::now();
    let mut txn = driver.begin(false).await?;
    let current: Option<LockRecord> = txn.get_json(&key).await?;
    let ours = current.as_ref().is_some_and(|r| r.holder == holder);
    let free = current.as_ref().map_or(true, |r| r.expires_at <= now);
    if !(ours || (!must_hold && free)) {
        txn.abort().await?;
        return Ok(false);
    }

    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30));
    let record = LockRecord {
        holder: holder.to_string(),
        expires_at: now + ttl,
    };
    txn.set_json(&key, &record).await?;
    match txn.commit().await {
        Ok(()) => Ok(true),
        Err(e) if e.is_conflict() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn refresh_loop(
    driver: Driver,
    name: String,
    holder: String,
    settings: LockSettings,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(settings.refresh_interval) => {}
        }
        match write_lease(&driver, &name, &holder, settings.ttl, true).await {
            Ok(true) => debug!(lock = %name, "Refreshed lock"),
            Ok(false) => {
                warn!(lock = %name, holder = %holder, "Lost lock lease");
                return;
            }
            Err(e) => warn!(lock = %name, error = %e, "Failed to refresh lock"),
        }
    }
}

async fn delete_lease(driver: &Driver, name: &str, holder: &str) -> Result<(), TaskError> {
    let key = keys::lock(name);
    let mut txn = driver.begin(false).await?;
    let current: Option<LockRecord> = txn.get_json(&key).await?;
    if current.is_some_and(|r| r.holder == holder) {
        txn.delete(&key).await?;
        txn.commit().await?;
    } else {
        txn.abort().await?;
    }
    Ok(())
}

/// A held lock. Released explicitly with [`LockGuard::release`]; dropping
/// the guard releases it in the background.
pub struct LockGuard {
    driver: Driver,
    name: String,
    holder: String,
    cancel: CancellationToken,
    refresher: Option<JoinHandle<()>>,
    released: bool,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn release(mut self) -> Result<(), TaskError> {
        self.cancel.cancel();
        if let Some(refresher) = self.refresher.take() {
            let _ = refresher.await;
        }
        self.released = true;
        delete_lease(&self.driver, &self.name, &self.holder).await?;
        info!(lock = %self.name, "Released lock");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let driver = self.driver.clone();
        let name = std::mem::take(&mut self.name);
        let holder = std::mem::take(&mut self.holder);
        runtime.spawn(async move {
            if let Err(e) = delete_lease(&driver, &name, &holder).await {
                warn!(lock = %name, error = %e, "Failed to release dropped lock");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> LockSettings {
        LockSettings {
            ttl: Duration::from_millis(300),
            refresh_interval: Duration::from_millis(50),
            acquire_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_exclusive_until_released() {
        let driver = Driver::in_memory();
        let guard = DistributedLock::new(driver.clone(), "migrations")
            .with_settings(fast())
            .acquire()
            .await
            .unwrap();

        let err = DistributedLock::new(driver.clone(), "migrations")
            .with_settings(fast())
            .acquire()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TaskError::LockTimeout { .. }));

        // Different names never block each other
        let other = DistributedLock::new(driver.clone(), "migration-kb1")
            .with_settings(fast())
            .acquire()
            .await
            .unwrap();
        other.release().await.unwrap();

        guard.release().await.unwrap();
        let again = DistributedLock::new(driver.clone(), "migrations")
            .with_settings(fast())
            .acquire()
            .await
            .unwrap();
        again.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_outlives_ttl() {
        let driver = Driver::in_memory();
        let guard = DistributedLock::new(driver.clone(), "l")
            .with_settings(fast())
            .acquire()
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let contender = DistributedLock::new(driver.clone(), "l")
            .with_settings(fast())
            .acquire()
            .await;
        assert!(contender.is_err());
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let driver = Driver::in_memory();
        let mut txn = driver.begin(false).await.unwrap();
        txn.set_json(
            &keys::lock("l"),
            &LockRecord {
                holder: "crashed".into(),
                expires_at: Utc::now() - chrono::Duration::seconds(1),
            },
        )
        .await
        .unwrap();
        txn.commit().await.unwrap();

        let guard = DistributedLock::new(driver.clone(), "l")
            .with_settings(fast())
            .acquire()
            .await
            .unwrap();
        guard.release().await.unwrap();

        let mut txn = driver.begin(true).await.unwrap();
        assert!(txn.get(&keys::lock("l")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drop_releases_in_background() {
        let driver = Driver::in_memory();
        let guard = DistributedLock::new(driver.clone(), "l")
            .with_settings(fast())
            .acquire()
            .await
            .unwrap();
        assert_eq!(guard.name(), "l");
        drop(guard);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut txn = driver.begin(true).await.unwrap();
        assert!(txn.get(&keys::lock("l")).await.unwrap().is_none());
    }
}
