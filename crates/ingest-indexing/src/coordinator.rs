//! Per-shard mutual exclusion with optional priority ordering.
//!
//! At most one task holds a given shard at a time; different shards never
//! block each other. Waiters queue per shard and are granted in arrival
//! order (FIFO) or by descending [`Priority`] with arrival order among
//! equals. Priority only reorders the queue; it never preempts a holder.
//!
//! Grants are [`ShardLease`] guards. Dropping a lease releases the shard,
//! so it is released on every exit path, including task cancellation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::trace;

use ingest_types::LockStrategy;

use crate::error::IndexingError;

/// Scheduling priority of a shard request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    High,
}

/// Queue position: lower sorts first.
type WaiterKey = (u8, u64);

#[derive(Default)]
struct ShardState {
    held: bool,
    waiters: BTreeMap<WaiterKey, oneshot::Sender<()>>,
}

struct Inner {
    strategy: LockStrategy,
    shards: DashMap<String, ShardState>,
    next_seq: AtomicU64,
}

impl Inner {
    fn waiter_key(&self, priority: Priority) -> WaiterKey {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let rank = match (self.strategy, priority) {
            (LockStrategy::Fifo, _) => 0,
            (LockStrategy::Priority, Priority::High) => 0,
            (LockStrategy::Priority, Priority::Low) => 1,
        };
        (rank, seq)
    }

    /// Hand the shard to the next live waiter, or mark it idle.
    fn release_shard(&self, shard_id: &str) {
        let mut idle = false;
        if let Some(mut state) = self.shards.get_mut(shard_id) {
            loop {
                match state.waiters.pop_first() {
                    Some((_, tx)) => {
                        if tx.send(()).is_ok() {
                            trace!(shard = %shard_id, "Shard handed to next waiter");
                            return;
                        }
                    }
                    None => {
                        state.held = false;
                        idle = true;
                        break;
                    }
                }
            }
        }
        if idle {
            self.shards
                .remove_if(shard_id, |_, state| !state.held && state.waiters.is_empty());
            trace!(shard = %shard_id, "Shard idle");
        }
    }
}

/// Shard lock table. Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct ShardCoordinator {
    inner: Arc<Inner>,
}

impl ShardCoordinator {
    pub fn new(strategy: LockStrategy) -> Self {
        Self {
            inner: Arc::new(Inner {
                strategy,
                shards: DashMap::new(),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn strategy(&self) -> LockStrategy {
        self.inner.strategy
    }

    /// Wait until `shard_id` is granted to the caller.
    pub async fn request_shard(
        &self,
        shard_id: &str,
        priority: Priority,
    ) -> Result<ShardLease, IndexingError> {
        let (key, rx) = {
            let mut state = self.inner.shards.entry(shard_id.to_string()).or_default();
            if !state.held {
                state.held = true;
                return Ok(ShardLease::new(Arc::clone(&self.inner), shard_id, priority));
            }
            let key = self.inner.waiter_key(priority);
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(key, tx);
            (key, rx)
        };

        let mut pending = PendingGrant {
            inner: Arc::clone(&self.inner),
            shard_id: shard_id.to_string(),
            key,
            rx,
            resolved: false,
        };
        let granted = (&mut pending.rx).await;
        pending.resolved = true;
        match granted {
            Ok(()) => Ok(ShardLease::new(Arc::clone(&self.inner), shard_id, priority)),
            Err(_) => Err(IndexingError::LockAbandoned(shard_id.to_string())),
        }
    }

    pub fn is_held(&self, shard_id: &str) -> bool {
        self.inner
            .shards
            .get(shard_id)
            .map(|s| s.held)
            .unwrap_or(false)
    }

    /// Number of tasks queued behind the holder of `shard_id`.
    pub fn waiting(&self, shard_id: &str) -> usize {
        self.inner
            .shards
            .get(shard_id)
            .map(|s| s.waiters.len())
            .unwrap_or(0)
    }

    /// Number of shards with a holder or waiters.
    pub fn active_shards(&self) -> usize {
        self.inner.shards.len()
    }
}

/// A queued request. If dropped before the grant was observed, it either
/// leaves the queue or, when the grant already happened, passes it on.
struct PendingGrant {
    inner: Arc<Inner>,
    shard_id: String,
    key: WaiterKey,
    rx: oneshot::Receiver<()>,
    resolved: bool,
}

impl Drop for PendingGrant {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        // Grants are sent under the entry lock, so once we hold it a
        // missing queue entry means the grant is sitting in our channel.
        let granted = match self.inner.shards.get_mut(&self.shard_id) {
            Some(mut state) => state.waiters.remove(&self.key).is_none(),
            None => false,
        };
        if granted {
            self.rx.close();
            trace!(shard = %self.shard_id, "Cancelled waiter passing grant on");
            self.inner.release_shard(&self.shard_id);
        } else {
            self.inner.shards.remove_if(&self.shard_id, |_, state| {
                !state.held && state.waiters.is_empty()
            });
        }
    }
}

/// Exclusive hold on one shard; released on drop.
pub struct ShardLease {
    inner: Arc<Inner>,
    shard_id: String,
    priority: Priority,
}

impl ShardLease {
    fn new(inner: Arc<Inner>, shard_id: &str, priority: Priority) -> Self {
        Self {
            inner,
            shard_id: shard_id.to_string(),
            priority,
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

impl Drop for ShardLease {
    fn drop(&mut self) {
        self.inner.release_shard(&self.shard_id);
    }
}

impl std::fmt::Debug for ShardLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardLease")
            .field("shard_id", &self.shard_id)
            .field("priority", &self.priority)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn wait_for_waiters(coordinator: &ShardCoordinator, shard: &str, n: usize) {
        for _ in 0..200 {
            if coordinator.waiting(shard) == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} waiters on {shard}");
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Low < Priority::High);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion() {
        let coordinator = ShardCoordinator::new(LockStrategy::Fifo);
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let coordinator = coordinator.clone();
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _lease = coordinator.request_shard("shard-1", Priority::Low).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.active_shards(), 0);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let coordinator = ShardCoordinator::new(LockStrategy::Fifo);
        let holder = coordinator.request_shard("s", Priority::Low).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for (i, priority) in [Priority::Low, Priority::High, Priority::Low].into_iter().enumerate() {
            let waiter = coordinator.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _lease = waiter.request_shard("s", priority).await.unwrap();
                tx.send(i).unwrap();
            });
            wait_for_waiters(&coordinator, "s", i + 1).await;
        }

        drop(holder);
        let order: Vec<usize> = vec![
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ];
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_priority_waiters_jump_queue() {
        let coordinator = ShardCoordinator::new(LockStrategy::Priority);
        let holder = coordinator.request_shard("s", Priority::Low).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let requests = [("a", Priority::Low), ("b", Priority::Low), ("c", Priority::High)];
        for (i, (name, priority)) in requests.into_iter().enumerate() {
            let waiter = coordinator.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _lease = waiter.request_shard("s", priority).await.unwrap();
                tx.send(name).unwrap();
            });
            wait_for_waiters(&coordinator, "s", i + 1).await;
        }

        // The holder is never preempted
        assert!(coordinator.is_held("s"));
        drop(holder);

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap());
        }
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_shards_do_not_block_each_other() {
        let coordinator = ShardCoordinator::new(LockStrategy::Priority);
        let _held = coordinator.request_shard("s1", Priority::High).await.unwrap();

        let other = tokio::time::timeout(
            Duration::from_millis(100),
            coordinator.request_shard("s2", Priority::Low),
        )
        .await
        .expect("s2 must not wait for s1")
        .unwrap();
        assert_eq!(other.shard_id(), "s2");
        assert_eq!(coordinator.active_shards(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let coordinator = ShardCoordinator::new(LockStrategy::Fifo);
        let holder = coordinator.request_shard("s", Priority::Low).await.unwrap();

        let cancelled = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let _lease = coordinator.request_shard("s", Priority::Low).await.unwrap();
            })
        };
        wait_for_waiters(&coordinator, "s", 1).await;
        cancelled.abort();
        let _ = cancelled.await;
        assert_eq!(coordinator.waiting("s"), 0);

        drop(holder);
        assert!(!coordinator.is_held("s"));
        assert_eq!(coordinator.active_shards(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_after_grant_passes_lock_on() {
        let coordinator = ShardCoordinator::new(LockStrategy::Fifo);
        let holder = coordinator.request_shard("s", Priority::Low).await.unwrap();

        let mut request = Box::pin(coordinator.request_shard("s", Priority::Low));
        assert!(futures::poll!(&mut request).is_pending());
        assert_eq!(coordinator.waiting("s"), 1);

        // Grant goes to the queued request, which is then dropped unobserved
        drop(holder);
        assert!(coordinator.is_held("s"));
        drop(request);

        assert!(!coordinator.is_held("s"));
        let lease = tokio::time::timeout(
            Duration::from_millis(100),
            coordinator.request_shard("s", Priority::Low),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(lease.priority(), Priority::Low);
    }
}
