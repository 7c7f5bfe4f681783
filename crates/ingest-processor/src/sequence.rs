//! Per-partition ordering guard.
//!
//! Each transport partition has a watermark: the highest seqid whose
//! effects were committed. A message at or below the watermark has already
//! been applied (or skipped) and must not be applied again. The watermark is
//! advanced inside the same transaction as the data it covers, so a crash
//! can never leave data applied without its seqid recorded.

use tracing::{error, warn};

use ingest_storage::{keys, Driver, StorageError, Transaction};

use crate::error::ProcessorError;

/// What to do with an incoming seqid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Apply,
    /// Already covered by the watermark. `tail_retry` is the redelivery of
    /// the very last applied message.
    SkipDuplicate { last_seqid: i64, tail_retry: bool },
    /// Lost the race to another writer of the same partition.
    Violation(i64),
}

impl Decision {
    /// Whether a discard of this decision is the benign retry of the tail.
    pub fn is_tail_retry(&self, seqid: i64) -> bool {
        match self {
            Decision::Apply => false,
            Decision::SkipDuplicate { tail_retry, .. } => *tail_retry,
            Decision::Violation(last_seqid) => seqid == *last_seqid,
        }
    }

    /// Log a discarded message: WARN for a retry of the tail, ERROR otherwise.
    pub fn log_discard(&self, partition: &str, seqid: i64) {
        let last_seqid = match self {
            Decision::Apply => return,
            Decision::SkipDuplicate { last_seqid, .. } | Decision::Violation(last_seqid) => {
                *last_seqid
            }
        };
        log_discard_at(partition, seqid, last_seqid, self.is_tail_retry(seqid));
    }
}

/// Log a message discarded for ordering reasons.
pub fn log_discard(partition: &str, seqid: i64, last_seqid: i64) {
    log_discard_at(partition, seqid, last_seqid, seqid == last_seqid);
}

fn log_discard_at(partition: &str, seqid: i64, last_seqid: i64, tail_retry: bool) {
    if tail_retry {
        warn!(
            partition = %partition,
            seqid,
            last_seqid,
            "Retry of last applied message, skipping"
        );
    } else {
        error!(
            partition = %partition,
            seqid,
            last_seqid,
            "Sequence order violation, skipping"
        );
    }
}

fn decode_watermark(bytes: &[u8]) -> Result<i64, StorageError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| StorageError::Serialization("invalid seqid watermark".to_string()))
}

#[derive(Clone)]
pub struct SequenceGuard {
    driver: Driver,
}

impl SequenceGuard {
    pub fn new(driver: Driver) -> Self {
        Self { driver }
    }

    /// Last committed seqid of `partition`, if any.
    pub async fn last_seqid(&self, partition: &str) -> Result<Option<i64>, ProcessorError> {
        let mut txn = self.driver.begin(true).await?;
        let last = Self::read(&mut txn, partition).await?;
        txn.abort().await?;
        Ok(last)
    }

    async fn read(txn: &mut Transaction, partition: &str) -> Result<Option<i64>, ProcessorError> {
        match txn.get(&keys::txn_watermark(partition)).await? {
            Some(bytes) => Ok(Some(decode_watermark(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Decide whether `seqid` should be applied.
    pub async fn check(&self, partition: &str, seqid: i64) -> Result<Decision, ProcessorError> {
        if seqid < 1 {
            return Err(ProcessorError::InvalidInput(format!(
                "seqid must be >= 1, got {seqid}"
            )));
        }
        Ok(match self.last_seqid(partition).await? {
            Some(last_seqid) if seqid <= last_seqid => Decision::SkipDuplicate {
                last_seqid,
                tail_retry: seqid == last_seqid,
            },
            _ => Decision::Apply,
        })
    }

    /// Move the watermark to `seqid` within `txn`.
    ///
    /// Returns [`Decision::Violation`] without writing when the watermark
    /// already covers `seqid`.
    pub async fn advance(
        txn: &mut Transaction,
        partition: &str,
        seqid: i64,
    ) -> Result<Decision, ProcessorError> {
        if let Some(last_seqid) = Self::read(txn, partition).await? {
            if last_seqid >= seqid {
                return Ok(Decision::Violation(last_seqid));
            }
        }
        txn.set(&keys::txn_watermark(partition), seqid.to_string().into_bytes())
            .await?;
        Ok(Decision::Apply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn commit_advance(driver: &Driver, partition: &str, seqid: i64) -> Decision {
        let mut txn = driver.begin(false).await.unwrap();
        let decision = SequenceGuard::advance(&mut txn, partition, seqid).await.unwrap();
        if txn.has_writes() {
            txn.commit().await.unwrap();
        } else {
            txn.abort().await.unwrap();
        }
        decision
    }

    #[tokio::test]
    async fn test_check_without_watermark() {
        let guard = SequenceGuard::new(Driver::in_memory());
        assert_eq!(guard.last_seqid("1").await.unwrap(), None);
        assert_eq!(guard.check("1", 1).await.unwrap(), Decision::Apply);
    }

    #[tokio::test]
    async fn test_check_rejects_non_positive() {
        let guard = SequenceGuard::new(Driver::in_memory());
        assert!(matches!(
            guard.check("1", 0).await,
            Err(ProcessorError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicates_are_skipped() {
        let driver = Driver::in_memory();
        let guard = SequenceGuard::new(driver.clone());
        assert_eq!(commit_advance(&driver, "1", 5).await, Decision::Apply);

        assert_eq!(
            guard.check("1", 5).await.unwrap(),
            Decision::SkipDuplicate {
                last_seqid: 5,
                tail_retry: true
            }
        );
        assert_eq!(
            guard.check("1", 2).await.unwrap(),
            Decision::SkipDuplicate {
                last_seqid: 5,
                tail_retry: false
            }
        );
        assert_eq!(guard.check("1", 6).await.unwrap(), Decision::Apply);
        // Partitions are independent
        assert_eq!(guard.check("2", 1).await.unwrap(), Decision::Apply);
    }

    #[tokio::test]
    async fn test_advance_reports_violation() {
        let driver = Driver::in_memory();
        assert_eq!(commit_advance(&driver, "1", 3).await, Decision::Apply);
        assert_eq!(commit_advance(&driver, "1", 3).await, Decision::Violation(3));
        assert_eq!(commit_advance(&driver, "1", 2).await, Decision::Violation(3));

        let guard = SequenceGuard::new(driver);
        assert_eq!(guard.last_seqid("1").await.unwrap(), Some(3));
    }

    #[test]
    fn test_tail_retry_classification() {
        let tail = Decision::SkipDuplicate {
            last_seqid: 5,
            tail_retry: true,
        };
        let older = Decision::SkipDuplicate {
            last_seqid: 5,
            tail_retry: false,
        };
        assert!(tail.is_tail_retry(5));
        assert!(!older.is_tail_retry(2));
        assert!(Decision::Violation(4).is_tail_retry(4));
        assert!(!Decision::Violation(4).is_tail_retry(3));
        assert!(!Decision::Apply.is_tail_retry(1));
    }

    #[tokio::test]
    async fn test_concurrent_advance_conflicts() {
        let driver = Driver::in_memory();
        let mut first = driver.begin(false).await.unwrap();
        let mut second = driver.begin(false).await.unwrap();
        SequenceGuard::advance(&mut first, "1", 4).await.unwrap();
        SequenceGuard::advance(&mut second, "1", 4).await.unwrap();
        first.commit().await.unwrap();
        assert!(second.commit().await.unwrap_err().is_conflict());
    }
}
