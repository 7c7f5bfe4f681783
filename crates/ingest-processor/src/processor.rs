//! Application of broker messages to the metadata store.
//!
//! A message is applied in one transaction that also advances the partition
//! watermark. Index messages are dispatched only after the commit succeeds,
//! so an index node never sees data the store rolled back.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use ingest_indexing::ShardIndexer;
use ingest_storage::{BlobStorage, Driver, Transaction};
use ingest_types::{BrokerMessage, IndexMessage, MessageSource, MessageType, ShardObject};

use crate::error::ProcessorError;
use crate::index_message::build_index_message;
use crate::knowledgebox;
use crate::notifications::{Notification, Notifier, WriteType};
use crate::resource::{self, Resource};
use crate::sequence::{Decision, SequenceGuard};

/// Result of processing one broker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Applied {
        kbid: String,
        uuid: String,
        write_type: WriteType,
    },
    /// Already covered by the partition watermark.
    SkippedDuplicate { last_seqid: i64 },
    /// Nothing changed; the transaction was aborted.
    Unmodified,
    /// The knowledge box is gone; only the watermark moved.
    KnowledgeBoxDeleted,
    RolledBack,
}

/// What an AUTOCOMMIT transaction decided before commit.
enum Staged {
    Commit {
        uuid: String,
        write_type: WriteType,
        shard: ShardObject,
        index_message: IndexMessage,
    },
    KnowledgeBoxDeleted,
    /// A processor message for a resource that no longer exists.
    MissingResource { uuid: String },
    Unmodified,
}

#[derive(Clone)]
pub struct Processor {
    driver: Driver,
    blob: Arc<dyn BlobStorage>,
    indexer: ShardIndexer,
    notifier: Notifier,
}

impl Processor {
    pub fn new(
        driver: Driver,
        blob: Arc<dyn BlobStorage>,
        indexer: ShardIndexer,
        notifier: Notifier,
    ) -> Self {
        Self {
            driver,
            blob,
            indexer,
            notifier,
        }
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn blob(&self) -> &Arc<dyn BlobStorage> {
        &self.blob
    }

    pub fn indexer(&self) -> &ShardIndexer {
        &self.indexer
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn sequence_guard(&self) -> SequenceGuard {
        SequenceGuard::new(self.driver.clone())
    }

    /// Apply a message received from the ordered transport.
    ///
    /// With `transaction_check` the partition watermark is consulted before
    /// and advanced inside the transaction. Unexpected failures of an
    /// AUTOCOMMIT are deadlettered and surface as
    /// [`ProcessorError::Deadlettered`].
    #[instrument(skip(self, message), fields(kbid = %message.kbid, uuid = %message.uuid))]
    pub async fn process(
        &self,
        message: &BrokerMessage,
        seqid: i64,
        partition: &str,
        transaction_check: bool,
    ) -> Result<ProcessOutcome, ProcessorError> {
        self.process_inner(message, seqid, partition, transaction_check, true)
            .await
    }

    /// Apply a message outside the transport (imports, tools). No ordering
    /// checks and no deadletter: the original error is returned.
    pub async fn process_direct(&self, message: &BrokerMessage) -> Result<ProcessOutcome, ProcessorError> {
        if !self.knowledgebox_exists(&message.kbid).await? {
            return Err(ProcessorError::KnowledgeBoxNotFound(message.kbid.clone()));
        }
        self.process_inner(message, 0, "", false, false).await
    }

    async fn knowledgebox_exists(&self, kbid: &str) -> Result<bool, ProcessorError> {
        let mut txn = self.driver.begin(true).await?;
        let exists = knowledgebox::exists(&mut txn, kbid).await?;
        txn.abort().await?;
        Ok(exists)
    }

    async fn process_inner(
        &self,
        message: &BrokerMessage,
        seqid: i64,
        partition: &str,
        transaction_check: bool,
        deadletter: bool,
    ) -> Result<ProcessOutcome, ProcessorError> {
        if transaction_check {
            let decision = self.sequence_guard().check(partition, seqid).await?;
            if let Decision::SkipDuplicate { last_seqid, .. } | Decision::Violation(last_seqid) =
                decision
            {
                decision.log_discard(partition, seqid);
                return Ok(ProcessOutcome::SkippedDuplicate { last_seqid });
            }
        }

        match message.message_type() {
            MessageType::Delete => {
                self.delete_resource(message, seqid, partition, transaction_check)
                    .await
            }
            MessageType::Rollback => {
                info!(seqid, partition = %partition, "Rollback message, nothing to apply");
                self.notify(message, seqid, partition, &message.uuid, WriteType::Aborted);
                Ok(ProcessOutcome::RolledBack)
            }
            MessageType::Autocommit => {
                match self
                    .autocommit(message, seqid, partition, transaction_check)
                    .await
                {
                    Ok(outcome) => Ok(outcome),
                    Err(e) if !deadletter || e.bypasses_deadletter() => Err(e),
                    Err(e) => self.deadletter(message, seqid, partition, e).await,
                }
            }
        }
    }

    async fn delete_resource(
        &self,
        message: &BrokerMessage,
        seqid: i64,
        partition: &str,
        transaction_check: bool,
    ) -> Result<ProcessOutcome, ProcessorError> {
        let mut txn = self.driver.begin(false).await?;
        match self
            .delete_in_txn(&mut txn, message, seqid, partition, transaction_check)
            .await
        {
            Ok(deleted) => {
                if txn.has_writes() {
                    txn.commit().await?;
                } else {
                    txn.abort().await?;
                }
                match deleted {
                    Some(uuid) => {
                        match self.blob.delete_resource_files(&message.kbid, &uuid).await {
                            Ok(0) => {}
                            Ok(count) => debug!(kbid = %message.kbid, uuid = %uuid, count, "Deleted resource binaries"),
                            Err(e) => warn!(kbid = %message.kbid, uuid = %uuid, error = %e, "Failed to delete resource binaries"),
                        }
                        self.notify(message, seqid, partition, &uuid, WriteType::Deleted);
                        Ok(ProcessOutcome::Applied {
                            kbid: message.kbid.clone(),
                            uuid,
                            write_type: WriteType::Deleted,
                        })
                    }
                    None => Ok(ProcessOutcome::Unmodified),
                }
            }
            Err(e) => {
                txn.abort().await?;
                Err(e)
            }
        }
    }

    /// Returns the uuid of the removed resource, or `None` when there was
    /// nothing to remove.
    async fn delete_in_txn(
        &self,
        txn: &mut Transaction,
        message: &BrokerMessage,
        seqid: i64,
        partition: &str,
        transaction_check: bool,
    ) -> Result<Option<String>, ProcessorError> {
        let kbid = message.kbid.as_str();
        let uuid = if message.uuid.is_empty() && !message.slug.is_empty() {
            knowledgebox::get_resource_uuid_by_slug(txn, kbid, &message.slug).await?
        } else if message.uuid.is_empty() {
            None
        } else {
            Some(message.uuid.clone())
        };

        let mut deleted = None;
        if let Some(uuid) = uuid {
            if let Some(shard_id) = knowledgebox::get_resource_shard_id(txn, kbid, &uuid).await? {
                let shards = knowledgebox::get_shards(txn, kbid)
                    .await?
                    .ok_or_else(|| ProcessorError::ShardsNotFound(kbid.to_string()))?;
                match shards.find(&shard_id) {
                    Some(shard) => {
                        self.indexer
                            .delete_resource(shard, kbid, &uuid, message.source())
                            .await?;
                    }
                    None => warn!(kbid = %kbid, uuid = %uuid, shard = %shard_id, "Resource shard no longer exists"),
                }
            }
            if let Some(resource) = Resource::load(txn, kbid, &uuid).await? {
                resource.delete(txn).await?;
                knowledgebox::invalidate_counters(txn, kbid).await?;
                deleted = Some(uuid);
            }
        }

        if transaction_check {
            Self::advance(txn, partition, seqid).await?;
        }
        Ok(deleted)
    }

    async fn autocommit(
        &self,
        message: &BrokerMessage,
        seqid: i64,
        partition: &str,
        transaction_check: bool,
    ) -> Result<ProcessOutcome, ProcessorError> {
        let mut txn = self.driver.begin(false).await?;
        let staged = match self
            .autocommit_in_txn(&mut txn, message, seqid, partition, transaction_check)
            .await
        {
            Ok(staged) => staged,
            Err(e) => {
                txn.abort().await?;
                return Err(e);
            }
        };

        match staged {
            Staged::Commit {
                uuid,
                write_type,
                shard,
                index_message,
            } => {
                txn.commit().await?;
                self.indexer.index_soon(shard, index_message);
                self.notify(message, seqid, partition, &uuid, write_type);
                Ok(ProcessOutcome::Applied {
                    kbid: message.kbid.clone(),
                    uuid,
                    write_type,
                })
            }
            Staged::KnowledgeBoxDeleted => {
                if txn.has_writes() {
                    txn.commit().await?;
                } else {
                    txn.abort().await?;
                }
                Ok(ProcessOutcome::KnowledgeBoxDeleted)
            }
            Staged::MissingResource { uuid } => {
                txn.abort().await?;
                self.notify(message, seqid, partition, &uuid, WriteType::Aborted);
                Ok(ProcessOutcome::Unmodified)
            }
            Staged::Unmodified => {
                txn.abort().await?;
                Ok(ProcessOutcome::Unmodified)
            }
        }
    }

    async fn autocommit_in_txn(
        &self,
        txn: &mut Transaction,
        message: &BrokerMessage,
        seqid: i64,
        partition: &str,
        transaction_check: bool,
    ) -> Result<Staged, ProcessorError> {
        let kbid = message.kbid.as_str();
        if !knowledgebox::exists(txn, kbid).await? {
            warn!(kbid = %kbid, seqid, "Knowledge box deleted, skipping message");
            if transaction_check {
                Self::advance(txn, partition, seqid).await?;
            }
            return Ok(Staged::KnowledgeBoxDeleted);
        }

        let source = message.source();
        let uuid = match (message.uuid.is_empty(), message.slug.is_empty()) {
            (false, _) => message.uuid.clone(),
            (true, false) => {
                match knowledgebox::get_resource_uuid_by_slug(txn, kbid, &message.slug).await? {
                    Some(uuid) => uuid,
                    None => uuid::Uuid::new_v4().simple().to_string(),
                }
            }
            (true, true) => {
                return Err(ProcessorError::InvalidInput(
                    "broker message has neither uuid nor slug".to_string(),
                ))
            }
        };

        let shards = knowledgebox::get_shards(txn, kbid)
            .await?
            .ok_or_else(|| ProcessorError::ShardsNotFound(kbid.to_string()))?;

        let (mut resource, created) = match Resource::load(txn, kbid, &uuid).await? {
            Some(resource) => (resource, false),
            None if source == MessageSource::Processor => {
                warn!(kbid = %kbid, uuid = %uuid, "Processor message for a missing resource, ignoring");
                return Ok(Staged::MissingResource { uuid });
            }
            None => {
                let desired = if message.slug.is_empty() {
                    uuid.as_str()
                } else {
                    message.slug.as_str()
                };
                let slug = knowledgebox::allocate_resource_slug(txn, kbid, desired).await?;
                (Resource::create(txn, kbid, &uuid, &slug).await?, true)
            }
        };

        let applied_seqid = transaction_check.then_some(seqid);
        let modified = resource.apply(txn, message, applied_seqid).await?;
        if !modified && !created {
            debug!(kbid = %kbid, uuid = %uuid, "Message did not modify the resource");
            return Ok(Staged::Unmodified);
        }

        let shard = match knowledgebox::get_resource_shard_id(txn, kbid, &uuid).await? {
            Some(shard_id) => shards.find(&shard_id).cloned(),
            None => {
                let shard = shards.active_shard().cloned();
                if let Some(shard) = &shard {
                    knowledgebox::set_resource_shard_id(txn, kbid, &uuid, &shard.shard_id).await?;
                }
                shard
            }
        }
        .ok_or_else(|| ProcessorError::ShardsNotFound(kbid.to_string()))?;

        knowledgebox::invalidate_counters(txn, kbid).await?;
        let index_message =
            build_index_message(txn, &resource, &shard.shard_id, seqid, partition, source).await?;

        if transaction_check {
            Self::advance(txn, partition, seqid).await?;
        }

        Ok(Staged::Commit {
            uuid,
            write_type: if created {
                WriteType::Created
            } else {
                WriteType::Modified
            },
            shard,
            index_message,
        })
    }

    async fn advance(txn: &mut Transaction, partition: &str, seqid: i64) -> Result<(), ProcessorError> {
        match SequenceGuard::advance(txn, partition, seqid).await? {
            Decision::Apply => Ok(()),
            Decision::SkipDuplicate { last_seqid, .. } | Decision::Violation(last_seqid) => {
                Err(ProcessorError::SequenceOrderViolation {
                    partition: partition.to_string(),
                    seqid,
                    last_seqid,
                })
            }
        }
    }

    /// Store `message` out of band, flag the resource and report it as
    /// handled.
    async fn deadletter(
        &self,
        message: &BrokerMessage,
        seqid: i64,
        partition: &str,
        cause: ProcessorError,
    ) -> Result<ProcessOutcome, ProcessorError> {
        error!(
            kbid = %message.kbid,
            uuid = %message.uuid,
            seqid,
            partition = %partition,
            error = %cause,
            "Unhandled error processing message, deadlettering"
        );
        // Local processing reuses seqid 0, so the wall clock keeps keys apart
        let seq = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        self.blob.deadletter(message, seq, seqid, partition).await?;

        if !message.uuid.is_empty() {
            if let Err(e) = resource::mark_error(&self.driver, &message.kbid, &message.uuid).await {
                warn!(kbid = %message.kbid, uuid = %message.uuid, error = %e, "Failed to mark resource as errored");
            }
        }

        Err(ProcessorError::Deadlettered {
            kbid: message.kbid.clone(),
            uuid: message.uuid.clone(),
            seqid,
            cause: cause.to_string(),
        })
    }

    fn notify(&self, message: &BrokerMessage, seqid: i64, partition: &str, uuid: &str, write_type: WriteType) {
        self.notifier.notify(Notification {
            kbid: message.kbid.clone(),
            uuid: uuid.to_string(),
            seqid,
            partition: partition.to_string(),
            write_type,
            source: message.source(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_indexing::{IndexNodeClient, IndexNodes, MemoryIndexNode, ShardCoordinator};
    use ingest_storage::{MemoryBlobStorage, StorageError};
    use ingest_types::{
        Basic, ExtractedText, FieldText, LockStrategy, ResourceStatus,
    };
    use pretty_assertions::assert_eq;

    struct Fixture {
        processor: Processor,
        node: Arc<MemoryIndexNode>,
        blob: MemoryBlobStorage,
        kbid: String,
    }

    async fn fixture() -> Fixture {
        let driver = Driver::in_memory();
        let node = Arc::new(MemoryIndexNode::new("node-0"));
        let nodes = IndexNodes::new().with_node(Arc::clone(&node) as Arc<dyn IndexNodeClient>);
        let indexer = ShardIndexer::new(ShardCoordinator::new(LockStrategy::Priority), nodes, 4);
        let blob = MemoryBlobStorage::new();
        let kbid = knowledgebox::create_knowledgebox(&driver, "kb", "KB", &["node-0".to_string()], None)
            .await
            .unwrap();
        let processor = Processor::new(
            driver,
            Arc::new(blob.clone()),
            indexer,
            Notifier::default(),
        );
        Fixture {
            processor,
            node,
            blob,
            kbid,
        }
    }

    fn writer_message(kbid: &str, uuid: &str, body: &str) -> BrokerMessage {
        let mut bm = BrokerMessage {
            kbid: kbid.into(),
            uuid: uuid.into(),
            slug: format!("{uuid}-slug"),
            basic: Some(Basic {
                title: "Title".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        bm.texts.insert(
            "body".into(),
            FieldText {
                body: body.into(),
                ..Default::default()
            },
        );
        bm
    }

    async fn load(processor: &Processor, kbid: &str, uuid: &str) -> Option<Resource> {
        let mut txn = processor.driver().begin(true).await.unwrap();
        Resource::load(&mut txn, kbid, uuid).await.unwrap()
    }

    #[tokio::test]
    async fn test_autocommit_creates_and_indexes() {
        let f = fixture().await;
        let mut rx = f.processor.notifier().subscribe();

        let outcome = f
            .processor
            .process(&writer_message(&f.kbid, "r1", "hello"), 1, "1", true)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Applied {
                kbid: f.kbid.clone(),
                uuid: "r1".into(),
                write_type: WriteType::Created,
            }
        );
        assert_eq!(rx.recv().await.unwrap().write_type, WriteType::Created);

        f.processor.indexer().wait_idle().await;
        assert_eq!(f.node.calls(), vec!["set:r1"]);
        assert_eq!(
            f.processor.sequence_guard().last_seqid("1").await.unwrap(),
            Some(1)
        );
        let resource = load(&f.processor, &f.kbid, "r1").await.unwrap();
        assert_eq!(resource.basic.last_seqid, 1);
        assert_eq!(resource.basic.slug, "r1-slug");
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let f = fixture().await;
        let bm = writer_message(&f.kbid, "r1", "hello");
        for seqid in [1, 2, 2, 3] {
            f.processor.process(&bm, seqid, "1", true).await.unwrap();
        }
        f.processor.indexer().wait_idle().await;
        assert_eq!(f.node.calls().len(), 3);

        let outcome = f.processor.process(&bm, 2, "1", true).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::SkippedDuplicate { last_seqid: 3 });
    }

    #[tokio::test]
    async fn test_processor_message_for_missing_resource() {
        let f = fixture().await;
        let mut bm = BrokerMessage {
            kbid: f.kbid.clone(),
            uuid: "ghost".into(),
            ..Default::default()
        };
        bm.set_source(MessageSource::Processor);
        bm.extracted_text.insert("t/body".into(), ExtractedText::default());

        let outcome = f.processor.process(&bm, 1, "1", true).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Unmodified);
        assert!(load(&f.processor, &f.kbid, "ghost").await.is_none());
        assert_eq!(f.processor.sequence_guard().last_seqid("1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_processor_data_marks_processed() {
        let f = fixture().await;
        f.processor
            .process(&writer_message(&f.kbid, "r1", "hello"), 1, "1", true)
            .await
            .unwrap();

        let mut bm = BrokerMessage {
            kbid: f.kbid.clone(),
            uuid: "r1".into(),
            ..Default::default()
        };
        bm.set_source(MessageSource::Processor);
        bm.extracted_text.insert(
            "t/body".into(),
            ExtractedText {
                text: "hello extracted".into(),
                ..Default::default()
            },
        );
        let outcome = f.processor.process(&bm, 2, "1", true).await.unwrap();
        assert!(matches!(
            outcome,
            ProcessOutcome::Applied {
                write_type: WriteType::Modified,
                ..
            }
        ));
        f.processor.indexer().wait_idle().await;

        let resource = load(&f.processor, &f.kbid, "r1").await.unwrap();
        assert_eq!(resource.basic.status(), ResourceStatus::Processed);

        let mut txn = f.processor.driver().begin(true).await.unwrap();
        let shards = knowledgebox::get_shards(&mut txn, &f.kbid).await.unwrap().unwrap();
        let indexed = f
            .node
            .document(&shards.active_shard().unwrap().shard_id, "r1")
            .unwrap();
        assert_eq!(indexed.texts[0].text, "hello extracted");
        assert_eq!(indexed.source(), MessageSource::Processor);
    }

    #[tokio::test]
    async fn test_delete_removes_resource_and_index() {
        let f = fixture().await;
        f.processor
            .process(&writer_message(&f.kbid, "r1", "hello"), 1, "1", true)
            .await
            .unwrap();
        f.processor.indexer().wait_idle().await;
        f.blob
            .upload(&ingest_storage::blob::kb_bucket(&f.kbid), "r1/f/f/file", b"bin".to_vec())
            .await
            .unwrap();

        let mut delete = BrokerMessage {
            kbid: f.kbid.clone(),
            uuid: "r1".into(),
            ..Default::default()
        };
        delete.set_message_type(MessageType::Delete);
        let outcome = f.processor.process(&delete, 2, "1", true).await.unwrap();
        assert!(matches!(
            outcome,
            ProcessOutcome::Applied {
                write_type: WriteType::Deleted,
                ..
            }
        ));

        assert!(load(&f.processor, &f.kbid, "r1").await.is_none());
        assert_eq!(f.node.calls(), vec!["set:r1", "delete:r1"]);
        assert!(f.blob.is_empty());
        assert_eq!(f.processor.sequence_guard().last_seqid("1").await.unwrap(), Some(2));

        // Deleting again is harmless
        let outcome = f.processor.process(&delete, 3, "1", true).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Unmodified);
        assert_eq!(f.processor.sequence_guard().last_seqid("1").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_deleted_knowledgebox_advances_watermark() {
        let f = fixture().await;
        let bm = writer_message("missing-kb", "r1", "hello");
        let outcome = f.processor.process(&bm, 4, "1", true).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::KnowledgeBoxDeleted);
        assert_eq!(f.processor.sequence_guard().last_seqid("1").await.unwrap(), Some(4));

        let err = f.processor.process_direct(&bm).await.unwrap_err();
        assert!(matches!(err, ProcessorError::KnowledgeBoxNotFound(_)));
    }

    #[tokio::test]
    async fn test_rollback_writes_nothing() {
        let f = fixture().await;
        let mut bm = writer_message(&f.kbid, "r1", "hello");
        bm.set_message_type(MessageType::Rollback);
        let outcome = f.processor.process(&bm, 1, "1", true).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::RolledBack);
        assert!(load(&f.processor, &f.kbid, "r1").await.is_none());
    }

    #[tokio::test]
    async fn test_unexpected_error_is_deadlettered() {
        let f = fixture().await;
        f.processor
            .process(&writer_message(&f.kbid, "r1", "hello"), 1, "1", true)
            .await
            .unwrap();

        // A field payload that no longer decodes
        let mut txn = f.processor.driver().begin(false).await.unwrap();
        let field = ingest_types::FieldId::new(ingest_types::FieldType::Text, "broken");
        txn.set(
            &ingest_storage::keys::resource_field(&f.kbid, "r1", &field),
            vec![0xff, 0xff, 0xff],
        )
        .await
        .unwrap();
        txn.commit().await.unwrap();

        let bm = writer_message(&f.kbid, "r1", "again");
        let err = f.processor.process(&bm, 2, "1", true).await.unwrap_err();
        assert!(matches!(err, ProcessorError::Deadlettered { seqid: 2, .. }));

        let stored = f
            .blob
            .list(ingest_storage::blob::DEADLETTER_BUCKET, "deadletter/1/2/")
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        let resource = load(&f.processor, &f.kbid, "r1").await.unwrap();
        assert_eq!(resource.basic.status(), ResourceStatus::Error);

        // Direct callers get the original error instead
        let err = f.processor.process_direct(&bm).await.unwrap_err();
        assert!(matches!(err, ProcessorError::Model(_)));
    }

    #[tokio::test]
    async fn test_conflict_is_not_deadlettered() {
        let err = ProcessorError::Storage(StorageError::Conflict("/k".into()));
        assert!(err.bypasses_deadletter());
    }
}
