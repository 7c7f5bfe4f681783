//! Dispatch of index messages to shard replicas.
//!
//! Every operation takes the shard lease first, so two operations on the
//! same shard never interleave. Writer messages are scheduled ahead of
//! processor messages.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tonic::Code;
use tracing::{debug, error, warn};

use ingest_types::{IndexMessage, IndexOperation, MessageSource, OpStatusKind, ShardObject};

use crate::coordinator::{Priority, ShardCoordinator};
use crate::error::IndexingError;
use crate::node::IndexNodes;

/// Writer-originated work goes first.
pub fn priority_for(source: MessageSource) -> Priority {
    match source {
        MessageSource::Writer => Priority::High,
        MessageSource::Processor => Priority::Low,
    }
}

/// Applies index messages to every replica of a shard. Cheap to clone.
#[derive(Clone)]
pub struct ShardIndexer {
    coordinator: ShardCoordinator,
    nodes: IndexNodes,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl ShardIndexer {
    pub fn new(coordinator: ShardCoordinator, nodes: IndexNodes, max_concurrent: usize) -> Self {
        Self {
            coordinator,
            nodes,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    pub fn coordinator(&self) -> &ShardCoordinator {
        &self.coordinator
    }

    pub fn nodes(&self) -> &IndexNodes {
        &self.nodes
    }

    /// Apply `message` to all replicas of `shard`, holding the shard lease.
    pub async fn index(&self, shard: &ShardObject, message: &IndexMessage) -> Result<(), IndexingError> {
        let priority = priority_for(message.source());
        let _lease = self
            .coordinator
            .request_shard(&shard.shard_id, priority)
            .await?;

        for node_id in &shard.replicas {
            let client = self.nodes.get(node_id)?;
            let result = match message.kind() {
                IndexOperation::Set => client.set_resource(message).await,
                IndexOperation::Delete => {
                    match client
                        .delete_resource(&shard.shard_id, &message.resource)
                        .await
                    {
                        Err(status) if status.code() == Code::NotFound => {
                            debug!(
                                node = %node_id,
                                shard = %shard.shard_id,
                                resource = %message.resource,
                                "Resource already absent from replica"
                            );
                            continue;
                        }
                        other => other,
                    }
                }
            };
            let status = result.map_err(|status| IndexingError::Rpc {
                node: node_id.clone(),
                status,
            })?;
            match status.status() {
                OpStatusKind::Ok => {}
                OpStatusKind::Warning => {
                    warn!(node = %node_id, shard = %shard.shard_id, detail = %status.detail, "Index warning");
                }
                OpStatusKind::Error => {
                    return Err(IndexingError::Rejected {
                        node: node_id.clone(),
                        detail: status.detail,
                    });
                }
            }
        }
        debug!(
            kbid = %message.kbid,
            shard = %shard.shard_id,
            resource = %message.resource,
            seqid = message.seqid,
            "Indexed resource"
        );
        Ok(())
    }

    /// Build and apply a delete for one resource.
    pub async fn delete_resource(
        &self,
        shard: &ShardObject,
        kbid: &str,
        resource: &str,
        source: MessageSource,
    ) -> Result<(), IndexingError> {
        let mut message = IndexMessage {
            kbid: kbid.to_string(),
            shard: shard.shard_id.clone(),
            resource: resource.to_string(),
            ..Default::default()
        };
        message.set_kind(IndexOperation::Delete);
        message.set_source(source);
        self.index(shard, &message).await
    }

    /// Apply `message` in the background. Failures are logged.
    pub fn index_soon(&self, shard: ShardObject, message: IndexMessage) {
        let indexer = self.clone();
        self.tracker.spawn(async move {
            let _permit = match Arc::clone(&indexer.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if let Err(e) = indexer.index(&shard, &message).await {
                error!(
                    kbid = %message.kbid,
                    shard = %shard.shard_id,
                    resource = %message.resource,
                    error = %e,
                    "Background indexing failed"
                );
            }
        });
    }

    /// Wait for every background operation spawned so far.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{IndexNodeClient, MemoryIndexNode};
    use ingest_types::LockStrategy;
    use tonic::Status;

    fn setup() -> (ShardIndexer, Arc<MemoryIndexNode>, Arc<MemoryIndexNode>, ShardObject) {
        let a = Arc::new(MemoryIndexNode::new("node-a"));
        let b = Arc::new(MemoryIndexNode::new("node-b"));
        let nodes = IndexNodes::new()
            .with_node(Arc::clone(&a) as Arc<dyn IndexNodeClient>)
            .with_node(Arc::clone(&b) as Arc<dyn IndexNodeClient>);
        let indexer = ShardIndexer::new(ShardCoordinator::new(LockStrategy::Priority), nodes, 4);
        let shard = ShardObject {
            shard_id: "s1".into(),
            replicas: vec!["node-a".into(), "node-b".into()],
            read_only: false,
        };
        (indexer, a, b, shard)
    }

    fn set_message(resource: &str) -> IndexMessage {
        let mut message = IndexMessage {
            kbid: "kb1".into(),
            shard: "s1".into(),
            resource: resource.into(),
            ..Default::default()
        };
        message.set_kind(IndexOperation::Set);
        message
    }

    #[test]
    fn test_priority_for_source() {
        assert_eq!(priority_for(MessageSource::Writer), Priority::High);
        assert_eq!(priority_for(MessageSource::Processor), Priority::Low);
    }

    #[tokio::test]
    async fn test_index_reaches_every_replica() {
        let (indexer, a, b, shard) = setup();
        indexer.index(&shard, &set_message("r1")).await.unwrap();
        assert!(a.document("s1", "r1").is_some());
        assert!(b.document("s1", "r1").is_some());
        assert!(!indexer.coordinator().is_held("s1"));
    }

    #[tokio::test]
    async fn test_delete_not_found_is_success() {
        let (indexer, a, b, shard) = setup();
        indexer.index(&shard, &set_message("r1")).await.unwrap();
        // Only one replica still has it
        b.delete_resource("s1", "r1").await.unwrap();

        indexer
            .delete_resource(&shard, "kb1", "r1", MessageSource::Writer)
            .await
            .unwrap();
        assert!(a.document("s1", "r1").is_none());
    }

    #[tokio::test]
    async fn test_rpc_error_propagates_and_releases_shard() {
        let (indexer, a, _b, shard) = setup();
        a.fail_next(Status::unavailable("node down"));
        let err = indexer.index(&shard, &set_message("r1")).await.unwrap_err();
        assert!(matches!(err, IndexingError::Rpc { .. }));
        assert!(!indexer.coordinator().is_held("s1"));
    }

    #[tokio::test]
    async fn test_unknown_replica() {
        let (indexer, _a, _b, mut shard) = setup();
        shard.replicas.push("node-z".into());
        let err = indexer.index(&shard, &set_message("r1")).await.unwrap_err();
        assert!(matches!(err, IndexingError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_index_soon_runs_in_background() {
        let (indexer, a, _b, shard) = setup();
        for i in 0..5 {
            indexer.index_soon(shard.clone(), set_message(&format!("r{i}")));
        }
        indexer.wait_idle().await;
        assert_eq!(a.document_count("s1"), 5);
        assert_eq!(indexer.in_flight(), 0);
    }
}
