//! Index node RPC contract.
//!
//! Index nodes hold shard replicas and are reached over gRPC. Only the two
//! write operations the ingest pipeline needs are modelled here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tonic::Status;

use ingest_types::{IndexMessage, OpStatus, OpStatusKind};

use crate::error::IndexingError;

#[async_trait]
pub trait IndexNodeClient: Send + Sync {
    fn node_id(&self) -> &str;

    /// Index (or reindex) one resource in a shard.
    async fn set_resource(&self, message: &IndexMessage) -> Result<OpStatus, Status>;

    /// Drop one resource from a shard. `NOT_FOUND` when the shard or
    /// resource does not exist.
    async fn delete_resource(&self, shard_id: &str, resource: &str) -> Result<OpStatus, Status>;
}

/// Index node kept in process memory.
pub struct MemoryIndexNode {
    node_id: String,
    documents: DashMap<(String, String), IndexMessage>,
    /// Errors returned by the next calls, in order
    failures: Mutex<Vec<Status>>,
    calls: Mutex<Vec<String>>,
}

impl MemoryIndexNode {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            documents: DashMap::new(),
            failures: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn document(&self, shard_id: &str, resource: &str) -> Option<IndexMessage> {
        self.documents
            .get(&(shard_id.to_string(), resource.to_string()))
            .map(|d| d.value().clone())
    }

    pub fn document_count(&self, shard_id: &str) -> usize {
        self.documents
            .iter()
            .filter(|entry| entry.key().0 == shard_id)
            .count()
    }

    /// Make the next call fail with `status`.
    pub fn fail_next(&self, status: Status) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(status);
        }
    }

    /// Operations received so far, as `set:{resource}` / `delete:{resource}`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: String) -> Result<(), Status> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
        let mut failures = self
            .failures
            .lock()
            .map_err(|_| Status::internal("failure queue poisoned"))?;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.remove(0))
        }
    }

    fn ok(&self, shard_id: &str, field_count: u64) -> OpStatus {
        let mut status = OpStatus {
            shard_id: shard_id.to_string(),
            field_count,
            ..Default::default()
        };
        status.set_status(OpStatusKind::Ok);
        status
    }
}

#[async_trait]
impl IndexNodeClient for MemoryIndexNode {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn set_resource(&self, message: &IndexMessage) -> Result<OpStatus, Status> {
        self.record(format!("set:{}", message.resource))?;
        let field_count = message.texts.len() as u64;
        self.documents.insert(
            (message.shard.clone(), message.resource.clone()),
            message.clone(),
        );
        Ok(self.ok(&message.shard, field_count))
    }

    async fn delete_resource(&self, shard_id: &str, resource: &str) -> Result<OpStatus, Status> {
        self.record(format!("delete:{resource}"))?;
        match self
            .documents
            .remove(&(shard_id.to_string(), resource.to_string()))
        {
            Some(_) => Ok(self.ok(shard_id, 0)),
            None => Err(Status::not_found(format!("{shard_id}/{resource}"))),
        }
    }
}

/// Index node clients by node id.
#[derive(Clone, Default)]
pub struct IndexNodes {
    nodes: HashMap<String, Arc<dyn IndexNodeClient>>,
}

impl IndexNodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, client: Arc<dyn IndexNodeClient>) -> Self {
        self.insert(client);
        self
    }

    pub fn insert(&mut self, client: Arc<dyn IndexNodeClient>) {
        self.nodes.insert(client.node_id().to_string(), client);
    }

    /// In-memory nodes for every id.
    pub fn in_memory(ids: &[String]) -> Self {
        let mut nodes = Self::new();
        for id in ids {
            nodes.insert(Arc::new(MemoryIndexNode::new(id.clone())));
        }
        nodes
    }

    pub fn get(&self, node_id: &str) -> Result<Arc<dyn IndexNodeClient>, IndexingError> {
        self.nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| IndexingError::NodeNotFound(node_id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[tokio::test]
    async fn test_memory_node_set_and_delete() {
        let node = MemoryIndexNode::new("node-0");
        let message = IndexMessage {
            shard: "s1".into(),
            resource: "r1".into(),
            ..Default::default()
        };
        let status = node.set_resource(&message).await.unwrap();
        assert_eq!(status.status(), OpStatusKind::Ok);
        assert_eq!(node.document_count("s1"), 1);

        node.delete_resource("s1", "r1").await.unwrap();
        let err = node.delete_resource("s1", "r1").await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(node.calls(), vec!["set:r1", "delete:r1", "delete:r1"]);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let node = MemoryIndexNode::new("node-0");
        node.fail_next(Status::unavailable("down"));
        let message = IndexMessage::default();
        assert_eq!(
            node.set_resource(&message).await.unwrap_err().code(),
            Code::Unavailable
        );
        assert!(node.set_resource(&message).await.is_ok());
    }

    #[test]
    fn test_registry_lookup() {
        let nodes = IndexNodes::in_memory(&["b".to_string(), "a".to_string()]);
        assert_eq!(nodes.ids(), vec!["a", "b"]);
        assert!(nodes.get("a").is_ok());
        assert!(matches!(nodes.get("z"), Err(IndexingError::NodeNotFound(_))));
    }
}
