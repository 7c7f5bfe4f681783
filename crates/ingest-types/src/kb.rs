//! Knowledge box and shard records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A knowledge box: the tenant every resource belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBoxRecord {
    pub kbid: String,
    pub slug: String,
    #[serde(default)]
    pub title: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// One logical shard and the index nodes holding its replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardObject {
    pub shard_id: String,
    pub replicas: Vec<String>,
    #[serde(default)]
    pub read_only: bool,
}

/// All shards of a knowledge box; `active` receives new resources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSet {
    pub shards: Vec<ShardObject>,
    #[serde(default)]
    pub active: usize,
}

impl ShardSet {
    pub fn active_shard(&self) -> Option<&ShardObject> {
        self.shards.get(self.active)
    }

    pub fn find(&self, shard_id: &str) -> Option<&ShardObject> {
        self.shards.iter().find(|s| s.shard_id == shard_id)
    }
}

/// Cached per-KB counters. Dropped whenever a resource changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbCounters {
    pub resources: u64,
    pub fields: u64,
    pub paragraphs: u64,
}

/// Embedding model settings a knowledge box was created with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningConfiguration {
    pub semantic_model: String,
    #[serde(default)]
    pub semantic_vector_size: Option<u32>,
    #[serde(default)]
    pub semantic_vector_similarity: Option<String>,
    #[serde(default)]
    pub generative_model: Option<String>,
}

impl LearningConfiguration {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Entity {
    #[prost(string, tag = "1")]
    pub value: String,
    #[prost(string, repeated, tag = "2")]
    pub represents: Vec<String>,
    #[prost(bool, tag = "3")]
    pub deleted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntitiesGroup {
    #[prost(map = "string, message", tag = "1")]
    pub entities: HashMap<String, Entity>,
    #[prost(string, tag = "2")]
    pub title: String,
    #[prost(string, tag = "3")]
    pub color: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EntitiesGroups {
    #[prost(map = "string, message", tag = "1")]
    pub groups: HashMap<String, EntitiesGroup>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub title: String,
    #[prost(string, tag = "2")]
    pub related: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LabelSet {
    #[prost(string, tag = "1")]
    pub title: String,
    #[prost(string, tag = "2")]
    pub color: String,
    #[prost(message, repeated, tag = "3")]
    pub labels: Vec<Label>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Labels {
    #[prost(map = "string, message", tag = "1")]
    pub labelset: HashMap<String, LabelSet>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_shard() {
        let set = ShardSet {
            shards: vec![
                ShardObject {
                    shard_id: "s0".into(),
                    replicas: vec!["node-a".into()],
                    read_only: true,
                },
                ShardObject {
                    shard_id: "s1".into(),
                    replicas: vec!["node-b".into()],
                    read_only: false,
                },
            ],
            active: 1,
        };
        assert_eq!(set.active_shard().unwrap().shard_id, "s1");
        assert_eq!(set.find("s0").unwrap().replicas, vec!["node-a"]);
        assert!(set.find("missing").is_none());
        assert!(ShardSet::default().active_shard().is_none());
    }

    #[test]
    fn test_learning_config_optional_fields() {
        let cfg = LearningConfiguration::from_bytes(br#"{"semantic_model":"multilingual"}"#)
            .unwrap();
        assert_eq!(cfg.semantic_model, "multilingual");
        assert!(cfg.semantic_vector_size.is_none());
    }
}
