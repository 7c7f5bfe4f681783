//! Shard indexing instructions sent to index nodes.

use crate::broker_message::MessageSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum IndexOperation {
    Set = 0,
    Delete = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TextInfo {
    #[prost(string, tag = "1")]
    pub field: String,
    #[prost(string, tag = "2")]
    pub text: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParagraphInfo {
    #[prost(string, tag = "1")]
    pub field: String,
    #[prost(uint32, tag = "2")]
    pub start: u32,
    #[prost(uint32, tag = "3")]
    pub end: u32,
    #[prost(string, tag = "4")]
    pub text: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VectorInfo {
    #[prost(string, tag = "1")]
    pub field: String,
    #[prost(uint32, tag = "2")]
    pub start: u32,
    #[prost(uint32, tag = "3")]
    pub end: u32,
    #[prost(float, repeated, tag = "4")]
    pub vector: Vec<f32>,
}

/// Everything an index node needs to (re)index or drop one resource.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexMessage {
    #[prost(string, tag = "1")]
    pub kbid: String,
    #[prost(string, tag = "2")]
    pub shard: String,
    #[prost(string, tag = "3")]
    pub resource: String,
    #[prost(int64, tag = "4")]
    pub seqid: i64,
    #[prost(string, tag = "5")]
    pub partition: String,
    #[prost(enumeration = "MessageSource", tag = "6")]
    pub source: i32,
    #[prost(enumeration = "IndexOperation", tag = "7")]
    pub kind: i32,
    #[prost(message, repeated, tag = "8")]
    pub texts: Vec<TextInfo>,
    #[prost(message, repeated, tag = "9")]
    pub paragraphs: Vec<ParagraphInfo>,
    #[prost(message, repeated, tag = "10")]
    pub vectors: Vec<VectorInfo>,
    #[prost(string, repeated, tag = "11")]
    pub labels: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum OpStatusKind {
    Ok = 0,
    Warning = 1,
    Error = 2,
}

/// Result of an index-node operation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OpStatus {
    #[prost(enumeration = "OpStatusKind", tag = "1")]
    pub status: i32,
    #[prost(string, tag = "2")]
    pub detail: String,
    #[prost(uint64, tag = "3")]
    pub field_count: u64,
    #[prost(string, tag = "4")]
    pub shard_id: String,
}
