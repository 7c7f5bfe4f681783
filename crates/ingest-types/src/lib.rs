//! # ingest-types
//!
//! Shared domain types for the kb-ingest pipeline.
//!
//! This crate defines the data structures every other crate speaks:
//! - Broker messages: protobuf mutation envelopes for one resource
//! - Fields: the closed set of resource field kinds and their ids
//! - Knowledge box records: KBs, shards, entities, labels, learning config
//! - Index messages: instructions for index nodes
//! - Tasks: export/import/migration bookkeeping
//! - Settings: layered configuration
//!
//! ## Usage
//!
//! ```rust
//! use ingest_types::{BrokerMessage, MessageType};
//!
//! let mut bm = BrokerMessage::default();
//! bm.set_message_type(MessageType::Delete);
//! assert_eq!(bm.message_type(), MessageType::Delete);
//! ```

pub mod broker_message;
pub mod config;
pub mod error;
pub mod export;
pub mod fields;
pub mod index;
pub mod kb;
pub mod task;

pub use broker_message::{
    Basic, BrokerMessage, BrokerMessageBlobReference, ExtractedText, FieldMetadata, FieldVectors,
    MessageSource, MessageType, Paragraph, QueueType, ResourceStatus, Vector,
    MESSAGE_TYPE_HEADER, PROXY_MESSAGE_TYPE,
};
pub use config::{
    BackPressureSettings, ConsumerSettings, IndexingSettings, KvBackendKind, LockStrategy,
    PullSettings, Settings, TaskSettings,
};
pub use error::IngestError;
pub use export::ExportedItemType;
pub use fields::{
    CloudFile, CloudFileSource, Conversation, FieldDatetime, FieldFile, FieldId, FieldKeywordset,
    FieldLayout, FieldLink, FieldText, FieldType, FieldValue, Keyword, Message,
};
pub use index::{IndexMessage, IndexOperation, OpStatus, OpStatusKind, ParagraphInfo, TextInfo, VectorInfo};
pub use kb::{
    EntitiesGroup, EntitiesGroups, Entity, KbCounters, KnowledgeBoxRecord, Label, LabelSet, Labels,
    LearningConfiguration, ShardObject, ShardSet,
};
pub use task::{TaskMetadata, TaskStatus, TaskType};
