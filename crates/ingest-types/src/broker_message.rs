//! Broker messages: the mutation envelope carried by the transport.
//!
//! A broker message describes one change to one resource of a knowledge
//! box. Writers (API callers) fill in the field maps and basic metadata;
//! the processing engine fills in extracted text, vectors and metadata.
//! Messages are protobuf-encoded on the wire and never mutated after
//! publication.

use std::collections::HashMap;

use crate::fields::{
    Conversation, FieldDatetime, FieldFile, FieldId, FieldKeywordset, FieldLayout, FieldLink,
    FieldText, FieldType, FieldValue,
};

/// Header used to mark a payload that is a [`BrokerMessageBlobReference`].
pub const MESSAGE_TYPE_HEADER: &str = "X-MESSAGE-TYPE";
/// Value of [`MESSAGE_TYPE_HEADER`] for blob-referenced payloads.
pub const PROXY_MESSAGE_TYPE: &str = "PROXY";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Autocommit = 0,
    Delete = 1,
    Rollback = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageSource {
    Writer = 0,
    Processor = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ResourceStatus {
    Pending = 0,
    Processed = 1,
    Error = 2,
    Blocked = 3,
    Expired = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum QueueType {
    Private = 0,
    Shared = 1,
}

/// Resource-level metadata.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Basic {
    #[prost(string, tag = "1")]
    pub title: String,
    #[prost(enumeration = "ResourceStatus", tag = "2")]
    pub status: i32,
    /// Milliseconds since the Unix epoch.
    #[prost(int64, tag = "3")]
    pub created: i64,
    #[prost(int64, tag = "4")]
    pub modified: i64,
    #[prost(enumeration = "QueueType", tag = "5")]
    pub queue: i32,
    #[prost(string, tag = "6")]
    pub summary: String,
    #[prost(string, tag = "7")]
    pub icon: String,
    /// Last transport sequence applied to this resource.
    #[prost(int64, tag = "8")]
    pub last_seqid: i64,
    /// Slug assigned when the resource was created.
    #[prost(string, tag = "9")]
    pub slug: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExtractedText {
    #[prost(string, tag = "1")]
    pub text: String,
    /// Per-message text of a conversation field, keyed by message ident.
    #[prost(map = "string, string", tag = "2")]
    pub split_text: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Vector {
    #[prost(uint32, tag = "1")]
    pub start: u32,
    #[prost(uint32, tag = "2")]
    pub end: u32,
    #[prost(float, repeated, tag = "3")]
    pub vector: Vec<f32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FieldVectors {
    #[prost(message, repeated, tag = "1")]
    pub vectors: Vec<Vector>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Paragraph {
    #[prost(uint32, tag = "1")]
    pub start: u32,
    #[prost(uint32, tag = "2")]
    pub end: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FieldMetadata {
    #[prost(message, repeated, tag = "1")]
    pub paragraphs: Vec<Paragraph>,
    #[prost(string, repeated, tag = "2")]
    pub labels: Vec<String>,
    #[prost(string, tag = "3")]
    pub language: String,
    #[prost(string, tag = "4")]
    pub summary: String,
}

/// Mutation envelope for one resource.
///
/// Processor-side maps (`extracted_text`, `field_vectors`,
/// `field_metadata`) are keyed by the rendered [`FieldId`], e.g. `t/body`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BrokerMessage {
    #[prost(string, tag = "1")]
    pub kbid: String,
    #[prost(string, tag = "2")]
    pub uuid: String,
    #[prost(string, tag = "3")]
    pub slug: String,
    #[prost(enumeration = "MessageType", tag = "4")]
    pub message_type: i32,
    #[prost(enumeration = "MessageSource", tag = "5")]
    pub source: i32,
    #[prost(message, optional, tag = "6")]
    pub basic: Option<Basic>,

    // Writer data
    #[prost(map = "string, message", tag = "7")]
    pub texts: HashMap<String, FieldText>,
    #[prost(map = "string, message", tag = "8")]
    pub files: HashMap<String, FieldFile>,
    #[prost(map = "string, message", tag = "9")]
    pub links: HashMap<String, FieldLink>,
    #[prost(map = "string, message", tag = "10")]
    pub conversations: HashMap<String, Conversation>,
    #[prost(map = "string, message", tag = "11")]
    pub layouts: HashMap<String, FieldLayout>,
    #[prost(map = "string, message", tag = "12")]
    pub keywordsets: HashMap<String, FieldKeywordset>,
    #[prost(map = "string, message", tag = "13")]
    pub datetimes: HashMap<String, FieldDatetime>,

    // Processor data
    #[prost(map = "string, message", tag = "14")]
    pub extracted_text: HashMap<String, ExtractedText>,
    #[prost(map = "string, message", tag = "15")]
    pub field_vectors: HashMap<String, FieldVectors>,
    #[prost(map = "string, message", tag = "16")]
    pub field_metadata: HashMap<String, FieldMetadata>,

    // Internal
    #[prost(string, repeated, tag = "17")]
    pub delete_fields: Vec<String>,
    #[prost(bool, tag = "18")]
    pub reindex: bool,
    #[prost(string, tag = "19")]
    pub processing_id: String,
}

impl BrokerMessage {
    /// Writer half of the message: writer fields only, as an AUTOCOMMIT
    /// from [`MessageSource::Writer`].
    pub fn writer_message(&self) -> BrokerMessage {
        let mut bm = self.clone();
        bm.extracted_text.clear();
        bm.field_vectors.clear();
        bm.field_metadata.clear();
        bm.delete_fields.clear();
        bm.processing_id.clear();
        bm.set_message_type(MessageType::Autocommit);
        bm.set_source(MessageSource::Writer);
        bm
    }

    /// Processor half of the message: extracted data only, as an
    /// AUTOCOMMIT from [`MessageSource::Processor`].
    pub fn processor_message(&self) -> BrokerMessage {
        BrokerMessage {
            kbid: self.kbid.clone(),
            uuid: self.uuid.clone(),
            reindex: self.reindex,
            message_type: MessageType::Autocommit as i32,
            source: MessageSource::Processor as i32,
            extracted_text: self.extracted_text.clone(),
            field_vectors: self.field_vectors.clone(),
            field_metadata: self.field_metadata.clone(),
            ..Default::default()
        }
    }

    /// All field writes carried by the message, including `a/title` when
    /// basic metadata sets a title.
    pub fn field_mutations(&self) -> Vec<(FieldId, FieldValue)> {
        let mut out = Vec::new();
        for (name, v) in &self.texts {
            out.push((FieldId::new(FieldType::Text, name), FieldValue::Text(v.clone())));
        }
        for (name, v) in &self.files {
            out.push((FieldId::new(FieldType::File, name), FieldValue::File(v.clone())));
        }
        for (name, v) in &self.links {
            out.push((FieldId::new(FieldType::Link, name), FieldValue::Link(v.clone())));
        }
        for (name, v) in &self.conversations {
            out.push((
                FieldId::new(FieldType::Conversation, name),
                FieldValue::Conversation(v.clone()),
            ));
        }
        for (name, v) in &self.layouts {
            out.push((FieldId::new(FieldType::Layout, name), FieldValue::Layout(v.clone())));
        }
        for (name, v) in &self.keywordsets {
            out.push((
                FieldId::new(FieldType::Keywordset, name),
                FieldValue::Keywordset(v.clone()),
            ));
        }
        for (name, v) in &self.datetimes {
            out.push((
                FieldId::new(FieldType::Datetime, name),
                FieldValue::Datetime(v.clone()),
            ));
        }
        if let Some(basic) = &self.basic {
            if !basic.title.is_empty() {
                out.push((
                    FieldId::new(FieldType::Generic, "title"),
                    FieldValue::Generic(basic.title.clone()),
                ));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Field ids listed for deletion. Malformed entries are skipped.
    pub fn deleted_field_ids(&self) -> Vec<FieldId> {
        self.delete_fields
            .iter()
            .filter_map(|raw| raw.parse().ok())
            .collect()
    }

    /// Whether the message carries any processor-extracted data.
    pub fn has_processor_data(&self) -> bool {
        !self.extracted_text.is_empty()
            || !self.field_vectors.is_empty()
            || !self.field_metadata.is_empty()
    }
}

/// Pointer to a broker message stored in blob storage.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BrokerMessageBlobReference {
    #[prost(string, tag = "1")]
    pub kbid: String,
    #[prost(string, tag = "2")]
    pub uuid: String,
    #[prost(string, tag = "3")]
    pub storage_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    fn full_message() -> BrokerMessage {
        let mut bm = BrokerMessage {
            kbid: "kb1".into(),
            uuid: "r1".into(),
            slug: "my-resource".into(),
            basic: Some(Basic {
                title: "My resource".into(),
                ..Default::default()
            }),
            reindex: true,
            processing_id: "proc-1".into(),
            delete_fields: vec!["t/old".into()],
            ..Default::default()
        };
        bm.set_message_type(MessageType::Delete);
        bm.set_source(MessageSource::Processor);
        bm.texts.insert(
            "body".into(),
            FieldText {
                body: "hello".into(),
                ..Default::default()
            },
        );
        bm.extracted_text.insert(
            "t/body".into(),
            ExtractedText {
                text: "hello".into(),
                ..Default::default()
            },
        );
        bm.field_vectors.insert("t/body".into(), FieldVectors::default());
        bm
    }

    #[test]
    fn test_writer_message_split() {
        let writer = full_message().writer_message();
        assert_eq!(writer.message_type(), MessageType::Autocommit);
        assert_eq!(writer.source(), MessageSource::Writer);
        assert_eq!(writer.texts.len(), 1);
        assert!(writer.basic.is_some());
        assert!(writer.extracted_text.is_empty());
        assert!(writer.field_vectors.is_empty());
        assert!(writer.delete_fields.is_empty());
        assert!(writer.processing_id.is_empty());
        assert!(writer.reindex);
    }

    #[test]
    fn test_processor_message_split() {
        let processor = full_message().processor_message();
        assert_eq!(processor.message_type(), MessageType::Autocommit);
        assert_eq!(processor.source(), MessageSource::Processor);
        assert_eq!(processor.kbid, "kb1");
        assert_eq!(processor.uuid, "r1");
        assert!(processor.texts.is_empty());
        assert!(processor.basic.is_none());
        assert!(processor.slug.is_empty());
        assert_eq!(processor.extracted_text.len(), 1);
        assert_eq!(processor.field_vectors.len(), 1);
        assert!(processor.has_processor_data());
    }

    #[test]
    fn test_field_mutations_include_title() {
        let ids: Vec<String> = full_message()
            .field_mutations()
            .iter()
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(ids, vec!["t/body", "a/title"]);
    }

    #[test]
    fn test_deleted_field_ids_skip_malformed() {
        let mut bm = full_message();
        bm.delete_fields.push("garbage".into());
        let ids = bm.deleted_field_ids();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].to_string(), "t/old");
    }

    #[test]
    fn test_unknown_enum_value_falls_back() {
        let bm = BrokerMessage {
            message_type: 42,
            ..Default::default()
        };
        let decoded = BrokerMessage::decode(bm.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.message_type(), MessageType::Autocommit);
    }
}
