//! Resource field kinds.
//!
//! A resource is made of named fields. Each field has a kind (text, file,
//! link, ...) and every kind has its own payload. Fields are addressed by a
//! [`FieldId`] which renders as `"{code}/{name}"`, e.g. `t/body` or `a/title`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::IngestError;

/// Kind of a resource field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FieldType {
    Text = 0,
    File = 1,
    Link = 2,
    Conversation = 3,
    Layout = 4,
    Keywordset = 5,
    Datetime = 6,
    Generic = 7,
}

impl FieldType {
    /// One-letter code used in field ids and storage keys.
    pub fn code(&self) -> &'static str {
        match self {
            FieldType::Text => "t",
            FieldType::File => "f",
            FieldType::Link => "u",
            FieldType::Conversation => "c",
            FieldType::Layout => "l",
            FieldType::Keywordset => "k",
            FieldType::Datetime => "d",
            FieldType::Generic => "a",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "t" => Some(FieldType::Text),
            "f" => Some(FieldType::File),
            "u" => Some(FieldType::Link),
            "c" => Some(FieldType::Conversation),
            "l" => Some(FieldType::Layout),
            "k" => Some(FieldType::Keywordset),
            "d" => Some(FieldType::Datetime),
            "a" => Some(FieldType::Generic),
            _ => None,
        }
    }
}

/// Address of a field inside a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId {
    pub field_type: FieldType,
    pub field: String,
}

impl FieldId {
    pub fn new(field_type: FieldType, field: impl Into<String>) -> Self {
        Self {
            field_type,
            field: field.into(),
        }
    }
}

impl fmt::Display for FieldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.field_type.code(), self.field)
    }
}

impl FromStr for FieldId {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (code, field) = s
            .split_once('/')
            .ok_or_else(|| IngestError::InvalidInput(format!("malformed field id: {s}")))?;
        let field_type = FieldType::from_code(code)
            .ok_or_else(|| IngestError::InvalidInput(format!("unknown field type: {code}")))?;
        if field.is_empty() {
            return Err(IngestError::InvalidInput(format!("empty field name: {s}")));
        }
        Ok(FieldId::new(field_type, field))
    }
}

/// Where the bytes of a [`CloudFile`] live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CloudFileSource {
    Local = 0,
    Memory = 1,
    /// Hosted outside our storage; never exported.
    External = 2,
    /// Binary carried inside an export stream, not yet re-homed.
    Export = 3,
}

/// Reference to a binary stored in blob storage.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloudFile {
    #[prost(string, tag = "1")]
    pub uri: String,
    #[prost(uint64, tag = "2")]
    pub size: u64,
    #[prost(string, tag = "3")]
    pub content_type: String,
    #[prost(string, tag = "4")]
    pub bucket_name: String,
    #[prost(enumeration = "CloudFileSource", tag = "5")]
    pub source: i32,
    #[prost(string, tag = "6")]
    pub filename: String,
    #[prost(string, tag = "7")]
    pub md5: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FieldText {
    #[prost(string, tag = "1")]
    pub body: String,
    #[prost(string, tag = "2")]
    pub format: String,
    #[prost(string, tag = "3")]
    pub md5: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FieldFile {
    #[prost(message, optional, tag = "1")]
    pub file: Option<CloudFile>,
    #[prost(string, tag = "2")]
    pub language: String,
    #[prost(string, tag = "3")]
    pub password: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FieldLink {
    #[prost(string, tag = "1")]
    pub uri: String,
    #[prost(string, tag = "2")]
    pub language: String,
    #[prost(map = "string, string", tag = "3")]
    pub headers: HashMap<String, String>,
}

/// One message of a conversation field.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    #[prost(string, tag = "1")]
    pub ident: String,
    #[prost(string, tag = "2")]
    pub who: String,
    #[prost(string, repeated, tag = "3")]
    pub to: Vec<String>,
    #[prost(string, tag = "4")]
    pub body: String,
    #[prost(message, repeated, tag = "5")]
    pub attachments: Vec<CloudFile>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Conversation {
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<Message>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FieldLayout {
    #[prost(map = "string, string", tag = "1")]
    pub blocks: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Keyword {
    #[prost(string, tag = "1")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FieldKeywordset {
    #[prost(message, repeated, tag = "1")]
    pub keywords: Vec<Keyword>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FieldDatetime {
    /// Seconds since the Unix epoch.
    #[prost(int64, tag = "1")]
    pub value: i64,
}

/// Payload of a single field, one variant per [`FieldType`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(FieldText),
    File(FieldFile),
    Link(FieldLink),
    Conversation(Conversation),
    Layout(FieldLayout),
    Keywordset(FieldKeywordset),
    Datetime(FieldDatetime),
    /// Resource-level attributes exposed as fields (`a/title`).
    Generic(String),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Text(_) => FieldType::Text,
            FieldValue::File(_) => FieldType::File,
            FieldValue::Link(_) => FieldType::Link,
            FieldValue::Conversation(_) => FieldType::Conversation,
            FieldValue::Layout(_) => FieldType::Layout,
            FieldValue::Keywordset(_) => FieldType::Keywordset,
            FieldValue::Datetime(_) => FieldType::Datetime,
            FieldValue::Generic(_) => FieldType::Generic,
        }
    }

    /// Binaries referenced by this field.
    pub fn cloud_files(&self) -> Vec<&CloudFile> {
        match self {
            FieldValue::File(file) => file.file.iter().collect(),
            FieldValue::Conversation(conv) => conv
                .messages
                .iter()
                .flat_map(|m| m.attachments.iter())
                .collect(),
            FieldValue::Text(_)
            | FieldValue::Link(_)
            | FieldValue::Layout(_)
            | FieldValue::Keywordset(_)
            | FieldValue::Datetime(_)
            | FieldValue::Generic(_) => Vec::new(),
        }
    }

    /// Plain text a field contributes to the index when no extracted text
    /// has been produced for it yet.
    pub fn inline_text(&self) -> Option<String> {
        match self {
            FieldValue::Text(text) => Some(text.body.clone()),
            FieldValue::Generic(value) => Some(value.clone()),
            FieldValue::Conversation(conv) => {
                let joined = conv
                    .messages
                    .iter()
                    .map(|m| m.body.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                Some(joined)
            }
            FieldValue::Keywordset(set) => Some(
                set.keywords
                    .iter()
                    .map(|k| k.value.as_str())
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            FieldValue::File(_)
            | FieldValue::Link(_)
            | FieldValue::Layout(_)
            | FieldValue::Datetime(_) => None,
        }
    }

    /// Encode the payload for storage.
    pub fn encode_payload(&self) -> Vec<u8> {
        use prost::Message as _;
        match self {
            FieldValue::Text(v) => v.encode_to_vec(),
            FieldValue::File(v) => v.encode_to_vec(),
            FieldValue::Link(v) => v.encode_to_vec(),
            FieldValue::Conversation(v) => v.encode_to_vec(),
            FieldValue::Layout(v) => v.encode_to_vec(),
            FieldValue::Keywordset(v) => v.encode_to_vec(),
            FieldValue::Datetime(v) => v.encode_to_vec(),
            FieldValue::Generic(v) => v.as_bytes().to_vec(),
        }
    }

    /// Decode a stored payload of the given kind.
    pub fn decode_payload(field_type: FieldType, bytes: &[u8]) -> Result<Self, IngestError> {
        use prost::Message as _;
        Ok(match field_type {
            FieldType::Text => FieldValue::Text(FieldText::decode(bytes)?),
            FieldType::File => FieldValue::File(FieldFile::decode(bytes)?),
            FieldType::Link => FieldValue::Link(FieldLink::decode(bytes)?),
            FieldType::Conversation => FieldValue::Conversation(Conversation::decode(bytes)?),
            FieldType::Layout => FieldValue::Layout(FieldLayout::decode(bytes)?),
            FieldType::Keywordset => FieldValue::Keywordset(FieldKeywordset::decode(bytes)?),
            FieldType::Datetime => FieldValue::Datetime(FieldDatetime::decode(bytes)?),
            FieldType::Generic => FieldValue::Generic(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| IngestError::InvalidInput(e.to_string()))?,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_id_display_and_parse() {
        let id = FieldId::new(FieldType::Link, "homepage");
        assert_eq!(id.to_string(), "u/homepage");

        let parsed: FieldId = "u/homepage".parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_field_id_rejects_garbage() {
        assert!("x/foo".parse::<FieldId>().is_err());
        assert!("t".parse::<FieldId>().is_err());
        assert!("t/".parse::<FieldId>().is_err());
    }

    #[test]
    fn test_every_code_maps_back() {
        for ft in [
            FieldType::Text,
            FieldType::File,
            FieldType::Link,
            FieldType::Conversation,
            FieldType::Layout,
            FieldType::Keywordset,
            FieldType::Datetime,
            FieldType::Generic,
        ] {
            assert_eq!(FieldType::from_code(ft.code()), Some(ft));
        }
    }

    #[test]
    fn test_conversation_cloud_files() {
        let conv = FieldValue::Conversation(Conversation {
            messages: vec![
                Message {
                    ident: "1".into(),
                    attachments: vec![CloudFile {
                        uri: "a".into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                Message {
                    ident: "2".into(),
                    attachments: vec![CloudFile {
                        uri: "b".into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            ],
        });
        let uris: Vec<_> = conv.cloud_files().iter().map(|c| c.uri.clone()).collect();
        assert_eq!(uris, vec!["a", "b"]);
    }

    #[test]
    fn test_payload_decode_matches_kind() {
        let value = FieldValue::Text(FieldText {
            body: "hello".into(),
            ..Default::default()
        });
        let bytes = value.encode_payload();
        let decoded = FieldValue::decode_payload(FieldType::Text, &bytes).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(decoded.inline_text().as_deref(), Some("hello"));
    }
}
