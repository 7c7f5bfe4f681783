//! Stored resources and the merge of broker messages into them.

use chrono::Utc;
use futures::TryStreamExt;
use tracing::{debug, warn};

use ingest_storage::{keys, Driver, Transaction};
use ingest_types::{
    Basic, BrokerMessage, ExtractedText, FieldId, FieldMetadata, FieldValue, FieldVectors,
    MessageSource, MessageType, ResourceStatus,
};

use crate::error::ProcessorError;
use crate::knowledgebox;

/// A resource as held in the metadata store: its basic record plus the
/// location of its fields.
#[derive(Debug, Clone)]
pub struct Resource {
    pub kbid: String,
    pub uuid: String,
    pub basic: Basic,
}

impl Resource {
    pub async fn load(
        txn: &mut Transaction,
        kbid: &str,
        uuid: &str,
    ) -> Result<Option<Self>, ProcessorError> {
        let basic: Option<Basic> = txn.get_proto(&keys::resource(kbid, uuid)).await?;
        Ok(basic.map(|basic| Self {
            kbid: kbid.to_string(),
            uuid: uuid.to_string(),
            basic,
        }))
    }

    /// Create an empty resource and claim its slug.
    pub async fn create(
        txn: &mut Transaction,
        kbid: &str,
        uuid: &str,
        slug: &str,
    ) -> Result<Self, ProcessorError> {
        let now = Utc::now().timestamp_millis();
        let mut basic = Basic {
            slug: slug.to_string(),
            created: now,
            modified: now,
            ..Default::default()
        };
        basic.set_status(ResourceStatus::Pending);
        let resource = Self {
            kbid: kbid.to_string(),
            uuid: uuid.to_string(),
            basic,
        };
        knowledgebox::set_resource_slug(txn, kbid, slug, uuid).await?;
        resource.save_basic(txn).await?;
        debug!(kbid = %kbid, uuid = %uuid, slug = %slug, "Created resource");
        Ok(resource)
    }

    pub async fn save_basic(&self, txn: &mut Transaction) -> Result<(), ProcessorError> {
        Ok(txn
            .set_proto(&keys::resource(&self.kbid, &self.uuid), &self.basic)
            .await?)
    }

    /// Merge `bm` into the resource. Returns whether anything changed.
    ///
    /// `seqid` is recorded as the resource's last applied sequence when the
    /// message came through the ordered transport.
    pub async fn apply(
        &mut self,
        txn: &mut Transaction,
        bm: &BrokerMessage,
        seqid: Option<i64>,
    ) -> Result<bool, ProcessorError> {
        let mut modified = bm.reindex;

        if let Some(basic) = &bm.basic {
            modified |= self.merge_basic(basic);
        }

        let mutations = bm.field_mutations();
        let has_writer_fields = !mutations.is_empty();
        for (field, value) in mutations {
            let key = keys::resource_field(&self.kbid, &self.uuid, &field);
            txn.set(&key, value.encode_payload()).await?;
            modified = true;
        }

        for field in bm.deleted_field_ids() {
            self.delete_field(txn, &field).await?;
            modified = true;
        }

        for (raw, text) in &bm.extracted_text {
            if let Some(field) = parse_field(raw) {
                let key = keys::field_extracted_text(&self.kbid, &self.uuid, &field);
                txn.set_proto(&key, text).await?;
                modified = true;
            }
        }
        for (raw, vectors) in &bm.field_vectors {
            if let Some(field) = parse_field(raw) {
                let key = keys::field_vectors(&self.kbid, &self.uuid, &field);
                txn.set_proto(&key, vectors).await?;
                modified = true;
            }
        }
        for (raw, metadata) in &bm.field_metadata {
            if let Some(field) = parse_field(raw) {
                let key = keys::field_metadata(&self.kbid, &self.uuid, &field);
                txn.set_proto(&key, metadata).await?;
                modified = true;
            }
        }

        if !modified {
            return Ok(false);
        }

        match bm.source() {
            MessageSource::Processor if bm.has_processor_data() => {
                self.basic.set_status(ResourceStatus::Processed);
            }
            MessageSource::Writer if has_writer_fields => {
                self.basic.set_status(ResourceStatus::Pending);
            }
            _ => {}
        }
        self.basic.modified = Utc::now().timestamp_millis();
        if let Some(seqid) = seqid {
            self.basic.last_seqid = seqid;
        }
        self.save_basic(txn).await?;
        Ok(true)
    }

    fn merge_basic(&mut self, incoming: &Basic) -> bool {
        let mut changed = false;
        if !incoming.title.is_empty() && incoming.title != self.basic.title {
            self.basic.title = incoming.title.clone();
            changed = true;
        }
        if !incoming.summary.is_empty() && incoming.summary != self.basic.summary {
            self.basic.summary = incoming.summary.clone();
            changed = true;
        }
        if !incoming.icon.is_empty() && incoming.icon != self.basic.icon {
            self.basic.icon = incoming.icon.clone();
            changed = true;
        }
        if incoming.queue != self.basic.queue {
            self.basic.queue = incoming.queue;
            changed = true;
        }
        if incoming.created > 0 && incoming.created != self.basic.created {
            self.basic.created = incoming.created;
            changed = true;
        }
        changed
    }

    async fn delete_field(&self, txn: &mut Transaction, field: &FieldId) -> Result<(), ProcessorError> {
        let key = keys::resource_field(&self.kbid, &self.uuid, field);
        txn.delete_by_prefix(&format!("{key}/")).await?;
        txn.delete(&key).await?;
        Ok(())
    }

    /// Every stored field with its payload, ordered by field id.
    pub async fn fields(
        &self,
        txn: &mut Transaction,
    ) -> Result<Vec<(FieldId, FieldValue)>, ProcessorError> {
        let prefix = keys::resource_fields_prefix(&self.kbid, &self.uuid);
        let all: Vec<String> = txn.keys(&prefix, None).try_collect().await?;
        let mut fields = Vec::new();
        for key in all {
            let Some(field) = keys::parse_field_key(&self.kbid, &self.uuid, &key)? else {
                continue;
            };
            if let Some(bytes) = txn.get(&key).await? {
                let value = FieldValue::decode_payload(field.field_type, &bytes)?;
                fields.push((field, value));
            }
        }
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(fields)
    }

    pub async fn extracted_text(
        &self,
        txn: &mut Transaction,
        field: &FieldId,
    ) -> Result<Option<ExtractedText>, ProcessorError> {
        Ok(txn
            .get_proto(&keys::field_extracted_text(&self.kbid, &self.uuid, field))
            .await?)
    }

    pub async fn vectors(
        &self,
        txn: &mut Transaction,
        field: &FieldId,
    ) -> Result<Option<FieldVectors>, ProcessorError> {
        Ok(txn
            .get_proto(&keys::field_vectors(&self.kbid, &self.uuid, field))
            .await?)
    }

    pub async fn metadata(
        &self,
        txn: &mut Transaction,
        field: &FieldId,
    ) -> Result<Option<FieldMetadata>, ProcessorError> {
        Ok(txn
            .get_proto(&keys::field_metadata(&self.kbid, &self.uuid, field))
            .await?)
    }

    /// Drop every key of the resource, its slug and its shard mapping.
    pub async fn delete(&self, txn: &mut Transaction) -> Result<usize, ProcessorError> {
        let removed = txn
            .delete_by_prefix(&keys::resource_children_prefix(&self.kbid, &self.uuid))
            .await?;
        txn.delete(&keys::resource(&self.kbid, &self.uuid)).await?;
        if !self.basic.slug.is_empty() {
            txn.delete(&keys::resource_slug(&self.kbid, &self.basic.slug))
                .await?;
        }
        Ok(removed + 1)
    }

    /// Rebuild a broker message carrying the full state of the resource.
    pub async fn to_broker_message(&self, txn: &mut Transaction) -> Result<BrokerMessage, ProcessorError> {
        let mut bm = BrokerMessage {
            kbid: self.kbid.clone(),
            uuid: self.uuid.clone(),
            slug: self.basic.slug.clone(),
            basic: Some(self.basic.clone()),
            ..Default::default()
        };
        bm.set_message_type(MessageType::Autocommit);
        bm.set_source(MessageSource::Writer);

        for (field, value) in self.fields(txn).await? {
            let name = field.field.clone();
            match value {
                FieldValue::Text(v) => {
                    bm.texts.insert(name, v);
                }
                FieldValue::File(v) => {
                    bm.files.insert(name, v);
                }
                FieldValue::Link(v) => {
                    bm.links.insert(name, v);
                }
                FieldValue::Conversation(v) => {
                    bm.conversations.insert(name, v);
                }
                FieldValue::Layout(v) => {
                    bm.layouts.insert(name, v);
                }
                FieldValue::Keywordset(v) => {
                    bm.keywordsets.insert(name, v);
                }
                FieldValue::Datetime(v) => {
                    bm.datetimes.insert(name, v);
                }
                // Carried by basic
                FieldValue::Generic(_) => {}
            }
            let rendered = field.to_string();
            if let Some(text) = self.extracted_text(txn, &field).await? {
                bm.extracted_text.insert(rendered.clone(), text);
            }
            if let Some(vectors) = self.vectors(txn, &field).await? {
                bm.field_vectors.insert(rendered.clone(), vectors);
            }
            if let Some(metadata) = self.metadata(txn, &field).await? {
                bm.field_metadata.insert(rendered, metadata);
            }
        }
        Ok(bm)
    }
}

fn parse_field(raw: &str) -> Option<FieldId> {
    match raw.parse::<FieldId>() {
        Ok(field) => Some(field),
        Err(e) => {
            warn!(field = %raw, error = %e, "Skipping data for malformed field id");
            None
        }
    }
}

/// Flag a resource as failed in a fresh transaction.
///
/// Returns `false` when the resource does not exist.
pub async fn mark_error(driver: &Driver, kbid: &str, uuid: &str) -> Result<bool, ProcessorError> {
    let mut txn = driver.begin(false).await?;
    let Some(mut resource) = Resource::load(&mut txn, kbid, uuid).await? else {
        txn.abort().await?;
        return Ok(false);
    };
    resource.basic.set_status(ResourceStatus::Error);
    resource.basic.modified = Utc::now().timestamp_millis();
    resource.save_basic(&mut txn).await?;
    txn.commit().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_types::{FieldText, FieldType, Paragraph};
    use pretty_assertions::assert_eq;

    fn writer_message(text: &str) -> BrokerMessage {
        let mut bm = BrokerMessage {
            kbid: "kb1".into(),
            uuid: "r1".into(),
            basic: Some(Basic {
                title: "Doc".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        bm.texts.insert(
            "body".into(),
            FieldText {
                body: text.into(),
                ..Default::default()
            },
        );
        bm
    }

    async fn created(driver: &Driver) -> Resource {
        let mut txn = driver.begin(false).await.unwrap();
        let resource = Resource::create(&mut txn, "kb1", "r1", "doc").await.unwrap();
        txn.commit().await.unwrap();
        resource
    }

    #[tokio::test]
    async fn test_apply_writer_fields() {
        let driver = Driver::in_memory();
        let mut resource = created(&driver).await;

        let mut txn = driver.begin(false).await.unwrap();
        assert!(resource
            .apply(&mut txn, &writer_message("hello"), Some(7))
            .await
            .unwrap());
        txn.commit().await.unwrap();

        let mut txn = driver.begin(true).await.unwrap();
        let loaded = Resource::load(&mut txn, "kb1", "r1").await.unwrap().unwrap();
        assert_eq!(loaded.basic.title, "Doc");
        assert_eq!(loaded.basic.last_seqid, 7);
        assert_eq!(loaded.basic.status(), ResourceStatus::Pending);

        let ids: Vec<String> = loaded
            .fields(&mut txn)
            .await
            .unwrap()
            .iter()
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(ids, vec!["t/body", "a/title"]);
    }

    #[tokio::test]
    async fn test_apply_processor_data_marks_processed() {
        let driver = Driver::in_memory();
        let mut resource = created(&driver).await;

        let mut bm = BrokerMessage {
            kbid: "kb1".into(),
            uuid: "r1".into(),
            ..Default::default()
        };
        bm.set_source(MessageSource::Processor);
        bm.extracted_text.insert(
            "t/body".into(),
            ExtractedText {
                text: "hello world".into(),
                ..Default::default()
            },
        );
        bm.field_metadata.insert(
            "t/body".into(),
            FieldMetadata {
                paragraphs: vec![Paragraph { start: 0, end: 5 }],
                ..Default::default()
            },
        );
        // Malformed ids are skipped, not fatal
        bm.field_vectors.insert("bogus".into(), FieldVectors::default());

        let mut txn = driver.begin(false).await.unwrap();
        assert!(resource.apply(&mut txn, &bm, None).await.unwrap());
        assert_eq!(resource.basic.status(), ResourceStatus::Processed);

        let field = FieldId::new(FieldType::Text, "body");
        let text = resource.extracted_text(&mut txn, &field).await.unwrap().unwrap();
        assert_eq!(text.text, "hello world");
        assert!(resource.vectors(&mut txn, &field).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_message_is_unmodified() {
        let driver = Driver::in_memory();
        let mut resource = created(&driver).await;
        let bm = BrokerMessage {
            kbid: "kb1".into(),
            uuid: "r1".into(),
            ..Default::default()
        };
        let mut txn = driver.begin(false).await.unwrap();
        assert!(!resource.apply(&mut txn, &bm, Some(1)).await.unwrap());
        assert!(!txn.has_writes());
    }

    #[tokio::test]
    async fn test_delete_field_removes_extracted_data() {
        let driver = Driver::in_memory();
        let mut resource = created(&driver).await;
        let mut bm = writer_message("hello");
        bm.extracted_text.insert("t/body".into(), ExtractedText::default());

        let mut txn = driver.begin(false).await.unwrap();
        resource.apply(&mut txn, &bm, None).await.unwrap();

        let deletion = BrokerMessage {
            delete_fields: vec!["t/body".into()],
            ..Default::default()
        };
        resource.apply(&mut txn, &deletion, None).await.unwrap();

        let field = FieldId::new(FieldType::Text, "body");
        assert!(resource.extracted_text(&mut txn, &field).await.unwrap().is_none());
        let ids: Vec<String> = resource
            .fields(&mut txn)
            .await
            .unwrap()
            .iter()
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(ids, vec!["a/title"]);
    }

    #[tokio::test]
    async fn test_delete_and_mark_error() {
        let driver = Driver::in_memory();
        let resource = created(&driver).await;

        assert!(mark_error(&driver, "kb1", "r1").await.unwrap());
        let mut txn = driver.begin(true).await.unwrap();
        let loaded = Resource::load(&mut txn, "kb1", "r1").await.unwrap().unwrap();
        assert_eq!(loaded.basic.status(), ResourceStatus::Error);

        let mut txn = driver.begin(false).await.unwrap();
        resource.delete(&mut txn).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = driver.begin(true).await.unwrap();
        assert!(Resource::load(&mut txn, "kb1", "r1").await.unwrap().is_none());
        assert!(knowledgebox::get_resource_uuid_by_slug(&mut txn, "kb1", "doc")
            .await
            .unwrap()
            .is_none());
        assert!(!mark_error(&driver, "kb1", "r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_to_broker_message() {
        let driver = Driver::in_memory();
        let mut resource = created(&driver).await;
        let mut bm = writer_message("hello");
        bm.extracted_text.insert(
            "t/body".into(),
            ExtractedText {
                text: "hello".into(),
                ..Default::default()
            },
        );
        let mut txn = driver.begin(false).await.unwrap();
        resource.apply(&mut txn, &bm, None).await.unwrap();

        let rebuilt = resource.to_broker_message(&mut txn).await.unwrap();
        assert_eq!(rebuilt.slug, "doc");
        assert_eq!(rebuilt.texts["body"].body, "hello");
        assert_eq!(rebuilt.extracted_text["t/body"].text, "hello");
        assert_eq!(rebuilt.basic.unwrap().title, "Doc");
    }
}
