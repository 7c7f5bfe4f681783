//! Derivation of index messages from stored resources.

use ingest_storage::Transaction;
use ingest_types::{
    IndexMessage, IndexOperation, MessageSource, ParagraphInfo, TextInfo, VectorInfo,
};

use crate::error::ProcessorError;
use crate::resource::Resource;

/// Characters `start..end` of `text`. Offsets past the end are clamped.
fn char_slice(text: &str, start: u32, end: u32) -> String {
    let start = start as usize;
    let end = end as usize;
    if end <= start {
        return String::new();
    }
    text.chars().skip(start).take(end - start).collect()
}

/// Build the SET message for `resource` from what the transaction holds.
///
/// Each field contributes its extracted text when the processing engine
/// produced one, otherwise its inline text.
pub async fn build_index_message(
    txn: &mut Transaction,
    resource: &Resource,
    shard_id: &str,
    seqid: i64,
    partition: &str,
    source: MessageSource,
) -> Result<IndexMessage, ProcessorError> {
    let mut message = IndexMessage {
        kbid: resource.kbid.clone(),
        shard: shard_id.to_string(),
        resource: resource.uuid.clone(),
        seqid,
        partition: partition.to_string(),
        ..Default::default()
    };
    message.set_kind(IndexOperation::Set);
    message.set_source(source);
    message
        .labels
        .push(format!("/n/s/{:?}", resource.basic.status()));

    for (field, value) in resource.fields(txn).await? {
        let rendered = field.to_string();
        let text = match resource.extracted_text(txn, &field).await? {
            Some(extracted) => Some(extracted.text),
            None => value.inline_text(),
        };
        let text = text.unwrap_or_default();

        if let Some(metadata) = resource.metadata(txn, &field).await? {
            for paragraph in &metadata.paragraphs {
                message.paragraphs.push(ParagraphInfo {
                    field: rendered.clone(),
                    start: paragraph.start,
                    end: paragraph.end,
                    text: char_slice(&text, paragraph.start, paragraph.end),
                });
            }
            message.labels.extend(metadata.labels.iter().cloned());
        }
        if let Some(vectors) = resource.vectors(txn, &field).await? {
            message
                .vectors
                .extend(vectors.vectors.into_iter().map(|v| VectorInfo {
                    field: rendered.clone(),
                    start: v.start,
                    end: v.end,
                    vector: v.vector,
                }));
        }
        if !text.is_empty() {
            message.texts.push(TextInfo {
                field: rendered,
                text,
            });
        }
    }
    message.labels.sort();
    message.labels.dedup();
    Ok(message)
}
