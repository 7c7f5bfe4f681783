//! Key layout of the metadata store.
//!
//! Keys are `/`-separated paths so that everything belonging to a knowledge
//! box, or to a resource, can be found or dropped with one prefix scan:
//!
//! ```text
//! /kbs/{kbid}                                  knowledge box record
//! /kbs/{kbid}/r/{uuid}                         resource basic metadata
//! /kbs/{kbid}/r/{uuid}/f/{type}/{field}        field payload
//! /kbs/{kbid}/r/{uuid}/f/{type}/{field}/...    extracted data of the field
//! /internal/ingest/txn/{partition}             applied seqid watermark
//! ```

use ingest_types::FieldId;

use crate::error::StorageError;

/// Prefix of every knowledge box key
pub const KBS_PREFIX: &str = "/kbs/";

/// Prefix of the KB slug index
pub const KB_SLUGS_PREFIX: &str = "/kbslugs/";

pub fn kb(kbid: &str) -> String {
    format!("/kbs/{kbid}")
}

/// Prefix covering every key of a knowledge box, including its record.
pub fn kb_prefix(kbid: &str) -> String {
    format!("/kbs/{kbid}/")
}

pub fn kb_slug(slug: &str) -> String {
    format!("/kbslugs/{slug}")
}

pub fn kb_shards(kbid: &str) -> String {
    format!("/kbs/{kbid}/shards")
}

pub fn kb_entities(kbid: &str) -> String {
    format!("/kbs/{kbid}/entities")
}

pub fn kb_labels(kbid: &str) -> String {
    format!("/kbs/{kbid}/labels")
}

pub fn kb_learning_config(kbid: &str) -> String {
    format!("/kbs/{kbid}/learning_config")
}

pub fn kb_counters(kbid: &str) -> String {
    format!("/kbs/{kbid}/counters")
}

pub fn kb_migration_version(kbid: &str) -> String {
    format!("/kbs/{kbid}/migration_version")
}

pub fn resource(kbid: &str, uuid: &str) -> String {
    format!("/kbs/{kbid}/r/{uuid}")
}

/// Prefix of all resources of a KB.
pub fn resources_prefix(kbid: &str) -> String {
    format!("/kbs/{kbid}/r/")
}

/// Prefix of the keys nested under one resource (not the basic key itself).
pub fn resource_children_prefix(kbid: &str, uuid: &str) -> String {
    format!("/kbs/{kbid}/r/{uuid}/")
}

pub fn resource_shard(kbid: &str, uuid: &str) -> String {
    format!("/kbs/{kbid}/r/{uuid}/shard")
}

pub fn resource_slug(kbid: &str, slug: &str) -> String {
    format!("/kbs/{kbid}/s/{slug}")
}

pub fn resource_field(kbid: &str, uuid: &str, field: &FieldId) -> String {
    format!(
        "/kbs/{kbid}/r/{uuid}/f/{}/{}",
        field.field_type.code(),
        field.field
    )
}

/// Prefix of all field keys of a resource.
pub fn resource_fields_prefix(kbid: &str, uuid: &str) -> String {
    format!("/kbs/{kbid}/r/{uuid}/f/")
}

pub fn field_extracted_text(kbid: &str, uuid: &str, field: &FieldId) -> String {
    format!("{}/extracted_text", resource_field(kbid, uuid, field))
}

pub fn field_vectors(kbid: &str, uuid: &str, field: &FieldId) -> String {
    format!("{}/vectors", resource_field(kbid, uuid, field))
}

pub fn field_metadata(kbid: &str, uuid: &str, field: &FieldId) -> String {
    format!("{}/metadata", resource_field(kbid, uuid, field))
}

pub fn kb_task(kbid: &str, task_id: &str) -> String {
    format!("/kbs/{kbid}/async_tasks/{task_id}")
}

pub fn kb_tasks_prefix(kbid: &str) -> String {
    format!("/kbs/{kbid}/async_tasks/")
}

/// Applied seqid watermark of a transport partition.
pub fn txn_watermark(partition: &str) -> String {
    format!("/internal/ingest/txn/{partition}")
}

/// Pull cursor of the processing engine for one partition.
pub fn pull_cursor(pull_type: &str, partition: &str) -> String {
    format!("/internal/processing/pull/{pull_type}/{partition}")
}

pub fn global_migration_version() -> String {
    "/internal/migrations/global".to_string()
}

pub fn lock(name: &str) -> String {
    format!("/internal/locks/{name}")
}

/// Extract `(uuid)` from a key under [`resources_prefix`] when the key is a
/// resource basic key (no nested path).
pub fn parse_resource_key(kbid: &str, key: &str) -> Option<String> {
    let rest = key.strip_prefix(&resources_prefix(kbid))?;
    if rest.is_empty() || rest.contains('/') {
        return None;
    }
    Some(rest.to_string())
}

/// Parse a field id out of a field payload key.
pub fn parse_field_key(kbid: &str, uuid: &str, key: &str) -> Result<Option<FieldId>, StorageError> {
    let Some(rest) = key.strip_prefix(&resource_fields_prefix(kbid, uuid)) else {
        return Ok(None);
    };
    let parts: Vec<&str> = rest.split('/').collect();
    // type/field only; longer paths are extracted data
    if parts.len() != 2 {
        return Ok(None);
    }
    let id = format!("{}/{}", parts[0], parts[1])
        .parse::<FieldId>()
        .map_err(|e| StorageError::Key(e.to_string()))?;
    Ok(Some(id))
}
