//! Knowledge box records and their per-KB metadata.
//!
//! All functions operate on a caller-owned [`Transaction`]; nothing here
//! commits.

use chrono::Utc;
use futures::TryStreamExt;
use tracing::info;

use ingest_storage::{keys, Driver, Transaction};
use ingest_types::{
    EntitiesGroups, KnowledgeBoxRecord, Labels, LearningConfiguration, ShardObject, ShardSet,
};

use crate::error::ProcessorError;

pub async fn exists(txn: &mut Transaction, kbid: &str) -> Result<bool, ProcessorError> {
    Ok(txn.get(&keys::kb(kbid)).await?.is_some())
}

pub async fn get(
    txn: &mut Transaction,
    kbid: &str,
) -> Result<Option<KnowledgeBoxRecord>, ProcessorError> {
    Ok(txn.get_json(&keys::kb(kbid)).await?)
}

pub async fn get_kbid_by_slug(
    txn: &mut Transaction,
    slug: &str,
) -> Result<Option<String>, ProcessorError> {
    Ok(txn
        .get(&keys::kb_slug(slug))
        .await?
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
}

/// Ids of every knowledge box, ordered by slug.
pub async fn list_kbids(txn: &mut Transaction) -> Result<Vec<String>, ProcessorError> {
    let slug_keys: Vec<String> = txn.keys(keys::KB_SLUGS_PREFIX, None).try_collect().await?;
    let mut kbids = Vec::with_capacity(slug_keys.len());
    for key in slug_keys {
        if let Some(bytes) = txn.get(&key).await? {
            kbids.push(String::from_utf8_lossy(&bytes).into_owned());
        }
    }
    Ok(kbids)
}

/// One shard replicated on every given node.
pub fn new_shard_set(index_nodes: &[String]) -> ShardSet {
    ShardSet {
        shards: vec![ShardObject {
            shard_id: uuid::Uuid::new_v4().simple().to_string(),
            replicas: index_nodes.to_vec(),
            read_only: false,
        }],
        active: 0,
    }
}

/// Create a knowledge box with one shard. Returns the new kbid.
pub async fn create(
    txn: &mut Transaction,
    slug: &str,
    title: &str,
    index_nodes: &[String],
    learning_config: Option<&LearningConfiguration>,
) -> Result<String, ProcessorError> {
    if slug.is_empty() {
        return Err(ProcessorError::InvalidInput("empty knowledge box slug".to_string()));
    }
    if get_kbid_by_slug(txn, slug).await?.is_some() {
        return Err(ProcessorError::KnowledgeBoxConflict(slug.to_string()));
    }
    let kbid = uuid::Uuid::new_v4().to_string();
    let record = KnowledgeBoxRecord {
        kbid: kbid.clone(),
        slug: slug.to_string(),
        title: title.to_string(),
        created_at: Utc::now(),
    };
    txn.set_json(&keys::kb(&kbid), &record).await?;
    txn.set(&keys::kb_slug(slug), kbid.clone().into_bytes()).await?;
    txn.set_json(&keys::kb_shards(&kbid), &new_shard_set(index_nodes))
        .await?;
    if let Some(config) = learning_config {
        set_learning_config(txn, &kbid, config).await?;
    }
    info!(kbid = %kbid, slug = %slug, "Created knowledge box");
    Ok(kbid)
}

/// Create a knowledge box in its own transaction.
pub async fn create_knowledgebox(
    driver: &Driver,
    slug: &str,
    title: &str,
    index_nodes: &[String],
    learning_config: Option<&LearningConfiguration>,
) -> Result<String, ProcessorError> {
    let mut txn = driver.begin(false).await?;
    let result = create(&mut txn, slug, title, index_nodes, learning_config).await;
    match result {
        Ok(kbid) => {
            txn.commit().await?;
            Ok(kbid)
        }
        Err(e) => {
            txn.abort().await?;
            Err(e)
        }
    }
}

/// Remove a knowledge box and everything under it.
pub async fn delete(txn: &mut Transaction, kbid: &str) -> Result<bool, ProcessorError> {
    let Some(record) = get(txn, kbid).await? else {
        return Ok(false);
    };
    let removed = txn.delete_by_prefix(&keys::kb_prefix(kbid)).await?;
    txn.delete(&keys::kb(kbid)).await?;
    txn.delete(&keys::kb_slug(&record.slug)).await?;
    info!(kbid = %kbid, keys = removed, "Deleted knowledge box");
    Ok(true)
}

pub async fn get_shards(txn: &mut Transaction, kbid: &str) -> Result<Option<ShardSet>, ProcessorError> {
    Ok(txn.get_json(&keys::kb_shards(kbid)).await?)
}

pub async fn set_shards(txn: &mut Transaction, kbid: &str, shards: &ShardSet) -> Result<(), ProcessorError> {
    Ok(txn.set_json(&keys::kb_shards(kbid), shards).await?)
}

pub async fn get_resource_shard_id(
    txn: &mut Transaction,
    kbid: &str,
    uuid: &str,
) -> Result<Option<String>, ProcessorError> {
    Ok(txn
        .get(&keys::resource_shard(kbid, uuid))
        .await?
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
}

pub async fn set_resource_shard_id(
    txn: &mut Transaction,
    kbid: &str,
    uuid: &str,
    shard_id: &str,
) -> Result<(), ProcessorError> {
    Ok(txn
        .set(&keys::resource_shard(kbid, uuid), shard_id.as_bytes().to_vec())
        .await?)
}

pub async fn get_resource_uuid_by_slug(
    txn: &mut Transaction,
    kbid: &str,
    slug: &str,
) -> Result<Option<String>, ProcessorError> {
    Ok(txn
        .get(&keys::resource_slug(kbid, slug))
        .await?
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
}

pub async fn set_resource_slug(
    txn: &mut Transaction,
    kbid: &str,
    slug: &str,
    uuid: &str,
) -> Result<(), ProcessorError> {
    Ok(txn
        .set(&keys::resource_slug(kbid, slug), uuid.as_bytes().to_vec())
        .await?)
}

/// Pick a free resource slug, appending `-{n}` until it is unique.
pub async fn allocate_resource_slug(
    txn: &mut Transaction,
    kbid: &str,
    desired: &str,
) -> Result<String, ProcessorError> {
    let mut candidate = desired.to_string();
    let mut n = 1;
    while get_resource_uuid_by_slug(txn, kbid, &candidate).await?.is_some() {
        candidate = format!("{desired}-{n}");
        n += 1;
    }
    Ok(candidate)
}

/// Uuids of every resource of a knowledge box.
pub async fn list_resources(txn: &mut Transaction, kbid: &str) -> Result<Vec<String>, ProcessorError> {
    let all: Vec<String> = txn
        .keys(&keys::resources_prefix(kbid), None)
        .try_collect()
        .await?;
    Ok(all
        .iter()
        .filter_map(|key| keys::parse_resource_key(kbid, key))
        .collect())
}

pub async fn get_entities(
    txn: &mut Transaction,
    kbid: &str,
) -> Result<Option<EntitiesGroups>, ProcessorError> {
    Ok(txn.get_proto(&keys::kb_entities(kbid)).await?)
}

pub async fn set_entities(
    txn: &mut Transaction,
    kbid: &str,
    entities: &EntitiesGroups,
) -> Result<(), ProcessorError> {
    Ok(txn.set_proto(&keys::kb_entities(kbid), entities).await?)
}

pub async fn get_labels(txn: &mut Transaction, kbid: &str) -> Result<Option<Labels>, ProcessorError> {
    Ok(txn.get_proto(&keys::kb_labels(kbid)).await?)
}

pub async fn set_labels(txn: &mut Transaction, kbid: &str, labels: &Labels) -> Result<(), ProcessorError> {
    Ok(txn.set_proto(&keys::kb_labels(kbid), labels).await?)
}

pub async fn get_learning_config(
    txn: &mut Transaction,
    kbid: &str,
) -> Result<Option<LearningConfiguration>, ProcessorError> {
    Ok(txn.get_json(&keys::kb_learning_config(kbid)).await?)
}

pub async fn set_learning_config(
    txn: &mut Transaction,
    kbid: &str,
    config: &LearningConfiguration,
) -> Result<(), ProcessorError> {
    Ok(txn.set_json(&keys::kb_learning_config(kbid), config).await?)
}

/// Drop the cached counters; they are recomputed on next read.
pub async fn invalidate_counters(txn: &mut Transaction, kbid: &str) -> Result<(), ProcessorError> {
    Ok(txn.delete(&keys::kb_counters(kbid)).await?)
}
