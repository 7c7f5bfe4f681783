//! The registered migrations, in version order.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use ingest_processor::{knowledgebox, Resource};
use ingest_storage::Driver;

use crate::error::TaskError;
use crate::migrator::Migration;

/// Every migration this build knows about.
pub fn registry() -> Vec<Arc<dyn Migration>> {
    vec![Arc::new(RestoreResourceSlugs), Arc::new(ResetKbCounters)]
}

/// Re-create slug index entries missing for stored resources.
pub struct RestoreResourceSlugs;

#[async_trait]
impl Migration for RestoreResourceSlugs {
    fn version(&self) -> u32 {
        1
    }

    fn name(&self) -> &str {
        "restore_resource_slugs"
    }

    async fn migrate_kb(&self, driver: &Driver, kbid: &str) -> Result<(), TaskError> {
        let mut txn = driver.begin(false).await?;
        let mut restored = 0usize;
        for uuid in knowledgebox::list_resources(&mut txn, kbid).await? {
            let Some(resource) = Resource::load(&mut txn, kbid, &uuid).await? else {
                continue;
            };
            let slug = resource.basic.slug.as_str();
            if slug.is_empty() {
                continue;
            }
            if knowledgebox::get_resource_uuid_by_slug(&mut txn, kbid, slug)
                .await?
                .is_none()
            {
                knowledgebox::set_resource_slug(&mut txn, kbid, slug, &uuid).await?;
                restored += 1;
            }
        }
        if restored == 0 {
            txn.abort().await?;
        } else {
            txn.commit().await?;
            info!(kbid = %kbid, restored, "Restored resource slugs");
        }
        Ok(())
    }
}

/// Drop cached counters so they are recomputed with the current field layout.
pub struct ResetKbCounters;

#[async_trait]
impl Migration for ResetKbCounters {
    fn version(&self) -> u32 {
        2
    }

    fn name(&self) -> &str {
        "reset_kb_counters"
    }

    async fn migrate_kb(&self, driver: &Driver, kbid: &str) -> Result<(), TaskError> {
        let mut txn = driver.begin(false).await?;
        knowledgebox::invalidate_counters(&mut txn, kbid).await?;
        txn.commit().await?;
        Ok(())
    }
}
