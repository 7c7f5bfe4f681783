//! Learning configuration lookup for knowledge boxes.

use async_trait::async_trait;

use ingest_processor::knowledgebox;
use ingest_storage::Driver;
use ingest_types::LearningConfiguration;

use crate::error::ExportError;

#[async_trait]
pub trait LearningConfigProvider: Send + Sync {
    async fn get(&self, kbid: &str) -> Result<Option<LearningConfiguration>, ExportError>;

    async fn set(&self, kbid: &str, config: &LearningConfiguration) -> Result<(), ExportError>;
}

/// Reads and writes the configuration stored with the knowledge box.
#[derive(Clone)]
pub struct KvLearningConfigProvider {
    driver: Driver,
}

impl KvLearningConfigProvider {
    pub fn new(driver: Driver) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl LearningConfigProvider for KvLearningConfigProvider {
    async fn get(&self, kbid: &str) -> Result<Option<LearningConfiguration>, ExportError> {
        let mut txn = self.driver.begin(true).await?;
        Ok(knowledgebox::get_learning_config(&mut txn, kbid).await?)
    }

    async fn set(&self, kbid: &str, config: &LearningConfiguration) -> Result<(), ExportError> {
        let mut txn = self.driver.begin(false).await?;
        knowledgebox::set_learning_config(&mut txn, kbid, config).await?;
        txn.commit().await?;
        Ok(())
    }
}
