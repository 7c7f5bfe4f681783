//! Publishing broker messages onto the ingest stream.

use std::sync::Arc;

use prost::Message as _;
use tracing::{info, warn};

use ingest_storage::BlobStorage;
use ingest_types::{
    BrokerMessage, BrokerMessageBlobReference, ConsumerSettings, MESSAGE_TYPE_HEADER,
    PROXY_MESSAGE_TYPE,
};

use crate::error::{ConsumerError, TransportError};
use crate::transport::{Headers, Transport};

#[derive(Clone)]
pub struct IngestPublisher {
    transport: Arc<dyn Transport>,
    blob: Arc<dyn BlobStorage>,
    settings: ConsumerSettings,
}

impl IngestPublisher {
    pub fn new(transport: Arc<dyn Transport>, blob: Arc<dyn BlobStorage>, settings: ConsumerSettings) -> Self {
        Self {
            transport,
            blob,
            settings,
        }
    }

    /// Publish a writer message to its partition. Returns the seqid.
    pub async fn commit(&self, message: &BrokerMessage, partition: &str) -> Result<u64, ConsumerError> {
        let subject = self.settings.subject(partition);
        self.publish_or_proxy(&subject, message, message.encode_to_vec())
            .await
    }

    /// Publish a processing result to the processed-messages subject.
    pub async fn commit_processed(&self, message: &BrokerMessage, data: Vec<u8>) -> Result<u64, ConsumerError> {
        let subject = self.settings.processed_subject.clone();
        self.publish_or_proxy(&subject, message, data).await
    }

    /// Publish inline, or through blob storage when the payload is over the
    /// transport limit.
    async fn publish_or_proxy(
        &self,
        subject: &str,
        message: &BrokerMessage,
        data: Vec<u8>,
    ) -> Result<u64, ConsumerError> {
        if data.len() <= self.transport.max_payload() {
            match self.transport.publish(subject, data, Headers::new()).await {
                Err(TransportError::PayloadTooLarge { size, max }) => {
                    warn!(size, max, "Transport rejected payload size, proxying through blob storage");
                    let data = message.encode_to_vec();
                    return self.publish_proxy(subject, message, data).await;
                }
                other => return Ok(other?),
            }
        }
        self.publish_proxy(subject, message, data).await
    }

    async fn publish_proxy(
        &self,
        subject: &str,
        message: &BrokerMessage,
        data: Vec<u8>,
    ) -> Result<u64, ConsumerError> {
        let size = data.len();
        let storage_key = self
            .blob
            .set_stream_message(&message.kbid, &message.uuid, data)
            .await?;
        let reference = BrokerMessageBlobReference {
            kbid: message.kbid.clone(),
            uuid: message.uuid.clone(),
            storage_key: storage_key.clone(),
        };
        let mut headers = Headers::new();
        headers.insert(MESSAGE_TYPE_HEADER.to_string(), PROXY_MESSAGE_TYPE.to_string());
        let seq = self
            .transport
            .publish(subject, reference.encode_to_vec(), headers)
            .await?;
        info!(
            kbid = %message.kbid,
            uuid = %message.uuid,
            size,
            storage_key = %storage_key,
            "Published oversized message through blob storage"
        );
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::transport::SubscribeOptions;
    use ingest_storage::MemoryBlobStorage;
    use std::time::Duration;

    #[tokio::test]
    async fn test_oversized_message_is_proxied() {
        let transport = MemoryTransport::with_max_payload(64);
        transport.add_stream("kb-ingest", &["ingest.>"]);
        let blob = MemoryBlobStorage::new();
        let publisher = IngestPublisher::new(
            Arc::new(transport.clone()),
            Arc::new(blob.clone()),
            ConsumerSettings::default(),
        );

        let small = BrokerMessage {
            kbid: "kb1".into(),
            uuid: "r1".into(),
            ..Default::default()
        };
        let big = BrokerMessage {
            kbid: "kb1".into(),
            uuid: "r2".into(),
            slug: "x".repeat(200),
            ..Default::default()
        };
        assert_eq!(publisher.commit(&small, "1").await.unwrap(), 1);
        assert_eq!(publisher.commit(&big, "1").await.unwrap(), 2);
        assert_eq!(blob.len(), 1);

        let mut sub = transport
            .pull_subscribe(SubscribeOptions {
                stream: "kb-ingest".into(),
                subject: "ingest.1".into(),
                durable: "ingest-1".into(),
                start_seq: Some(2),
                ack_wait: Duration::from_secs(5),
                max_deliver: 1,
                max_ack_pending: 1,
            })
            .await
            .unwrap();
        let msg = sub.fetch(1, Duration::from_millis(50)).await.unwrap().remove(0);
        assert_eq!(msg.header(MESSAGE_TYPE_HEADER), Some(PROXY_MESSAGE_TYPE));
        let reference = BrokerMessageBlobReference::decode(msg.data.as_slice()).unwrap();
        assert_eq!(reference.uuid, "r2");
        let stored = blob.get_stream_message(&reference.storage_key).await.unwrap();
        assert_eq!(BrokerMessage::decode(stored.as_slice()).unwrap(), big);
    }
}
