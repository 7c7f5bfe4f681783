//! Keeps a delivery alive while it is being processed.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::transport::TransportMessage;

/// Signals in-progress for a message every `interval` until dropped.
///
/// Processing a large resource can outlast the transport's ack wait; the
/// heartbeat stops the transport from redelivering it meanwhile.
pub struct MessageProgressUpdater {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl MessageProgressUpdater {
    pub fn start(message: TransportMessage, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match message.in_progress().await {
                            Ok(()) => debug!(reply = %message.reply, "Marked message in progress"),
                            Err(e) => warn!(reply = %message.reply, error = %e, "Failed to mark message in progress"),
                        }
                    }
                }
            }
        });
        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Stop the heartbeat and wait for it to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for MessageProgressUpdater {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::transport::{Headers, SubscribeOptions, Transport};

    #[tokio::test]
    async fn test_heartbeat_defers_redelivery() {
        let transport = MemoryTransport::new();
        transport.add_stream("s", &["a"]);
        transport.publish("a", b"x".to_vec(), Headers::new()).await.unwrap();
        let mut sub = transport
            .pull_subscribe(SubscribeOptions {
                stream: "s".into(),
                subject: "a".into(),
                durable: "d".into(),
                start_seq: None,
                ack_wait: Duration::from_millis(150),
                max_deliver: 5,
                max_ack_pending: 1,
            })
            .await
            .unwrap();
        let msg = sub.fetch(1, Duration::from_millis(50)).await.unwrap().remove(0);

        let updater = MessageProgressUpdater::start(msg.clone(), Duration::from_millis(50));
        // Past the ack wait, still not redelivered
        assert!(sub.fetch(1, Duration::from_millis(300)).await.unwrap().is_empty());
        updater.stop().await;

        let redelivered = sub.fetch(1, Duration::from_millis(500)).await.unwrap();
        assert_eq!(redelivered[0].num_delivered, 2);
    }
}
