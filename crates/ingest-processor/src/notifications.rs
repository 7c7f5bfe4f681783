//! Resource change notifications.

use tokio::sync::broadcast;
use tracing::trace;

use ingest_types::MessageSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    Created,
    Modified,
    Deleted,
    Aborted,
}

/// Emitted after a broker message has been committed (or rolled back).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kbid: String,
    pub uuid: String,
    pub seqid: i64,
    pub partition: String,
    pub write_type: WriteType,
    pub source: MessageSource,
}

/// Fan-out of notifications to any number of subscribers. Cheap to clone.
#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Publish; having no subscribers is fine.
    pub fn notify(&self, notification: Notification) {
        trace!(
            kbid = %notification.kbid,
            uuid = %notification.uuid,
            write_type = ?notification.write_type,
            "Notify"
        );
        let _ = self.sender.send(notification);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(1024)
    }
}
