use crate::error::EscrowResult;
use crate::notify::NotificationSink;
use crate::store::EscrowStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info};

const BATCH_SIZE: i64 = 100;

/// Drains notifications written by committed state changes. Entries are marked sent
/// only after the sink accepted them, so a crash means a resend, never a loss.
pub struct OutboxProcessor {
    store: Arc<dyn EscrowStore>,
    sink: Arc<dyn NotificationSink>,
    interval: Duration,
}

impl OutboxProcessor {
    pub fn new(store: Arc<dyn EscrowStore>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            store,
            sink,
            interval: Duration::from_secs(5),
        }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(self.interval);

        loop {
            interval.tick().await;

            if let Err(e) = self.process_outbox_events().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    /// Returns how many notifications were delivered.
    pub async fn process_outbox_events(&self) -> EscrowResult<usize> {
        let pending = self.store.pending_notifications(BATCH_SIZE).await?;
        let mut sent = 0;

        for entry in pending {
            if let Err(e) = self.sink.notify(&entry.notification).await {
                error!("Failed to deliver notification {}: {}", entry.id, e);
                continue;
            }

            self.store.mark_notification_sent(entry.id).await?;
            sent += 1;
            info!(order_id = %entry.notification.order_id, "Delivered notification {}", entry.id);
        }

        Ok(sent)
    }
}
