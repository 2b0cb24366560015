//! Outgoing notifications.
//!
//! Messages are composed here and written to the outbox together with the state
//! change that caused them; [`crate::outbox::OutboxProcessor`] later hands them to a
//! [`NotificationSink`].

use crate::directory::UserDirectory;
use crate::error::{EscrowError, EscrowResult};
use crate::models::Order;
use crate::state_machine::OrderStatus;
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use shared::{Contact, NotificationEvent};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: &NotificationEvent) -> EscrowResult<()>;
}

/// Publishes notifications to a Kafka topic for the delivery service to pick up.
pub struct KafkaNotificationSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaNotificationSink {
    pub fn new(producer: FutureProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for KafkaNotificationSink {
    async fn notify(&self, notification: &NotificationEvent) -> EscrowResult<()> {
        let json = serde_json::to_string(notification)?;
        let key = notification.order_id.to_string();
        let record = FutureRecord::to(&self.topic).payload(&json).key(&key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| EscrowError::Notification(e.to_string()))?;
        Ok(())
    }
}

/// Writes notifications to the log; used when no broker is configured.
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn notify(&self, notification: &NotificationEvent) -> EscrowResult<()> {
        info!(
            order_id = %notification.order_id,
            phone = ?notification.recipient.phone,
            email = ?notification.recipient.email,
            "notification: {}",
            notification.message
        );
        Ok(())
    }
}

/// Composes notification messages and resolves recipients through the directory.
#[derive(Clone)]
pub struct Notifier {
    directory: Arc<dyn UserDirectory>,
    ops_contact: Contact,
}

impl Notifier {
    pub fn new(directory: Arc<dyn UserDirectory>, ops_contact: Contact) -> Self {
        Self {
            directory,
            ops_contact,
        }
    }

    /// Messages for the parties of `order` once it has moved to `to`.
    pub async fn for_transition(&self, order: &Order, to: OrderStatus) -> Vec<NotificationEvent> {
        let reference = short_ref(order.id);
        let amount = format!("{} {}", order.currency, order.amount);
        let item = &order.item_description;

        let (to_buyer, to_seller) = match to {
            OrderStatus::Paid => (
                Some(format!("Payment of {} for '{}' received and held in escrow (order {}).", amount, item, reference)),
                Some(format!("Order {} is paid. Please ship '{}'.", reference, item)),
            ),
            OrderStatus::Shipped => (Some(format!("'{}' has been shipped (order {}).", item, reference)), None),
            OrderStatus::Delivered => (
                Some(format!("Delivery of '{}' was reported. Confirm receipt to release payment (order {}).", item, reference)),
                None,
            ),
            OrderStatus::Completed => (
                Some(format!("Order {} is complete. Thank you.", reference)),
                Some(format!("Order {} is complete. {} is being released to you.", reference, amount)),
            ),
            OrderStatus::Disputed => {
                let text = format!("Order {} is under dispute. An administrator will review it.", reference);
                (Some(text.clone()), Some(text))
            }
            OrderStatus::Refunded => (
                Some(format!("Your payment of {} for '{}' has been refunded.", amount, item)),
                Some(format!("Order {} was refunded to the buyer.", reference)),
            ),
            OrderStatus::Cancelled => (None, Some(format!("Order {} was cancelled.", reference))),
            OrderStatus::Pending | OrderStatus::ProcessingPayout | OrderStatus::ProcessingRefund => (None, None),
        };

        let mut notifications = Vec::new();
        if let Some(message) = to_buyer {
            notifications.extend(self.to_user(order.id, order.buyer_id, message).await);
        }
        if let Some(message) = to_seller {
            notifications.extend(self.to_user(order.id, order.seller_id, message).await);
        }
        notifications
    }

    pub async fn to_user(&self, order_id: Uuid, user_id: Uuid, message: String) -> Option<NotificationEvent> {
        match self.directory.find_user_by_id(user_id).await {
            Ok(Some(user)) if user.contact.is_reachable() => {
                Some(NotificationEvent::new(order_id, user.contact, message))
            }
            Ok(_) => {
                warn!(order_id = %order_id, user_id = %user_id, "no reachable contact, notification dropped");
                None
            }
            Err(e) => {
                warn!(order_id = %order_id, user_id = %user_id, "user lookup failed, notification dropped: {}", e);
                None
            }
        }
    }

    /// Message for whoever settles payments by hand.
    pub fn to_operations(&self, order_id: Uuid, message: String) -> Option<NotificationEvent> {
        self.ops_contact
            .is_reachable()
            .then(|| NotificationEvent::new(order_id, self.ops_contact.clone(), message))
    }
}

fn short_ref(id: Uuid) -> String {
    id.simple().to_string()[..8].to_uppercase()
}
