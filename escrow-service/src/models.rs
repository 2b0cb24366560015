use crate::error::EscrowError;
use crate::state_machine::{Actor, ActorRole, OrderStatus};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use shared::{NotificationEvent, PaymentMethod, TransactionKind, TransactionStatus};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub item_description: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub proof_of_delivery: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub order_id: Uuid,
    pub user_id: Option<Uuid>,
    pub provider: String,
    pub correlation_ref: String,
    pub provider_tx_id: Option<String>,
    pub kind: TransactionKind,
    pub amount: BigDecimal,
    pub status: TransactionStatus,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A money movement about to be written to the ledger.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub order_id: Uuid,
    pub user_id: Option<Uuid>,
    pub provider: String,
    pub correlation_ref: String,
    pub kind: TransactionKind,
    pub amount: BigDecimal,
    pub status: TransactionStatus,
    pub description: String,
}

impl From<NewTransaction> for Transaction {
    fn from(new: NewTransaction) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_id: new.order_id,
            user_id: new.user_id,
            provider: new.provider,
            correlation_ref: new.correlation_ref,
            provider_tx_id: None,
            kind: new.kind,
            amount: new.amount,
            status: new.status,
            description: new.description,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One line of an order's history. Status changes carry distinct `from`/`to`; notes
/// about reconciliation decisions repeat the current status in both.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub order_id: Uuid,
    pub from_status: Option<OrderStatus>,
    pub to_status: OrderStatus,
    pub actor_id: Option<Uuid>,
    pub actor_role: ActorRole,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        order_id: Uuid,
        from_status: Option<OrderStatus>,
        to_status: OrderStatus,
        actor: Actor,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            from_status,
            to_status,
            actor_id: actor.id,
            actor_role: actor.role,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }

    pub fn note(order: &Order, actor: Actor, reason: impl Into<String>) -> Self {
        Self::new(order.id, Some(order.status), order.status, actor, reason)
    }
}

/// A notification waiting in the outbox.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub notification: NotificationEvent,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

impl From<NotificationEvent> for OutboxEntry {
    fn from(notification: NotificationEvent) -> Self {
        Self {
            id: notification.id,
            created_at: notification.created_at,
            notification,
            processed: false,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct OrderRow {
    pub id: Uuid,
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub item_description: String,
    pub amount: BigDecimal,
    pub currency: String,
    pub status: String,
    pub payment_method: String,
    pub proof_of_delivery: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `None` fields are left untouched by diesel.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = crate::schema::orders)]
pub struct OrderStatusChange {
    pub status: String,
    pub proof_of_delivery: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::transactions)]
pub struct TransactionRow {
    pub id: Uuid,
    pub order_id: Uuid,
    pub user_id: Option<Uuid>,
    pub provider: String,
    pub correlation_ref: String,
    pub provider_tx_id: Option<String>,
    pub kind: String,
    pub amount: BigDecimal,
    pub status: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = crate::schema::transactions)]
pub struct TransactionStatusChange {
    pub status: String,
    pub correlation_ref: Option<String>,
    pub provider_tx_id: Option<String>,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::order_events)]
pub struct OrderEventRow {
    pub id: Uuid,
    pub order_id: Uuid,
    pub from_status: Option<String>,
    pub to_status: String,
    pub actor_id: Option<Uuid>,
    pub actor_role: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::users)]
pub struct UserRow {
    pub id: Uuid,
    pub role: String,
    pub display_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub const NOTIFICATION_EVENT_TYPE: &str = "Notification";

impl From<&Order> for OrderRow {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            buyer_id: order.buyer_id,
            seller_id: order.seller_id,
            item_description: order.item_description.clone(),
            amount: order.amount.clone(),
            currency: order.currency.clone(),
            status: order.status.to_string(),
            payment_method: order.payment_method.to_string(),
            proof_of_delivery: order.proof_of_delivery.clone(),
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

impl TryFrom<OrderRow> for Order {
    type Error = EscrowError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            buyer_id: row.buyer_id,
            seller_id: row.seller_id,
            item_description: row.item_description,
            amount: row.amount,
            currency: row.currency,
            status: row.status.parse()?,
            payment_method: row.payment_method.parse()?,
            proof_of_delivery: row.proof_of_delivery,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl From<&Transaction> for TransactionRow {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id,
            order_id: tx.order_id,
            user_id: tx.user_id,
            provider: tx.provider.clone(),
            correlation_ref: tx.correlation_ref.clone(),
            provider_tx_id: tx.provider_tx_id.clone(),
            kind: tx.kind.to_string(),
            amount: tx.amount.clone(),
            status: tx.status.to_string(),
            description: tx.description.clone(),
            created_at: tx.created_at,
            updated_at: tx.updated_at,
        }
    }
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = EscrowError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            user_id: row.user_id,
            provider: row.provider,
            correlation_ref: row.correlation_ref,
            provider_tx_id: row.provider_tx_id,
            kind: row.kind.parse()?,
            amount: row.amount,
            status: row.status.parse()?,
            description: row.description,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl From<&AuditRecord> for OrderEventRow {
    fn from(record: &AuditRecord) -> Self {
        Self {
            id: record.id,
            order_id: record.order_id,
            from_status: record.from_status.map(|s| s.to_string()),
            to_status: record.to_status.to_string(),
            actor_id: record.actor_id,
            actor_role: record.actor_role.to_string(),
            reason: record.reason.clone(),
            created_at: record.created_at,
        }
    }
}

impl TryFrom<OrderEventRow> for AuditRecord {
    type Error = EscrowError;

    fn try_from(row: OrderEventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            from_status: row
                .from_status
                .map(|s| s.parse::<OrderStatus>())
                .transpose()?,
            to_status: row.to_status.parse()?,
            actor_id: row.actor_id,
            actor_role: row.actor_role.parse()?,
            reason: row.reason,
            created_at: row.created_at,
        })
    }
}

impl TryFrom<&OutboxEntry> for DbOutboxEvent {
    type Error = EscrowError;

    fn try_from(entry: &OutboxEntry) -> Result<Self, Self::Error> {
        Ok(Self {
            id: entry.id,
            aggregate_id: entry.notification.order_id,
            event_type: NOTIFICATION_EVENT_TYPE.to_string(),
            event_data: serde_json::to_value(&entry.notification)?,
            processed: entry.processed,
            created_at: entry.created_at,
        })
    }
}

impl TryFrom<DbOutboxEvent> for OutboxEntry {
    type Error = EscrowError;

    fn try_from(event: DbOutboxEvent) -> Result<Self, Self::Error> {
        Ok(Self {
            id: event.id,
            notification: serde_json::from_value(event.event_data)?,
            processed: event.processed,
            created_at: event.created_at,
        })
    }
}
