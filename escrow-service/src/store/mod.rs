//! Persistence port.
//!
//! Everything the engine writes as a consequence of one decision goes through
//! [`EscrowStore::commit`] as a single [`UnitOfWork`], so a transaction finalization,
//! the order transition it causes, the audit trail, and outgoing notifications either
//! all land or none do.

pub mod memory;
pub mod postgres;

use crate::error::EscrowResult;
use crate::models::{AuditRecord, Order, OutboxEntry, Transaction};
use crate::state_machine::{Actor, OrderStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{NotificationEvent, TransactionStatus};
use uuid::Uuid;

pub use memory::InMemoryStore;
pub use postgres::PgEscrowStore;

/// Conditional order update: applies only while the order is still in `from`.
#[derive(Debug, Clone)]
pub struct OrderTransition {
    pub order_id: Uuid,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub actor: Actor,
    pub reason: String,
    pub proof_of_delivery: Option<String>,
}

impl OrderTransition {
    pub fn audit(&self) -> AuditRecord {
        AuditRecord::new(
            self.order_id,
            Some(self.from),
            self.to,
            self.actor,
            self.reason.clone(),
        )
    }
}

/// Moves a non-terminal transaction to its next status.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub transaction_id: Uuid,
    pub status: TransactionStatus,
    /// Replaces a locally generated reference once the provider has issued its own.
    pub correlation_ref: Option<String>,
    pub provider_tx_id: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    pub settle: Option<Settlement>,
    pub record: Option<Transaction>,
    pub transition: Option<OrderTransition>,
    pub notes: Vec<AuditRecord>,
    pub notifications: Vec<NotificationEvent>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settle(mut self, settlement: Settlement) -> Self {
        self.settle = Some(settlement);
        self
    }

    pub fn record(mut self, transaction: Transaction) -> Self {
        self.record = Some(transaction);
        self
    }

    pub fn transition(mut self, transition: OrderTransition) -> Self {
        self.transition = Some(transition);
        self
    }

    pub fn note(mut self, note: AuditRecord) -> Self {
        self.notes.push(note);
        self
    }

    pub fn notify(mut self, notifications: Vec<NotificationEvent>) -> Self {
        self.notifications.extend(notifications);
        self
    }
}

#[derive(Debug, Clone)]
pub enum CommitOutcome {
    Applied {
        order: Option<Order>,
        transaction: Option<Transaction>,
    },
    /// The settlement target was already terminal; nothing was written.
    AlreadySettled(Transaction),
}

/// Failure contract shared by every implementation:
/// * a lost order compare-and-swap is `EscrowError::Inconsistent`,
/// * a second transaction with the same provider and reference, whether inserted or
///   renamed into place by a settlement, is `EscrowError::DuplicateCorrelationRef`,
/// * in both cases nothing from the unit is kept.
#[async_trait]
pub trait EscrowStore: Send + Sync {
    async fn insert_order(&self, order: &Order, audit: &AuditRecord) -> EscrowResult<()>;

    async fn find_order(&self, id: Uuid) -> EscrowResult<Option<Order>>;

    /// Orders sitting in one of `statuses` since before `before`, oldest first.
    async fn orders_idle_since(
        &self,
        statuses: &[OrderStatus],
        before: DateTime<Utc>,
        limit: i64,
    ) -> EscrowResult<Vec<Order>>;

    async fn order_history(&self, order_id: Uuid) -> EscrowResult<Vec<AuditRecord>>;

    async fn insert_transaction(&self, transaction: &Transaction) -> EscrowResult<()>;

    async fn find_transaction(&self, id: Uuid) -> EscrowResult<Option<Transaction>>;

    async fn find_transaction_by_ref(
        &self,
        provider: &str,
        correlation_ref: &str,
    ) -> EscrowResult<Option<Transaction>>;

    async fn transactions_for_order(&self, order_id: Uuid) -> EscrowResult<Vec<Transaction>>;

    /// Pending or processing transactions not touched since `before`, oldest first.
    async fn open_transactions_since(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> EscrowResult<Vec<Transaction>>;

    /// Bumps `updated_at` on a still-open transaction after a status query that
    /// brought no answer, so it goes to the back of the sweep queue.
    async fn mark_polled(&self, id: Uuid) -> EscrowResult<Option<Transaction>>;

    async fn commit(&self, work: UnitOfWork) -> EscrowResult<CommitOutcome>;

    async fn pending_notifications(&self, limit: i64) -> EscrowResult<Vec<OutboxEntry>>;

    /// Sent notifications are no longer returned by `pending_notifications`.
    async fn mark_notification_sent(&self, id: Uuid) -> EscrowResult<()>;
}
