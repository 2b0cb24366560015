use crate::error::{EscrowError, EscrowResult};
use crate::models::{NewTransaction, Transaction};
use crate::store::{CommitOutcome, EscrowStore, Settlement, UnitOfWork};
use chrono::{DateTime, Utc};
use shared::TransactionStatus;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Reference for rows the provider never saw, so `(provider, correlation_ref)` stays
/// unique even for attempts that failed before initiation.
pub fn local_reference() -> String {
    format!("local-{}", Uuid::new_v4())
}

pub fn is_local_reference(correlation_ref: &str) -> bool {
    correlation_ref.starts_with("local-")
}

/// Every money movement attempted for an order.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn EscrowStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn EscrowStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, new: NewTransaction) -> EscrowResult<Transaction> {
        let transaction = Transaction::from(new);
        self.store.insert_transaction(&transaction).await?;
        info!(
            transaction_id = %transaction.id,
            order_id = %transaction.order_id,
            provider = %transaction.provider,
            correlation_ref = %transaction.correlation_ref,
            kind = %transaction.kind,
            status = %transaction.status,
            "transaction recorded"
        );
        Ok(transaction)
    }

    pub async fn find(&self, id: Uuid) -> EscrowResult<Transaction> {
        self.store
            .find_transaction(id)
            .await?
            .ok_or_else(|| EscrowError::transaction_not_found(id))
    }

    pub async fn find_by_correlation_ref(
        &self,
        provider: &str,
        correlation_ref: &str,
    ) -> EscrowResult<Option<Transaction>> {
        self.store
            .find_transaction_by_ref(provider, correlation_ref)
            .await
    }

    /// Terminal transactions are returned unchanged.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
        provider_tx_id: Option<String>,
        description: impl Into<String>,
    ) -> EscrowResult<Transaction> {
        let work = UnitOfWork::new().settle(Settlement {
            transaction_id: id,
            status,
            correlation_ref: None,
            provider_tx_id,
            description: Some(description.into()),
        });

        match self.store.commit(work).await? {
            CommitOutcome::Applied {
                transaction: Some(transaction),
                ..
            } => Ok(transaction),
            CommitOutcome::Applied {
                transaction: None, ..
            } => Err(EscrowError::transaction_not_found(id)),
            CommitOutcome::AlreadySettled(existing) => {
                debug!(transaction_id = %id, status = %existing.status, "transaction already settled");
                Ok(existing)
            }
        }
    }

    pub async fn for_order(&self, order_id: Uuid) -> EscrowResult<Vec<Transaction>> {
        self.store.transactions_for_order(order_id).await
    }

    /// Pending or processing transactions not touched since `older_than`.
    pub async fn stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> EscrowResult<Vec<Transaction>> {
        self.store.open_transactions_since(older_than, limit).await
    }

    /// Records a status query that brought no final answer.
    pub async fn mark_polled(&self, id: Uuid) -> EscrowResult<Transaction> {
        self.store
            .mark_polled(id)
            .await?
            .ok_or_else(|| EscrowError::transaction_not_found(id))
    }
}
