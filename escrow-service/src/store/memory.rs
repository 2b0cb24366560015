use super::{CommitOutcome, EscrowStore, UnitOfWork};
use crate::error::{EscrowError, EscrowResult};
use crate::models::{AuditRecord, Order, OutboxEntry, Transaction};
use crate::state_machine::OrderStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::TransactionStatus;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    orders: HashMap<Uuid, Order>,
    transactions: HashMap<Uuid, Transaction>,
    references: HashMap<(String, String), Uuid>,
    history: Vec<AuditRecord>,
    outbox: Vec<OutboxEntry>,
}

impl State {
    fn check_reference(&self, tx: &Transaction) -> EscrowResult<()> {
        let key = (tx.provider.clone(), tx.correlation_ref.clone());
        if self.references.contains_key(&key) {
            return Err(EscrowError::DuplicateCorrelationRef {
                provider: tx.provider.clone(),
                reference: tx.correlation_ref.clone(),
            });
        }
        Ok(())
    }

    fn insert_transaction(&mut self, tx: Transaction) {
        self.references
            .insert((tx.provider.clone(), tx.correlation_ref.clone()), tx.id);
        self.transactions.insert(tx.id, tx);
    }
}

/// Keeps every table in memory behind one mutex, so each unit of work is applied
/// whole or not at all. Used by tests and local runs without a database.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EscrowStore for InMemoryStore {
    async fn insert_order(&self, order: &Order, audit: &AuditRecord) -> EscrowResult<()> {
        let mut state = self.state.lock().await;
        state.orders.insert(order.id, order.clone());
        state.history.push(audit.clone());
        Ok(())
    }

    async fn find_order(&self, id: Uuid) -> EscrowResult<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state.orders.get(&id).cloned())
    }

    async fn orders_idle_since(
        &self,
        statuses: &[OrderStatus],
        before: DateTime<Utc>,
        limit: i64,
    ) -> EscrowResult<Vec<Order>> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| statuses.contains(&o.status) && o.updated_at < before)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.updated_at);
        orders.truncate(limit.max(0) as usize);
        Ok(orders)
    }

    async fn order_history(&self, order_id: Uuid) -> EscrowResult<Vec<AuditRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> EscrowResult<()> {
        let mut state = self.state.lock().await;
        state.check_reference(transaction)?;
        state.insert_transaction(transaction.clone());
        Ok(())
    }

    async fn find_transaction(&self, id: Uuid) -> EscrowResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state.transactions.get(&id).cloned())
    }

    async fn find_transaction_by_ref(
        &self,
        provider: &str,
        correlation_ref: &str,
    ) -> EscrowResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .references
            .get(&(provider.to_string(), correlation_ref.to_string()))
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    async fn transactions_for_order(&self, order_id: Uuid) -> EscrowResult<Vec<Transaction>> {
        let state = self.state.lock().await;
        let mut transactions: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| t.order_id == order_id)
            .cloned()
            .collect();
        transactions.sort_by_key(|t| t.created_at);
        Ok(transactions)
    }

    async fn open_transactions_since(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> EscrowResult<Vec<Transaction>> {
        let state = self.state.lock().await;
        let mut open: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|t| {
                matches!(
                    t.status,
                    TransactionStatus::Pending | TransactionStatus::Processing
                ) && t.updated_at < before
            })
            .cloned()
            .collect();
        open.sort_by_key(|t| t.updated_at);
        open.truncate(limit.max(0) as usize);
        Ok(open)
    }

    async fn mark_polled(&self, id: Uuid) -> EscrowResult<Option<Transaction>> {
        let mut state = self.state.lock().await;
        Ok(state.transactions.get_mut(&id).map(|tx| {
            if !tx.status.is_terminal() {
                tx.updated_at = Utc::now();
            }
            tx.clone()
        }))
    }

    async fn commit(&self, work: UnitOfWork) -> EscrowResult<CommitOutcome> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        // validate everything before touching anything
        if let Some(settlement) = &work.settle {
            let current = state
                .transactions
                .get(&settlement.transaction_id)
                .ok_or_else(|| EscrowError::transaction_not_found(settlement.transaction_id))?;
            if current.status.is_terminal() {
                return Ok(CommitOutcome::AlreadySettled(current.clone()));
            }
            if let Some(reference) = &settlement.correlation_ref {
                let key = (current.provider.clone(), reference.clone());
                if *reference != current.correlation_ref && state.references.contains_key(&key) {
                    return Err(EscrowError::DuplicateCorrelationRef {
                        provider: current.provider.clone(),
                        reference: reference.clone(),
                    });
                }
            }
        }
        if let Some(tx) = &work.record {
            state.check_reference(tx)?;
        }
        if let Some(transition) = &work.transition {
            let order = state
                .orders
                .get(&transition.order_id)
                .ok_or_else(|| EscrowError::order_not_found(transition.order_id))?;
            if order.status != transition.from {
                return Err(EscrowError::Inconsistent {
                    order_id: transition.order_id,
                });
            }
        }

        let now = Utc::now();
        let mut transaction = None;
        if let Some(settlement) = work.settle {
            if let Some(tx) = state.transactions.get_mut(&settlement.transaction_id) {
                if let Some(reference) = settlement.correlation_ref {
                    state
                        .references
                        .remove(&(tx.provider.clone(), tx.correlation_ref.clone()));
                    state
                        .references
                        .insert((tx.provider.clone(), reference.clone()), tx.id);
                    tx.correlation_ref = reference;
                }
                tx.status = settlement.status;
                if settlement.provider_tx_id.is_some() {
                    tx.provider_tx_id = settlement.provider_tx_id;
                }
                if let Some(description) = settlement.description {
                    tx.description = description;
                }
                tx.updated_at = now;
                transaction = Some(tx.clone());
            }
        }
        if let Some(tx) = work.record {
            transaction = transaction.or_else(|| Some(tx.clone()));
            state.insert_transaction(tx);
        }

        let mut order = None;
        if let Some(transition) = work.transition {
            if let Some(current) = state.orders.get_mut(&transition.order_id) {
                current.status = transition.to;
                if transition.proof_of_delivery.is_some() {
                    current.proof_of_delivery = transition.proof_of_delivery.clone();
                }
                current.updated_at = now;
                order = Some(current.clone());
            }
            state.history.push(transition.audit());
        }

        state.history.extend(work.notes);
        state
            .outbox
            .extend(work.notifications.into_iter().map(OutboxEntry::from));

        Ok(CommitOutcome::Applied { order, transaction })
    }

    async fn pending_notifications(&self, limit: i64) -> EscrowResult<Vec<OutboxEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|e| !e.processed)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_notification_sent(&self, id: Uuid) -> EscrowResult<()> {
        let mut state = self.state.lock().await;
        state.outbox.retain(|e| e.id != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewTransaction;
    use crate::state_machine::Actor;
    use crate::store::{OrderTransition, Settlement};
    use bigdecimal::BigDecimal;
    use shared::{Contact, NotificationEvent, PaymentMethod, TransactionKind};

    fn order(status: OrderStatus) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            buyer_id: Uuid::new_v4(),
            seller_id: Uuid::new_v4(),
            item_description: "Laptop".to_string(),
            amount: BigDecimal::from(1000),
            currency: "KES".to_string(),
            status,
            payment_method: PaymentMethod::Mpesa,
            proof_of_delivery: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn collection(order_id: Uuid, reference: &str) -> Transaction {
        Transaction::from(NewTransaction {
            order_id,
            user_id: None,
            provider: "mpesa".to_string(),
            correlation_ref: reference.to_string(),
            kind: TransactionKind::Collection,
            amount: BigDecimal::from(1000),
            status: TransactionStatus::Pending,
            description: "collection initiated".to_string(),
        })
    }

    async fn seeded(status: OrderStatus) -> (InMemoryStore, Order) {
        let store = InMemoryStore::new();
        let order = order(status);
        let audit = AuditRecord::new(order.id, None, status, Actor::system(), "created");
        store.insert_order(&order, &audit).await.unwrap();
        (store, order)
    }

    fn to_paid(order: &Order) -> OrderTransition {
        OrderTransition {
            order_id: order.id,
            from: OrderStatus::Pending,
            to: OrderStatus::Paid,
            actor: Actor::system(),
            reason: "collection succeeded".to_string(),
            proof_of_delivery: None,
        }
    }

    #[tokio::test]
    async fn duplicate_reference_is_rejected() {
        let (store, order) = seeded(OrderStatus::Pending).await;
        store
            .insert_transaction(&collection(order.id, "ws_CO_1"))
            .await
            .unwrap();

        let err = store
            .insert_transaction(&collection(order.id, "ws_CO_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EscrowError::DuplicateCorrelationRef { .. }));
        assert_eq!(store.transactions_for_order(order.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lost_order_race_keeps_nothing() {
        let (store, order) = seeded(OrderStatus::Cancelled).await;
        let tx = collection(order.id, "ws_CO_2");
        store.insert_transaction(&tx).await.unwrap();

        let work = UnitOfWork::new()
            .settle(Settlement {
                transaction_id: tx.id,
                status: TransactionStatus::Success,
                correlation_ref: None,
                provider_tx_id: Some("QKX1".to_string()),
                description: None,
            })
            .transition(to_paid(&order))
            .notify(vec![NotificationEvent::new(
                order.id,
                Contact::default(),
                "paid",
            )]);

        let err = store.commit(work).await.unwrap_err();
        assert!(matches!(err, EscrowError::Inconsistent { .. }));

        let unchanged = store.find_transaction(tx.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, TransactionStatus::Pending);
        assert!(store.pending_notifications(10).await.unwrap().is_empty());
        assert_eq!(store.order_history(order.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminal_transaction_is_not_settled_twice() {
        let (store, order) = seeded(OrderStatus::Pending).await;
        let tx = collection(order.id, "ws_CO_3");
        store.insert_transaction(&tx).await.unwrap();

        let settle = |status| Settlement {
            transaction_id: tx.id,
            status,
            correlation_ref: None,
            provider_tx_id: None,
            description: None,
        };

        let first = store
            .commit(
                UnitOfWork::new()
                    .settle(settle(TransactionStatus::Success))
                    .transition(to_paid(&order)),
            )
            .await
            .unwrap();
        assert!(matches!(first, CommitOutcome::Applied { .. }));

        let second = store
            .commit(UnitOfWork::new().settle(settle(TransactionStatus::Failed)))
            .await
            .unwrap();
        match second {
            CommitOutcome::AlreadySettled(existing) => {
                assert_eq!(existing.status, TransactionStatus::Success)
            }
            other => panic!("expected AlreadySettled, got {:?}", other),
        }
        let order = store.find_order(order.id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn notifications_are_drained_once_sent() {
        let (store, order) = seeded(OrderStatus::Pending).await;
        store
            .commit(UnitOfWork::new().notify(vec![NotificationEvent::new(
                order.id,
                Contact::default(),
                "hello",
            )]))
            .await
            .unwrap();

        let pending = store.pending_notifications(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        store.mark_notification_sent(pending[0].id).await.unwrap();
        assert!(store.pending_notifications(10).await.unwrap().is_empty());
        assert!(store.state.lock().await.outbox.is_empty());
    }

    #[tokio::test]
    async fn provider_reference_replaces_local_one() {
        let (store, order) = seeded(OrderStatus::Pending).await;
        let tx = collection(order.id, "local-1");
        store.insert_transaction(&tx).await.unwrap();
        store
            .insert_transaction(&collection(order.id, "ws_CO_taken"))
            .await
            .unwrap();

        let rename = |reference: &str| {
            UnitOfWork::new().settle(Settlement {
                transaction_id: tx.id,
                status: TransactionStatus::Pending,
                correlation_ref: Some(reference.to_string()),
                provider_tx_id: None,
                description: None,
            })
        };

        let err = store.commit(rename("ws_CO_taken")).await.unwrap_err();
        assert!(matches!(err, EscrowError::DuplicateCorrelationRef { .. }));

        store.commit(rename("ws_CO_4")).await.unwrap();
        assert!(store
            .find_transaction_by_ref("mpesa", "local-1")
            .await
            .unwrap()
            .is_none());
        let renamed = store
            .find_transaction_by_ref("mpesa", "ws_CO_4")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renamed.id, tx.id);
        assert_eq!(renamed.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn polling_moves_a_transaction_to_the_back_of_the_queue() {
        let (store, order) = seeded(OrderStatus::Pending).await;
        let mut older = collection(order.id, "ws_CO_5");
        older.updated_at = Utc::now() - chrono::Duration::minutes(10);
        store.insert_transaction(&older).await.unwrap();
        let mut newer = collection(order.id, "ws_CO_6");
        newer.updated_at = Utc::now() - chrono::Duration::minutes(5);
        store.insert_transaction(&newer).await.unwrap();

        let cutoff = Utc::now() + chrono::Duration::minutes(1);
        let first = store.open_transactions_since(cutoff, 1).await.unwrap();
        assert_eq!(first[0].id, older.id);

        let polled = store.mark_polled(older.id).await.unwrap().unwrap();
        assert!(polled.updated_at > newer.updated_at);
        let next = store.open_transactions_since(cutoff, 1).await.unwrap();
        assert_eq!(next[0].id, newer.id);
    }
}
