use super::{CommitOutcome, EscrowStore, UnitOfWork};
use crate::error::{EscrowError, EscrowResult};
use crate::models::*;
use crate::schema::*;
use crate::state_machine::OrderStatus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use uuid::Uuid;

pub type DbPool = Pool<AsyncPgConnection>;

const OPEN_STATUSES: [&str; 2] = ["pending", "processing"];

#[derive(Clone)]
pub struct PgEscrowStore {
    pool: DbPool,
}

impl PgEscrowStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn pool_error<E: std::fmt::Display>(err: E) -> EscrowError {
    EscrowError::Pool(err.to_string())
}

fn duplicate_or(err: DieselError, tx: &Transaction) -> EscrowError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
            EscrowError::DuplicateCorrelationRef {
                provider: tx.provider.clone(),
                reference: tx.correlation_ref.clone(),
            }
        }
        other => other.into(),
    }
}

fn renamed_or(err: DieselError, provider: &str, reference: Option<&str>) -> EscrowError {
    match (err, reference) {
        (DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _), Some(reference)) => {
            EscrowError::DuplicateCorrelationRef {
                provider: provider.to_string(),
                reference: reference.to_string(),
            }
        }
        (other, _) => other.into(),
    }
}

fn to_orders(rows: Vec<OrderRow>) -> EscrowResult<Vec<Order>> {
    rows.into_iter().map(Order::try_from).collect()
}

fn to_transactions(rows: Vec<TransactionRow>) -> EscrowResult<Vec<Transaction>> {
    rows.into_iter().map(Transaction::try_from).collect()
}

#[async_trait]
impl EscrowStore for PgEscrowStore {
    async fn insert_order(&self, order: &Order, audit: &AuditRecord) -> EscrowResult<()> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let row = OrderRow::from(order);
        let event = OrderEventRow::from(audit);

        conn.transaction::<_, EscrowError, _>(|conn| {
            Box::pin(async move {
                diesel::insert_into(orders::table)
                    .values(&row)
                    .execute(conn)
                    .await?;
                diesel::insert_into(order_events::table)
                    .values(&event)
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .await
    }

    async fn find_order(&self, id: Uuid) -> EscrowResult<Option<Order>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        orders::table
            .find(id)
            .first::<OrderRow>(&mut conn)
            .await
            .optional()?
            .map(Order::try_from)
            .transpose()
    }

    async fn orders_idle_since(
        &self,
        statuses: &[OrderStatus],
        before: DateTime<Utc>,
        limit: i64,
    ) -> EscrowResult<Vec<Order>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let labels: Vec<&str> = statuses.iter().map(OrderStatus::as_str).collect();
        let rows = orders::table
            .filter(orders::status.eq_any(labels))
            .filter(orders::updated_at.lt(before))
            .order(orders::updated_at.asc())
            .limit(limit)
            .load::<OrderRow>(&mut conn)
            .await?;
        to_orders(rows)
    }

    async fn order_history(&self, order_id: Uuid) -> EscrowResult<Vec<AuditRecord>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        order_events::table
            .filter(order_events::order_id.eq(order_id))
            .order(order_events::created_at.asc())
            .load::<OrderEventRow>(&mut conn)
            .await?
            .into_iter()
            .map(AuditRecord::try_from)
            .collect()
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> EscrowResult<()> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        diesel::insert_into(transactions::table)
            .values(&TransactionRow::from(transaction))
            .execute(&mut conn)
            .await
            .map_err(|e| duplicate_or(e, transaction))?;
        Ok(())
    }

    async fn find_transaction(&self, id: Uuid) -> EscrowResult<Option<Transaction>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        transactions::table
            .find(id)
            .first::<TransactionRow>(&mut conn)
            .await
            .optional()?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn find_transaction_by_ref(
        &self,
        provider: &str,
        correlation_ref: &str,
    ) -> EscrowResult<Option<Transaction>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        transactions::table
            .filter(transactions::provider.eq(provider))
            .filter(transactions::correlation_ref.eq(correlation_ref))
            .first::<TransactionRow>(&mut conn)
            .await
            .optional()?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn transactions_for_order(&self, order_id: Uuid) -> EscrowResult<Vec<Transaction>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let rows = transactions::table
            .filter(transactions::order_id.eq(order_id))
            .order(transactions::created_at.asc())
            .load::<TransactionRow>(&mut conn)
            .await?;
        to_transactions(rows)
    }

    async fn open_transactions_since(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> EscrowResult<Vec<Transaction>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        let rows = transactions::table
            .filter(transactions::status.eq_any(OPEN_STATUSES))
            .filter(transactions::updated_at.lt(before))
            .order(transactions::updated_at.asc())
            .limit(limit)
            .load::<TransactionRow>(&mut conn)
            .await?;
        to_transactions(rows)
    }

    async fn mark_polled(&self, id: Uuid) -> EscrowResult<Option<Transaction>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        diesel::update(
            transactions::table
                .filter(transactions::id.eq(id))
                .filter(transactions::status.eq_any(OPEN_STATUSES)),
        )
        .set(transactions::updated_at.eq(Utc::now()))
        .execute(&mut conn)
        .await?;

        transactions::table
            .find(id)
            .first::<TransactionRow>(&mut conn)
            .await
            .optional()?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn commit(&self, work: UnitOfWork) -> EscrowResult<CommitOutcome> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;

        conn.transaction::<_, EscrowError, _>(|conn| {
            Box::pin(async move {
                let now = Utc::now();
                let mut transaction = None;

                if let Some(settlement) = work.settle {
                    // row lock serialises concurrent deliveries of the same callback
                    let current = transactions::table
                        .find(settlement.transaction_id)
                        .for_update()
                        .first::<TransactionRow>(conn)
                        .await
                        .optional()?
                        .ok_or_else(|| EscrowError::transaction_not_found(settlement.transaction_id))?;
                    let current = Transaction::try_from(current)?;
                    if current.status.is_terminal() {
                        return Ok(CommitOutcome::AlreadySettled(current));
                    }

                    let renamed = settlement.correlation_ref.clone();
                    let row = diesel::update(transactions::table.find(settlement.transaction_id))
                        .set(&TransactionStatusChange {
                            status: settlement.status.to_string(),
                            correlation_ref: settlement.correlation_ref,
                            provider_tx_id: settlement.provider_tx_id,
                            description: settlement.description,
                            updated_at: now,
                        })
                        .get_result::<TransactionRow>(conn)
                        .await
                        .map_err(|e| renamed_or(e, &current.provider, renamed.as_deref()))?;
                    transaction = Some(Transaction::try_from(row)?);
                }

                if let Some(new_tx) = work.record {
                    diesel::insert_into(transactions::table)
                        .values(&TransactionRow::from(&new_tx))
                        .execute(conn)
                        .await
                        .map_err(|e| duplicate_or(e, &new_tx))?;
                    transaction = transaction.or(Some(new_tx));
                }

                let mut order = None;
                if let Some(change) = work.transition {
                    let row = diesel::update(
                        orders::table
                            .filter(orders::id.eq(change.order_id))
                            .filter(orders::status.eq(change.from.as_str())),
                    )
                    .set(&OrderStatusChange {
                        status: change.to.to_string(),
                        proof_of_delivery: change.proof_of_delivery.clone(),
                        updated_at: now,
                    })
                    .get_result::<OrderRow>(conn)
                    .await
                    .optional()?
                    .ok_or(EscrowError::Inconsistent {
                        order_id: change.order_id,
                    })?;

                    diesel::insert_into(order_events::table)
                        .values(&OrderEventRow::from(&change.audit()))
                        .execute(conn)
                        .await?;
                    order = Some(Order::try_from(row)?);
                }

                if !work.notes.is_empty() {
                    let rows: Vec<OrderEventRow> = work.notes.iter().map(OrderEventRow::from).collect();
                    diesel::insert_into(order_events::table)
                        .values(&rows)
                        .execute(conn)
                        .await?;
                }

                if !work.notifications.is_empty() {
                    let rows = work
                        .notifications
                        .into_iter()
                        .map(|n| DbOutboxEvent::try_from(&OutboxEntry::from(n)))
                        .collect::<EscrowResult<Vec<_>>>()?;
                    diesel::insert_into(outbox_events::table)
                        .values(&rows)
                        .execute(conn)
                        .await?;
                }

                Ok(CommitOutcome::Applied { order, transaction })
            })
        })
        .await
    }

    async fn pending_notifications(&self, limit: i64) -> EscrowResult<Vec<OutboxEntry>> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(limit)
            .load::<DbOutboxEvent>(&mut conn)
            .await?
            .into_iter()
            .map(OutboxEntry::try_from)
            .collect()
    }

    async fn mark_notification_sent(&self, id: Uuid) -> EscrowResult<()> {
        let mut conn = self.pool.get().await.map_err(pool_error)?;
        diesel::update(outbox_events::table.filter(outbox_events::id.eq(id)))
            .set(outbox_events::processed.eq(true))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}
