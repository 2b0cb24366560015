//! Reconciliation engine.
//!
//! Providers report results asynchronously, possibly more than once, out of order, or
//! not at all. Every path into this module (webhook, timeout notice, sweeper poll,
//! admin action) ends in the same sequence: look the transaction up by
//! `(provider, correlation_ref)`, stop if it is already terminal, otherwise decide the
//! transaction status and order transition together and commit them as one unit.

use crate::config::EscrowConfig;
use crate::directory::{UserDirectory, UserRole};
use crate::error::{EscrowError, EscrowResult};
use crate::ledger::{is_local_reference, local_reference, Ledger};
use crate::models::{AuditRecord, NewTransaction, Order, Transaction};
use crate::orders::{plan_transition, CreateOrder, OrderService};
use crate::state_machine::{Actor, OrderEvent, OrderStatus};
use crate::store::{CommitOutcome, EscrowStore, Settlement, UnitOfWork};
use bigdecimal::BigDecimal;
use num_traits::Zero;
use payment_providers::{
    Acknowledgement, CollectionOrder, Party, PaymentProvider, ProviderError, ProviderRegistry,
};
use serde::{Deserialize, Serialize};
use shared::{CallbackKind, EventOutcome, NormalizedEvent, TransactionKind, TransactionStatus};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Release,
    Refund,
}

impl Resolution {
    fn kind(&self) -> TransactionKind {
        match self {
            Self::Release => TransactionKind::Payout,
            Self::Refund => TransactionKind::Reversal,
        }
    }

    fn event(&self) -> OrderEvent {
        match self {
            Self::Release => OrderEvent::BeginPayout,
            Self::Refund => OrderEvent::BeginRefund,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    UnknownReference,
    AlreadySettled {
        transaction: Transaction,
    },
    StillPending {
        transaction: Transaction,
    },
    Settled {
        transaction: Transaction,
        order_transitioned: bool,
    },
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::UnknownReference => "unknown_reference",
            Self::AlreadySettled { .. } => "already_settled",
            Self::StillPending { .. } => "still_pending",
            Self::Settled { .. } => "settled",
        }
    }

    pub fn into_transaction(self) -> Option<Transaction> {
        match self {
            Self::UnknownReference => None,
            Self::AlreadySettled { transaction }
            | Self::StillPending { transaction }
            | Self::Settled { transaction, .. } => Some(transaction),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionReceipt {
    pub transaction: Transaction,
    pub redirect_url: Option<String>,
}

pub struct Checkout {
    pub order: Order,
    /// Initiation errors leave the order pending; the buyer may retry.
    pub collection: EscrowResult<CollectionReceipt>,
}

/// What happened when money was asked to leave escrow.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementAttempt {
    /// The provider accepted; its callback will settle the transaction.
    Initiated { transaction: Transaction },
    /// Nothing was sent to a provider; someone has to settle this by hand.
    Skipped { transaction: Transaction },
    Failed { transaction: Transaction, error: String },
}

impl SettlementAttempt {
    pub fn transaction(&self) -> &Transaction {
        match self {
            Self::Initiated { transaction }
            | Self::Skipped { transaction }
            | Self::Failed { transaction, .. } => transaction,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementReceipt {
    pub order: Order,
    pub attempt: SettlementAttempt,
}

enum Destination {
    Payee(Party),
    /// Provider receipt of the collection being reversed.
    Receipt(String),
}

/// A payout or reversal ready to go out, with the intent row recorded before the
/// provider is called.
struct Dispatch {
    provider: Arc<dyn PaymentProvider>,
    destination: Destination,
    intent: Transaction,
}

enum Prepared {
    Send(Dispatch),
    /// Nothing can be sent; the row says why.
    Skip(Transaction),
}

impl Prepared {
    fn transaction(&self) -> &Transaction {
        match self {
            Self::Send(dispatch) => &dispatch.intent,
            Self::Skip(transaction) => transaction,
        }
    }
}

/// Declines sometimes come back without a provider reference.
fn reference_or_local(correlation_ref: String) -> String {
    if correlation_ref.trim().is_empty() {
        local_reference()
    } else {
        correlation_ref
    }
}

pub struct ReconciliationEngine {
    orders: OrderService,
    ledger: Ledger,
    store: Arc<dyn EscrowStore>,
    providers: Arc<ProviderRegistry>,
    config: Arc<EscrowConfig>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        directory: Arc<dyn UserDirectory>,
        providers: Arc<ProviderRegistry>,
        config: Arc<EscrowConfig>,
    ) -> Self {
        Self {
            orders: OrderService::new(store.clone(), directory, providers.clone(), config.clone()),
            ledger: Ledger::new(store.clone()),
            store,
            providers,
            config,
        }
    }

    pub fn orders(&self) -> &OrderService {
        &self.orders
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn config(&self) -> &EscrowConfig {
        &self.config
    }

    pub async fn transactions(&self, order_id: Uuid) -> EscrowResult<Vec<Transaction>> {
        self.orders.get(order_id).await?;
        self.ledger.for_order(order_id).await
    }

    /// Creates the order and asks its provider to collect payment.
    pub async fn checkout(
        &self,
        request: CreateOrder,
        payer_phone: Option<String>,
    ) -> EscrowResult<Checkout> {
        let buyer_id = request.buyer_id;
        let order = self.orders.create_order(request).await?;
        let collection = self.request_collection(order.id, buyer_id, payer_phone).await;
        Ok(Checkout { order, collection })
    }

    pub async fn request_collection(
        &self,
        order_id: Uuid,
        payer_id: Uuid,
        payer_phone: Option<String>,
    ) -> EscrowResult<CollectionReceipt> {
        let order = self.orders.get(order_id).await?;
        let payer = self.orders.profile(payer_id).await?;
        if order.status != OrderStatus::Pending {
            return Err(EscrowError::InvalidTransition {
                from: order.status,
                event: "collect payment for",
            });
        }
        if payer.id != order.buyer_id {
            return Err(EscrowError::not_authorized("only the buyer pays for an order"));
        }
        let provider = self
            .providers
            .capable(order.payment_method, TransactionKind::Collection)
            .ok_or_else(|| {
                EscrowError::invalid_input(format!(
                    "payment method {} is not available",
                    order.payment_method
                ))
            })?;

        let mut party = payer.party();
        if let Some(phone) = payer_phone {
            party.contact.phone = Some(phone);
        }
        let request = CollectionOrder {
            order_id: order.id,
            amount: order.amount.clone(),
            currency: order.currency.clone(),
            description: order.item_description.clone(),
        };

        let attempt = |correlation_ref: String, status, description: String| NewTransaction {
            order_id: order.id,
            user_id: Some(payer.id),
            provider: provider.name().to_string(),
            correlation_ref,
            kind: TransactionKind::Collection,
            amount: order.amount.clone(),
            status,
            description,
        };

        match provider.initiate_collection(&request, &party).await {
            Ok(initiation) if initiation.provider_accepted => {
                let transaction = self
                    .ledger
                    .record(attempt(
                        initiation.correlation_ref,
                        TransactionStatus::Pending,
                        "collection initiated".to_string(),
                    ))
                    .await?;
                Ok(CollectionReceipt {
                    transaction,
                    redirect_url: initiation.redirect_url,
                })
            }
            Ok(initiation) => {
                let message = initiation
                    .message
                    .unwrap_or_else(|| "collection declined".to_string());
                warn!(order_id = %order.id, provider = provider.name(), "collection declined: {}", message);
                self.ledger
                    .record(attempt(
                        reference_or_local(initiation.correlation_ref),
                        TransactionStatus::Failed,
                        message.clone(),
                    ))
                    .await?;
                Err(ProviderError::rejected(provider.name(), message).into())
            }
            Err(e) => {
                warn!(order_id = %order.id, provider = provider.name(), "collection initiation failed: {}", e);
                self.ledger
                    .record(attempt(local_reference(), TransactionStatus::Failed, e.to_string()))
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Entry point for provider webhooks. Always yields the provider's acknowledgement;
    /// whatever went wrong internally is logged, never returned to the provider.
    pub async fn handle_callback(
        &self,
        provider_name: &str,
        kind: TransactionKind,
        callback: CallbackKind,
        body: &[u8],
    ) -> Acknowledgement {
        let Some(provider) = self.providers.by_name(provider_name) else {
            warn!(provider = provider_name, "callback from unconfigured provider ignored");
            return Acknowledgement::text("OK");
        };
        let ack = provider.acknowledgement(kind);

        let event = match provider.normalize_callback(kind, callback, body) {
            Ok(event) => event,
            Err(e) => {
                warn!(provider = provider_name, kind = %kind, callback = %callback, "unreadable callback: {}", e);
                return ack;
            }
        };

        match self.reconcile(provider.as_ref(), event).await {
            Ok(outcome) => {
                info!(provider = provider_name, kind = %kind, callback = %callback, outcome = outcome.label(), "callback processed")
            }
            Err(e) => {
                error!(provider = provider_name, kind = %kind, callback = %callback, "callback processing failed: {}", e)
            }
        }
        ack
    }

    /// Provider-reported timeout: the result is unknown, so ask the provider.
    pub async fn handle_timeout(
        &self,
        provider_name: &str,
        kind: TransactionKind,
        body: &[u8],
    ) -> Acknowledgement {
        self.handle_callback(provider_name, kind, CallbackKind::Timeout, body)
            .await
    }

    pub async fn reconcile(
        &self,
        provider: &dyn PaymentProvider,
        event: NormalizedEvent,
    ) -> EscrowResult<ReconcileOutcome> {
        let Some(transaction) = self
            .ledger
            .find_by_correlation_ref(provider.name(), &event.correlation_ref)
            .await?
        else {
            warn!(
                provider = provider.name(),
                correlation_ref = %event.correlation_ref,
                "event for unknown reference ignored"
            );
            return Ok(ReconcileOutcome::UnknownReference);
        };

        if transaction.status.is_terminal() {
            debug!(transaction_id = %transaction.id, status = %transaction.status, "duplicate event ignored");
            return Ok(ReconcileOutcome::AlreadySettled { transaction });
        }

        if event.outcome == EventOutcome::Ambiguous {
            return self.query_and_settle(provider, transaction).await;
        }
        if !provider.trusts_callbacks() {
            debug!(transaction_id = %transaction.id, provider = provider.name(), "confirming callback with the provider");
            return self.query_and_settle(provider, transaction).await;
        }
        self.settle(transaction.id, &event).await
    }

    /// Status query for a transaction whose callback never came.
    pub async fn poll_transaction(&self, transaction: &Transaction) -> EscrowResult<ReconcileOutcome> {
        if transaction.status.is_terminal() {
            return Ok(ReconcileOutcome::AlreadySettled {
                transaction: transaction.clone(),
            });
        }
        if is_local_reference(&transaction.correlation_ref) {
            warn!(transaction_id = %transaction.id, order_id = %transaction.order_id, "open transaction never reached its provider; check it by hand");
            return self.still_pending(transaction).await;
        }
        let Some(provider) = self.providers.by_name(&transaction.provider) else {
            warn!(transaction_id = %transaction.id, provider = %transaction.provider, "no adapter to poll");
            return self.still_pending(transaction).await;
        };
        self.query_and_settle(provider.as_ref(), transaction.clone())
            .await
    }

    async fn query_and_settle(
        &self,
        provider: &dyn PaymentProvider,
        transaction: Transaction,
    ) -> EscrowResult<ReconcileOutcome> {
        let answer = match provider
            .query_status(transaction.kind, &transaction.correlation_ref)
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!(transaction_id = %transaction.id, provider = provider.name(), "status query failed: {}", e);
                return self.still_pending(&transaction).await;
            }
        };

        match answer.outcome {
            EventOutcome::Ambiguous => {
                debug!(transaction_id = %transaction.id, "provider has no final answer yet");
                self.still_pending(&transaction).await
            }
            EventOutcome::Success | EventOutcome::Failure => self.settle(transaction.id, &answer).await,
        }
    }

    /// The query brought nothing final; the sweeper moves on to other rows next time.
    async fn still_pending(&self, transaction: &Transaction) -> EscrowResult<ReconcileOutcome> {
        let transaction = self.ledger.mark_polled(transaction.id).await?;
        Ok(ReconcileOutcome::StillPending { transaction })
    }

    /// Finalizes a transaction from a definitive event. A concurrent order change
    /// rolls the unit back and the step is re-run from a fresh read.
    async fn settle(
        &self,
        transaction_id: Uuid,
        event: &NormalizedEvent,
    ) -> EscrowResult<ReconcileOutcome> {
        let attempts = self.config.max_step_attempts.max(1);
        let mut order_id = None;

        for attempt in 1..=attempts {
            let transaction = self.ledger.find(transaction_id).await?;
            if transaction.status.is_terminal() {
                return Ok(ReconcileOutcome::AlreadySettled { transaction });
            }
            let order = self.orders.get(transaction.order_id).await?;
            order_id = Some(order.id);

            let work = self.settlement_plan(&order, &transaction, event).await;
            let order_transitioned = work.transition.is_some();

            match self.store.commit(work).await {
                Ok(CommitOutcome::Applied {
                    transaction: Some(settled),
                    ..
                }) => {
                    info!(
                        transaction_id = %settled.id,
                        order_id = %settled.order_id,
                        kind = %settled.kind,
                        status = %settled.status,
                        order_transitioned,
                        "transaction settled"
                    );
                    return Ok(ReconcileOutcome::Settled {
                        transaction: settled,
                        order_transitioned,
                    });
                }
                Ok(CommitOutcome::Applied { transaction: None, .. }) => {
                    return Err(EscrowError::transaction_not_found(transaction_id))
                }
                Ok(CommitOutcome::AlreadySettled(transaction)) => {
                    return Ok(ReconcileOutcome::AlreadySettled { transaction })
                }
                Err(EscrowError::Inconsistent { .. }) => {
                    warn!(transaction_id = %transaction_id, attempt, "order moved during settlement, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(EscrowError::Inconsistent {
            order_id: order_id.unwrap_or_default(),
        })
    }

    async fn settlement_plan(
        &self,
        order: &Order,
        transaction: &Transaction,
        event: &NormalizedEvent,
    ) -> UnitOfWork {
        let succeeded = event.outcome == EventOutcome::Success;
        let status = if succeeded {
            TransactionStatus::settled(transaction.kind)
        } else {
            TransactionStatus::Failed
        };
        let outcome_text = if succeeded { "succeeded" } else { "failed" };
        let description = event
            .detail
            .clone()
            .unwrap_or_else(|| format!("{} {}", transaction.kind, outcome_text));

        let work = UnitOfWork::new().settle(Settlement {
            transaction_id: transaction.id,
            status,
            correlation_ref: None,
            provider_tx_id: event.provider_tx_id.clone(),
            description: Some(description.clone()),
        });

        match (transaction.kind, succeeded) {
            (TransactionKind::Collection, true) => {
                self.collection_succeeded(work, order, transaction, event).await
            }
            (TransactionKind::Collection, false) => {
                let message = format!(
                    "Payment for '{}' did not go through ({}). You can try again.",
                    order.item_description, description
                );
                let buyer = self.orders.notifier().to_user(order.id, order.buyer_id, message).await;
                work.note(AuditRecord::note(
                    order,
                    Actor::system(),
                    format!("collection {} failed: {}", transaction.correlation_ref, description),
                ))
                .notify(buyer.into_iter().collect())
            }
            (TransactionKind::Payout, true) if order.status == OrderStatus::Completed => {
                work.note(AuditRecord::note(
                    order,
                    Actor::system(),
                    format!("seller payout {} settled", transaction.correlation_ref),
                ))
            }
            (TransactionKind::Payout, false) if order.status == OrderStatus::Completed => {
                let reason = format!(
                    "seller payout {} failed: {}",
                    transaction.correlation_ref, description
                );
                let ops = self.orders.notifier().to_operations(
                    order.id,
                    format!("Order {} is complete but the {}. Settle it manually.", order.id, reason),
                );
                work.note(AuditRecord::note(order, Actor::system(), reason))
                    .notify(ops.into_iter().collect())
            }
            (TransactionKind::Payout, true) => {
                self.advance_or_note(work, order, transaction, OrderEvent::PayoutSucceeded)
                    .await
            }
            (TransactionKind::Reversal, true) => {
                self.advance_or_note(work, order, transaction, OrderEvent::RefundSucceeded)
                    .await
            }
            (TransactionKind::Payout | TransactionKind::Reversal, false) => {
                self.advance_or_note(work, order, transaction, OrderEvent::SettlementFailed)
                    .await
            }
        }
    }

    async fn collection_succeeded(
        &self,
        mut work: UnitOfWork,
        order: &Order,
        transaction: &Transaction,
        event: &NormalizedEvent,
    ) -> UnitOfWork {
        if order.status == OrderStatus::Pending {
            let received = event
                .amount
                .clone()
                .unwrap_or_else(|| transaction.amount.clone());
            let shortfall: BigDecimal = &order.amount - &received;

            if shortfall > BigDecimal::zero() {
                let accepted = self.config.accepts_shortfall(&shortfall);
                warn!(
                    order_id = %order.id,
                    received = %received,
                    expected = %order.amount,
                    accepted,
                    "underpaid collection"
                );
                let reason = format!(
                    "underpaid: received {} {} of {}",
                    order.currency, received, order.amount
                );
                if !accepted {
                    let ops = self.orders.notifier().to_operations(
                        order.id,
                        format!("Order {} {}; held for review.", order.id, reason),
                    );
                    return work
                        .note(AuditRecord::note(
                            order,
                            Actor::system(),
                            format!("{}; beyond tolerance, order held for review", reason),
                        ))
                        .notify(ops.into_iter().collect());
                }
                work = work.note(AuditRecord::note(order, Actor::system(), reason));
            }
        }

        self.advance_or_note(work, order, transaction, OrderEvent::CollectionSucceeded)
            .await
    }

    /// Adds the order transition `event` causes, or, when the order is no longer in a
    /// state the event applies to, an audit note and a message for operations.
    async fn advance_or_note(
        &self,
        work: UnitOfWork,
        order: &Order,
        transaction: &Transaction,
        event: OrderEvent,
    ) -> UnitOfWork {
        match plan_transition(order, &event, Actor::system()) {
            Ok(transition) => {
                let notifications = self
                    .orders
                    .notifier()
                    .for_transition(order, transition.to)
                    .await;
                work.transition(transition).notify(notifications)
            }
            Err(_) => {
                warn!(
                    order_id = %order.id,
                    transaction_id = %transaction.id,
                    status = %order.status,
                    "settled transaction leaves order untouched"
                );
                let reason = format!(
                    "{} {} settled while order was {}; order left unchanged",
                    transaction.kind, transaction.correlation_ref, order.status
                );
                let ops = self.orders.notifier().to_operations(
                    order.id,
                    format!("Order {}: {}. Manual follow-up needed.", order.id, reason),
                );
                work.note(AuditRecord::note(order, Actor::system(), reason))
                    .notify(ops.into_iter().collect())
            }
        }
    }

    /// Admin decision on a disputed order: pay the seller or refund the buyer.
    ///
    /// The order is moved to its processing status, with the intent row, before the
    /// provider is called, so of two concurrent resolutions only one ever sends money.
    pub async fn resolve_dispute(
        &self,
        order_id: Uuid,
        admin_id: Uuid,
        resolution: Resolution,
    ) -> EscrowResult<SettlementReceipt> {
        let admin = self.orders.profile(admin_id).await?;
        if admin.role != UserRole::Admin {
            return Err(EscrowError::not_authorized("only administrators resolve disputes"));
        }
        let actor = admin.actor();
        let order = self.orders.get(order_id).await?;
        let event = resolution.event();
        if order.status != OrderStatus::Disputed {
            return Err(EscrowError::InvalidTransition {
                from: order.status,
                event: event.name(),
            });
        }

        let dispatch = match self
            .prepare_settlement(&order, resolution.kind(), Some(admin_id))
            .await?
        {
            Prepared::Send(dispatch) => dispatch,
            Prepared::Skip(transaction) => {
                warn!(order_id = %order_id, resolution = ?resolution, "dispute resolution not sent: {}", transaction.description);
                let note = AuditRecord::note(
                    &order,
                    actor,
                    format!("{} {}: {}", transaction.kind, transaction.status, transaction.description),
                );
                self.store
                    .commit(UnitOfWork::new().record(transaction.clone()).note(note))
                    .await?;
                return Ok(SettlementReceipt {
                    order,
                    attempt: SettlementAttempt::Skipped { transaction },
                });
            }
        };

        let intent = dispatch.intent.clone();
        let claimed = self
            .claim(order_id, &event, actor, |_, work| work.record(intent.clone()))
            .await?;
        info!(order_id = %order_id, resolution = ?resolution, transaction_id = %intent.id, "dispute resolution claimed");

        let attempt = self.dispatch(&claimed, dispatch).await?;
        let order = match attempt {
            SettlementAttempt::Initiated { .. } => claimed,
            _ => self.orders.get(order_id).await?,
        };
        Ok(SettlementReceipt { order, attempt })
    }

    /// Buyer confirms receipt: the order completes and the seller payout starts.
    pub async fn confirm_delivery(
        &self,
        order_id: Uuid,
        buyer_id: Uuid,
    ) -> EscrowResult<SettlementReceipt> {
        let actor = self.orders.profile(buyer_id).await?.actor();
        self.complete_and_release(order_id, OrderEvent::ConfirmDelivery, actor, Some(buyer_id))
            .await
    }

    /// Completes an order nobody acted on within the confirmation window.
    pub async fn auto_release(&self, order_id: Uuid) -> EscrowResult<SettlementReceipt> {
        self.complete_and_release(order_id, OrderEvent::AutoRelease, Actor::system(), None)
            .await
    }

    async fn complete_and_release(
        &self,
        order_id: Uuid,
        event: OrderEvent,
        actor: Actor,
        user_id: Option<Uuid>,
    ) -> EscrowResult<SettlementReceipt> {
        let current = self.orders.get(order_id).await?;
        let prepared = self
            .prepare_settlement(&current, TransactionKind::Payout, user_id)
            .await?;
        let transaction = prepared.transaction().clone();

        let order = match &prepared {
            Prepared::Send(_) => {
                self.claim(order_id, &event, actor, |_, work| {
                    work.record(transaction.clone())
                })
                .await?
            }
            Prepared::Skip(_) => {
                let reason = format!(
                    "seller payout {}: {}",
                    transaction.status, transaction.description
                );
                self.claim(order_id, &event, actor, |completed, work| {
                    let ops = self.orders.notifier().to_operations(
                        completed.id,
                        format!(
                            "Order {} is complete but the {}. Settle it manually.",
                            completed.id, reason
                        ),
                    );
                    work.record(transaction.clone())
                        .note(AuditRecord::note(completed, Actor::system(), reason.clone()))
                        .notify(ops.into_iter().collect())
                })
                .await?
            }
        };

        let attempt = match prepared {
            Prepared::Send(dispatch) => self.dispatch(&order, dispatch).await?,
            Prepared::Skip(transaction) => {
                error!(order_id = %order_id, "seller payout not sent: {}", transaction.description);
                SettlementAttempt::Skipped { transaction }
            }
        };
        Ok(SettlementReceipt { order, attempt })
    }

    /// Applies `event` and whatever `attach` adds to the unit as one commit. `attach`
    /// sees the order as it will be once the transition lands. A lost race is
    /// re-evaluated from a fresh read, so the loser gets `InvalidTransition`.
    async fn claim<F>(
        &self,
        order_id: Uuid,
        event: &OrderEvent,
        actor: Actor,
        attach: F,
    ) -> EscrowResult<Order>
    where
        F: Fn(&Order, UnitOfWork) -> UnitOfWork,
    {
        let attempts = self.config.max_step_attempts.max(1);
        for attempt in 1..=attempts {
            let order = self.orders.get(order_id).await?;
            let transition = plan_transition(&order, event, actor)?;
            let notifications = self
                .orders
                .notifier()
                .for_transition(&order, transition.to)
                .await;
            let (from, to) = (transition.from, transition.to);

            let mut after = order.clone();
            after.status = to;
            let work = attach(
                &after,
                UnitOfWork::new().transition(transition).notify(notifications),
            );

            match self.store.commit(work).await {
                Ok(CommitOutcome::Applied {
                    order: Some(updated),
                    ..
                }) => {
                    info!(order_id = %order_id, from = %from, to = %to, actor = %actor.role, "order transitioned");
                    return Ok(updated);
                }
                Ok(_) => return self.orders.get(order_id).await,
                Err(EscrowError::Inconsistent { .. }) => {
                    warn!(order_id = %order_id, attempt, "order changed concurrently, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(EscrowError::Inconsistent { order_id })
    }

    /// Works out how money would leave escrow for `order`. Nothing is written and no
    /// provider is called.
    async fn prepare_settlement(
        &self,
        order: &Order,
        kind: TransactionKind,
        user_id: Option<Uuid>,
    ) -> EscrowResult<Prepared> {
        let provider_name = self
            .providers
            .for_method(order.payment_method)
            .map(|p| p.name().to_string())
            .unwrap_or_else(|| order.payment_method.to_string());

        let draft = |amount: BigDecimal, status: TransactionStatus, description: String| {
            Transaction::from(NewTransaction {
                order_id: order.id,
                user_id,
                provider: provider_name.clone(),
                correlation_ref: local_reference(),
                kind,
                amount,
                status,
                description,
            })
        };
        let skip = |amount: BigDecimal, reason: String| {
            Prepared::Skip(draft(amount, TransactionStatus::Skipped, reason))
        };

        let collected = self
            .ledger
            .for_order(order.id)
            .await?
            .into_iter()
            .filter(|t| {
                t.kind == TransactionKind::Collection && t.status == TransactionStatus::Success
            })
            .last();
        let Some(collected) = collected else {
            return Ok(skip(
                order.amount.clone(),
                format!("no settled collection to {}", kind),
            ));
        };
        let amount = collected.amount.clone();

        let Some(provider) = self.providers.capable(order.payment_method, kind) else {
            return Ok(skip(
                amount,
                format!(
                    "no {} adapter configured for {}; settle manually",
                    kind, order.payment_method
                ),
            ));
        };

        let destination = match kind {
            TransactionKind::Payout => {
                let seller = self.orders.profile(order.seller_id).await?;
                Destination::Payee(seller.party())
            }
            TransactionKind::Reversal => match collected.provider_tx_id {
                Some(receipt) => Destination::Receipt(receipt),
                None => {
                    return Ok(skip(
                        amount,
                        "collection has no provider receipt to reverse".to_string(),
                    ))
                }
            },
            TransactionKind::Collection => {
                return Err(EscrowError::invalid_input("collections do not leave escrow"))
            }
        };

        Ok(Prepared::Send(Dispatch {
            provider,
            destination,
            intent: draft(amount, TransactionStatus::Pending, format!("{} requested", kind)),
        }))
    }

    /// Calls the provider for a claimed settlement. The intent row is already stored,
    /// so an accepted request only has the provider's reference attached to it and a
    /// refused one settles the row as failed.
    async fn dispatch(&self, order: &Order, dispatch: Dispatch) -> EscrowResult<SettlementAttempt> {
        let Dispatch {
            provider,
            destination,
            intent,
        } = dispatch;
        let memo = format!("Escrow order {}", order.id);

        let result = match &destination {
            Destination::Payee(payee) => {
                provider.initiate_payout(payee, &intent.amount, &memo).await
            }
            Destination::Receipt(receipt) => {
                provider.initiate_reversal(receipt, &intent.amount, &memo).await
            }
        };

        let error = match result {
            Ok(initiation) if initiation.provider_accepted => {
                let transaction = self
                    .attach_reference(&intent, initiation.correlation_ref)
                    .await?;
                info!(
                    order_id = %order.id,
                    transaction_id = %transaction.id,
                    kind = %transaction.kind,
                    correlation_ref = %transaction.correlation_ref,
                    "settlement initiated"
                );
                return Ok(SettlementAttempt::Initiated { transaction });
            }
            Ok(initiation) => initiation
                .message
                .unwrap_or_else(|| format!("{} declined", intent.kind)),
            Err(e) => {
                warn!(order_id = %order.id, provider = provider.name(), kind = %intent.kind, "initiation failed: {}", e);
                e.to_string()
            }
        };

        let refused = NormalizedEvent::new(intent.correlation_ref.clone(), EventOutcome::Failure)
            .with_detail(error.clone());
        let transaction = self
            .settle(intent.id, &refused)
            .await?
            .into_transaction()
            .ok_or_else(|| EscrowError::transaction_not_found(intent.id))?;
        Ok(SettlementAttempt::Failed { transaction, error })
    }

    /// Stores the provider's reference on an intent row. The provider has already
    /// accepted, so store errors are retried before giving up.
    async fn attach_reference(
        &self,
        intent: &Transaction,
        correlation_ref: String,
    ) -> EscrowResult<Transaction> {
        let attempts = self.config.max_step_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let work = UnitOfWork::new().settle(Settlement {
                transaction_id: intent.id,
                status: TransactionStatus::Pending,
                correlation_ref: Some(correlation_ref.clone()),
                provider_tx_id: None,
                description: Some(format!("{} initiated", intent.kind)),
            });
            match self.store.commit(work).await {
                Ok(CommitOutcome::Applied {
                    transaction: Some(transaction),
                    ..
                })
                | Ok(CommitOutcome::AlreadySettled(transaction)) => return Ok(transaction),
                Ok(CommitOutcome::Applied { transaction: None, .. }) => {
                    return Err(EscrowError::transaction_not_found(intent.id))
                }
                Err(e @ EscrowError::DuplicateCorrelationRef { .. }) => return Err(e),
                Err(e) => {
                    warn!(transaction_id = %intent.id, correlation_ref = %correlation_ref, attempt, "storing provider reference failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        error!(
            transaction_id = %intent.id,
            order_id = %intent.order_id,
            correlation_ref = %correlation_ref,
            "provider accepted but its reference could not be stored"
        );
        Err(last_error.unwrap_or_else(|| EscrowError::transaction_not_found(intent.id)))
    }
}
