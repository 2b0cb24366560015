#![allow(dead_code)]

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use escrow_service::config::EscrowConfig;
use escrow_service::directory::{InMemoryDirectory, UserProfile, UserRole};
use escrow_service::error::{EscrowError, EscrowResult};
use escrow_service::models::{AuditRecord, Order, OutboxEntry, Transaction};
use escrow_service::orders::CreateOrder;
use escrow_service::state_machine::{OrderEvent, OrderStatus};
use escrow_service::store::{CommitOutcome, EscrowStore, InMemoryStore, UnitOfWork};
use escrow_service::ReconciliationEngine;
use payment_providers::{
    Acknowledgement, Capabilities, CollectionOrder, Initiation, Party, PaymentProvider,
    ProviderError, ProviderRegistry, ProviderResult,
};
use serde::Deserialize;
use serde_json::json;
use shared::{CallbackKind, Contact, EventOutcome, NormalizedEvent, PaymentMethod, TransactionKind};
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const PROVIDER: &str = "fakepay";

#[derive(Deserialize)]
struct FakeCallback {
    reference: String,
    status: String,
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    receipt: Option<String>,
}

/// Provider whose initiations and status answers are queued up by the test. Every
/// initiation yields once, like a network round-trip, so joined futures interleave.
pub struct ScriptedProvider {
    capabilities: Capabilities,
    issued: AtomicUsize,
    payouts: AtomicUsize,
    reversals: AtomicUsize,
    initiations: Mutex<VecDeque<ProviderResult<Initiation>>>,
    answers: Mutex<VecDeque<NormalizedEvent>>,
}

impl ScriptedProvider {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            issued: AtomicUsize::new(0),
            payouts: AtomicUsize::new(0),
            reversals: AtomicUsize::new(0),
            initiations: Mutex::new(VecDeque::new()),
            answers: Mutex::new(VecDeque::new()),
        }
    }

    pub fn script_initiation(&self, result: ProviderResult<Initiation>) {
        self.initiations.lock().unwrap().push_back(result);
    }

    pub fn script_answer(&self, answer: NormalizedEvent) {
        self.answers.lock().unwrap().push_back(answer);
    }

    pub fn payouts_sent(&self) -> usize {
        self.payouts.load(Ordering::SeqCst)
    }

    pub fn reversals_sent(&self) -> usize {
        self.reversals.load(Ordering::SeqCst)
    }

    fn next_initiation(&self) -> ProviderResult<Initiation> {
        if let Some(scripted) = self.initiations.lock().unwrap().pop_front() {
            return scripted;
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Initiation::accepted(format!("FP-{}", n)))
    }
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn initiate_collection(
        &self,
        _order: &CollectionOrder,
        _payer: &Party,
    ) -> ProviderResult<Initiation> {
        tokio::task::yield_now().await;
        self.next_initiation()
    }

    async fn initiate_payout(
        &self,
        _payee: &Party,
        _amount: &BigDecimal,
        _memo: &str,
    ) -> ProviderResult<Initiation> {
        self.payouts.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.next_initiation()
    }

    async fn initiate_reversal(
        &self,
        _original_provider_tx_id: &str,
        _amount: &BigDecimal,
        _memo: &str,
    ) -> ProviderResult<Initiation> {
        self.reversals.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.next_initiation()
    }

    fn normalize_callback(
        &self,
        _kind: TransactionKind,
        callback: CallbackKind,
        body: &[u8],
    ) -> ProviderResult<NormalizedEvent> {
        let parsed: FakeCallback = serde_json::from_slice(body)
            .map_err(|e| ProviderError::malformed(PROVIDER, e.to_string()))?;
        let outcome = match (callback, parsed.status.as_str()) {
            (CallbackKind::Timeout, _) | (_, "pending") => EventOutcome::Ambiguous,
            (_, "success") => EventOutcome::Success,
            _ => EventOutcome::Failure,
        };
        let mut event = NormalizedEvent::new(parsed.reference, outcome);
        if let Some(amount) = parsed.amount {
            let amount = BigDecimal::from_str(&amount)
                .map_err(|e| ProviderError::malformed(PROVIDER, e.to_string()))?;
            event = event.with_amount(amount);
        }
        if let Some(receipt) = parsed.receipt {
            event = event.with_provider_tx_id(receipt);
        }
        Ok(event)
    }

    async fn query_status(
        &self,
        _kind: TransactionKind,
        correlation_ref: &str,
    ) -> ProviderResult<NormalizedEvent> {
        Ok(self
            .answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| NormalizedEvent::new(correlation_ref, EventOutcome::Ambiguous)))
    }

    fn acknowledgement(&self, _kind: TransactionKind) -> Acknowledgement {
        Acknowledgement::json(json!({ "received": true }))
    }
}

pub fn full_capabilities() -> Capabilities {
    Capabilities {
        collection: true,
        payout: true,
        reversal: true,
    }
}

pub fn ops_config() -> EscrowConfig {
    EscrowConfig {
        ops_contact: Contact {
            phone: None,
            email: Some("ops@escrow.test".to_string()),
        },
        ..EscrowConfig::default()
    }
}

/// In-memory store that can be told to fail upcoming commits of a given shape.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    failing_claims: AtomicUsize,
    failing_reference_updates: AtomicUsize,
}

impl FlakyStore {
    /// Fails the next unit that records a transaction together with an order transition.
    pub fn fail_next_claim(&self) {
        self.failing_claims.fetch_add(1, Ordering::SeqCst);
    }

    /// Fails the next unit that replaces a transaction's correlation reference.
    pub fn fail_next_reference_update(&self) {
        self.failing_reference_updates.fetch_add(1, Ordering::SeqCst);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EscrowStore for FlakyStore {
    async fn insert_order(&self, order: &Order, audit: &AuditRecord) -> EscrowResult<()> {
        self.inner.insert_order(order, audit).await
    }

    async fn find_order(&self, id: Uuid) -> EscrowResult<Option<Order>> {
        self.inner.find_order(id).await
    }

    async fn orders_idle_since(
        &self,
        statuses: &[OrderStatus],
        before: DateTime<Utc>,
        limit: i64,
    ) -> EscrowResult<Vec<Order>> {
        self.inner.orders_idle_since(statuses, before, limit).await
    }

    async fn order_history(&self, order_id: Uuid) -> EscrowResult<Vec<AuditRecord>> {
        self.inner.order_history(order_id).await
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> EscrowResult<()> {
        self.inner.insert_transaction(transaction).await
    }

    async fn find_transaction(&self, id: Uuid) -> EscrowResult<Option<Transaction>> {
        self.inner.find_transaction(id).await
    }

    async fn find_transaction_by_ref(
        &self,
        provider: &str,
        correlation_ref: &str,
    ) -> EscrowResult<Option<Transaction>> {
        self.inner.find_transaction_by_ref(provider, correlation_ref).await
    }

    async fn transactions_for_order(&self, order_id: Uuid) -> EscrowResult<Vec<Transaction>> {
        self.inner.transactions_for_order(order_id).await
    }

    async fn open_transactions_since(
        &self,
        before: DateTime<Utc>,
        limit: i64,
    ) -> EscrowResult<Vec<Transaction>> {
        self.inner.open_transactions_since(before, limit).await
    }

    async fn mark_polled(&self, id: Uuid) -> EscrowResult<Option<Transaction>> {
        self.inner.mark_polled(id).await
    }

    async fn commit(&self, work: UnitOfWork) -> EscrowResult<CommitOutcome> {
        let claim = work.record.is_some() && work.transition.is_some();
        let renames = work
            .settle
            .as_ref()
            .is_some_and(|s| s.correlation_ref.is_some());
        if (claim && Self::take(&self.failing_claims))
            || (renames && Self::take(&self.failing_reference_updates))
        {
            return Err(EscrowError::Pool("connection reset".to_string()));
        }
        self.inner.commit(work).await
    }

    async fn pending_notifications(&self, limit: i64) -> EscrowResult<Vec<OutboxEntry>> {
        self.inner.pending_notifications(limit).await
    }

    async fn mark_notification_sent(&self, id: Uuid) -> EscrowResult<()> {
        self.inner.mark_notification_sent(id).await
    }
}

pub struct Harness {
    pub engine: Arc<ReconciliationEngine>,
    pub store: Arc<FlakyStore>,
    pub provider: Arc<ScriptedProvider>,
    pub buyer: Uuid,
    pub seller: Uuid,
    pub admin: Uuid,
}

pub async fn harness(capabilities: Capabilities, config: EscrowConfig) -> Harness {
    harness_with(capabilities, config, |_| {}).await
}

/// Like [`harness`], with a hook to register further adapters.
pub async fn harness_with(
    capabilities: Capabilities,
    config: EscrowConfig,
    configure: impl FnOnce(&mut ProviderRegistry),
) -> Harness {
    let directory = InMemoryDirectory::new();
    let mut ids = Vec::new();
    for (n, role) in [UserRole::Buyer, UserRole::Seller, UserRole::Admin]
        .into_iter()
        .enumerate()
    {
        let profile = UserProfile {
            id: Uuid::new_v4(),
            role,
            display_name: role.to_string(),
            contact: Contact {
                phone: Some(format!("25470000000{}", n)),
                email: None,
            },
        };
        ids.push(profile.id);
        directory.insert(profile).await;
    }

    let provider = Arc::new(ScriptedProvider::new(capabilities));
    let mut providers = ProviderRegistry::new();
    providers.register(PaymentMethod::Mpesa, provider.clone());
    configure(&mut providers);

    let store = Arc::new(FlakyStore::default());
    let engine = Arc::new(ReconciliationEngine::new(
        store.clone(),
        Arc::new(directory),
        Arc::new(providers),
        Arc::new(config),
    ));

    Harness {
        engine,
        store,
        provider,
        buyer: ids[0],
        seller: ids[1],
        admin: ids[2],
    }
}

pub fn callback_body(reference: &str, status: &str, amount: Option<&str>, receipt: Option<&str>) -> Vec<u8> {
    json!({
        "reference": reference,
        "status": status,
        "amount": amount,
        "receipt": receipt,
    })
    .to_string()
    .into_bytes()
}

impl Harness {
    pub fn order_request(&self) -> CreateOrder {
        CreateOrder {
            buyer_id: self.buyer,
            seller_id: self.seller,
            item_description: "Camera".to_string(),
            amount: BigDecimal::from(1000),
            currency: None,
            payment_method: PaymentMethod::Mpesa,
        }
    }

    /// Checks out a new order and returns it with its collection reference.
    pub async fn checkout(&self) -> (Order, String) {
        let checkout = self
            .engine
            .checkout(self.order_request(), None)
            .await
            .unwrap();
        let receipt = checkout.collection.unwrap();
        (checkout.order, receipt.transaction.correlation_ref)
    }

    pub async fn callback(&self, kind: TransactionKind, body: Vec<u8>) -> Acknowledgement {
        self.engine
            .handle_callback(PROVIDER, kind, CallbackKind::Result, &body)
            .await
    }

    pub async fn paid_order(&self) -> Order {
        let (order, reference) = self.checkout().await;
        self.callback(
            TransactionKind::Collection,
            callback_body(&reference, "success", Some("1000"), Some("RCPT-1")),
        )
        .await;
        self.order(order.id).await
    }

    pub async fn shipped_order(&self) -> Order {
        let order = self.paid_order().await;
        self.engine
            .orders()
            .transition(order.id, OrderEvent::Ship, self.seller)
            .await
            .unwrap()
    }

    pub async fn delivered_order(&self) -> Order {
        let order = self.shipped_order().await;
        let event = OrderEvent::ReportDelivered {
            proof_of_delivery: "signed by buyer".to_string(),
        };
        self.engine
            .orders()
            .transition(order.id, event, self.seller)
            .await
            .unwrap()
    }

    pub async fn disputed_order(&self) -> Order {
        let order = self.paid_order().await;
        let event = OrderEvent::RaiseDispute {
            reason: "item never arrived".to_string(),
        };
        let disputed = self
            .engine
            .orders()
            .transition(order.id, event, self.buyer)
            .await
            .unwrap();
        assert_eq!(disputed.status, OrderStatus::Disputed);
        disputed
    }

    pub fn provider_ack(&self) -> Acknowledgement {
        self.provider.acknowledgement(TransactionKind::Collection)
    }

    pub async fn order(&self, id: Uuid) -> Order {
        self.engine.orders().get(id).await.unwrap()
    }
}
