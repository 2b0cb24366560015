use crate::config::EscrowConfig;
use crate::directory::{UserDirectory, UserProfile, UserRole};
use crate::error::{EscrowError, EscrowResult};
use crate::models::{AuditRecord, Order};
use crate::notify::Notifier;
use crate::state_machine::{next_status, Actor, ActorRole, OrderEvent, OrderStatus};
use crate::store::{CommitOutcome, EscrowStore, OrderTransition, UnitOfWork};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use num_traits::Zero;
use payment_providers::ProviderRegistry;
use serde::Deserialize;
use shared::{PaymentMethod, TransactionKind};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrder {
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub item_description: String,
    pub amount: BigDecimal,
    #[serde(default)]
    pub currency: Option<String>,
    pub payment_method: PaymentMethod,
}

/// Decides the transition `event` would cause on `order`, without applying it.
pub fn plan_transition(
    order: &Order,
    event: &OrderEvent,
    actor: Actor,
) -> EscrowResult<OrderTransition> {
    let to = next_status(order.status, event, actor.party_to(order))?;
    Ok(OrderTransition {
        order_id: order.id,
        from: order.status,
        to,
        actor,
        reason: event.reason(),
        proof_of_delivery: event.proof_of_delivery().map(str::to_string),
    })
}

#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn EscrowStore>,
    directory: Arc<dyn UserDirectory>,
    providers: Arc<ProviderRegistry>,
    notifier: Notifier,
    config: Arc<EscrowConfig>,
}

impl OrderService {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        directory: Arc<dyn UserDirectory>,
        providers: Arc<ProviderRegistry>,
        config: Arc<EscrowConfig>,
    ) -> Self {
        let notifier = Notifier::new(directory.clone(), config.ops_contact.clone());
        Self {
            store,
            directory,
            providers,
            notifier,
            config,
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub async fn create_order(&self, request: CreateOrder) -> EscrowResult<Order> {
        let item_description = request.item_description.trim().to_string();
        if item_description.is_empty() {
            return Err(EscrowError::invalid_input("item description is empty"));
        }
        if request.amount <= BigDecimal::zero() {
            return Err(EscrowError::invalid_input("amount must be positive"));
        }
        let currency = request
            .currency
            .map(|c| c.trim().to_uppercase())
            .unwrap_or_else(|| self.config.default_currency.clone());
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(EscrowError::invalid_input(format!("'{}' is not an ISO currency code", currency)));
        }
        if self
            .providers
            .capable(request.payment_method, TransactionKind::Collection)
            .is_none()
        {
            return Err(EscrowError::invalid_input(format!(
                "payment method {} is not available",
                request.payment_method
            )));
        }

        let buyer = self.directory.find_user_by_id(request.buyer_id).await?;
        if !matches!(buyer, Some(UserProfile { role: UserRole::Buyer, .. })) {
            return Err(EscrowError::not_authorized(format!(
                "{} is not a registered buyer",
                request.buyer_id
            )));
        }
        let seller = self.directory.find_user_by_id(request.seller_id).await?;
        if !matches!(seller, Some(UserProfile { role: UserRole::Seller, .. })) {
            return Err(EscrowError::SellerNotEligible(format!(
                "{} is not a registered seller",
                request.seller_id
            )));
        }

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            buyer_id: request.buyer_id,
            seller_id: request.seller_id,
            item_description,
            amount: request.amount,
            currency,
            status: OrderStatus::Pending,
            payment_method: request.payment_method,
            proof_of_delivery: None,
            created_at: now,
            updated_at: now,
        };
        let actor = Actor::user(request.buyer_id, ActorRole::Buyer);
        let audit = AuditRecord::new(order.id, None, OrderStatus::Pending, actor, "order created");
        self.store.insert_order(&order, &audit).await?;

        info!(
            order_id = %order.id,
            buyer_id = %order.buyer_id,
            seller_id = %order.seller_id,
            amount = %order.amount,
            method = %order.payment_method,
            "order created"
        );
        Ok(order)
    }

    pub async fn get(&self, order_id: Uuid) -> EscrowResult<Order> {
        self.store
            .find_order(order_id)
            .await?
            .ok_or_else(|| EscrowError::order_not_found(order_id))
    }

    pub async fn history(&self, order_id: Uuid) -> EscrowResult<Vec<AuditRecord>> {
        self.get(order_id).await?;
        self.store.order_history(order_id).await
    }

    pub async fn idle_since(
        &self,
        statuses: &[OrderStatus],
        before: DateTime<Utc>,
        limit: i64,
    ) -> EscrowResult<Vec<Order>> {
        self.store.orders_idle_since(statuses, before, limit).await
    }

    /// Resolves a user id into a registered profile; unknown users are not authorized.
    pub async fn profile(&self, user_id: Uuid) -> EscrowResult<UserProfile> {
        self.directory
            .find_user_by_id(user_id)
            .await?
            .ok_or_else(|| EscrowError::not_authorized(format!("unknown user {}", user_id)))
    }

    /// Applies a user-requested event to an order.
    pub async fn transition(
        &self,
        order_id: Uuid,
        event: OrderEvent,
        actor_id: Uuid,
    ) -> EscrowResult<Order> {
        let actor = self.profile(actor_id).await?.actor();
        self.apply(order_id, event, actor).await
    }

    /// Compare-and-swap with bounded re-reads: a lost race re-evaluates the event
    /// against the fresh status, so the loser sees `InvalidTransition`.
    pub async fn apply(&self, order_id: Uuid, event: OrderEvent, actor: Actor) -> EscrowResult<Order> {
        let attempts = self.config.max_step_attempts.max(1);
        for attempt in 1..=attempts {
            let order = self.get(order_id).await?;
            let transition = plan_transition(&order, &event, actor)?;
            let notifications = self.notifier.for_transition(&order, transition.to).await;
            let (from, to) = (transition.from, transition.to);

            let work = UnitOfWork::new()
                .transition(transition)
                .notify(notifications);
            match self.store.commit(work).await {
                Ok(CommitOutcome::Applied {
                    order: Some(updated),
                    ..
                }) => {
                    info!(order_id = %order_id, from = %from, to = %to, actor = %actor.role, "order transitioned");
                    return Ok(updated);
                }
                Ok(_) => return self.get(order_id).await,
                Err(EscrowError::Inconsistent { .. }) => {
                    warn!(order_id = %order_id, attempt, "order changed concurrently, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
        Err(EscrowError::Inconsistent { order_id })
    }
}
