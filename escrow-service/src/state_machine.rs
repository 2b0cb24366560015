//! Order lifecycle rules.
//!
//! Pure functions only: given the current status, an event, and how the actor relates
//! to the order, decide the next status. Persistence and the compare-and-swap that
//! applies the decision live in [`crate::orders`].

use crate::error::{EscrowError, EscrowResult};
use crate::models::Order;
use serde::{Deserialize, Serialize};
use shared::string_enum;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Shipped,
    Delivered,
    Completed,
    Disputed,
    ProcessingPayout,
    ProcessingRefund,
    Cancelled,
    Refunded,
}

string_enum!(OrderStatus, "order status", {
    Pending => "pending",
    Paid => "paid",
    Shipped => "shipped",
    Delivered => "delivered",
    Completed => "completed",
    Disputed => "disputed",
    ProcessingPayout => "processing_payout",
    ProcessingRefund => "processing_refund",
    Cancelled => "cancelled",
    Refunded => "refunded",
});

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Refunded)
    }
}

/// Role recorded against every audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Buyer,
    Seller,
    Admin,
    System,
}

string_enum!(ActorRole, "actor role", {
    Buyer => "buyer",
    Seller => "seller",
    Admin => "admin",
    System => "system",
});

/// Whoever is asking for a transition. `id` is `None` for the engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Option<Uuid>,
    pub role: ActorRole,
}

impl Actor {
    pub fn system() -> Self {
        Self {
            id: None,
            role: ActorRole::System,
        }
    }

    pub fn user(id: Uuid, role: ActorRole) -> Self {
        Self { id: Some(id), role }
    }

    /// How this actor relates to one particular order.
    pub fn party_to(&self, order: &Order) -> Party {
        match (self.role, self.id) {
            (ActorRole::System, _) => Party::System,
            (ActorRole::Admin, _) => Party::Admin,
            (_, Some(id)) if id == order.buyer_id => Party::Buyer,
            (_, Some(id)) if id == order.seller_id => Party::Seller,
            _ => Party::Stranger,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Buyer,
    Seller,
    Admin,
    System,
    Stranger,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEvent {
    CollectionSucceeded,
    Cancel,
    Ship,
    ReportDelivered { proof_of_delivery: String },
    ConfirmDelivery,
    AutoRelease,
    RaiseDispute { reason: String },
    BeginPayout,
    BeginRefund,
    PayoutSucceeded,
    RefundSucceeded,
    SettlementFailed,
    AdminOverride { target: OrderStatus, reason: String },
}

impl OrderEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CollectionSucceeded => "mark paid",
            Self::Cancel => "cancel",
            Self::Ship => "ship",
            Self::ReportDelivered { .. } => "report delivery of",
            Self::ConfirmDelivery => "confirm delivery of",
            Self::AutoRelease => "auto-release",
            Self::RaiseDispute { .. } => "dispute",
            Self::BeginPayout => "release",
            Self::BeginRefund => "refund",
            Self::PayoutSucceeded => "complete payout for",
            Self::RefundSucceeded => "complete refund for",
            Self::SettlementFailed => "fail settlement for",
            Self::AdminOverride { .. } => "override",
        }
    }

    /// Text stored on the audit entry.
    pub fn reason(&self) -> String {
        match self {
            Self::CollectionSucceeded => "collection succeeded".to_string(),
            Self::Cancel => "cancelled".to_string(),
            Self::Ship => "seller shipped the item".to_string(),
            Self::ReportDelivered { proof_of_delivery } => {
                format!("delivery reported, proof {}", proof_of_delivery)
            }
            Self::ConfirmDelivery => "buyer confirmed delivery".to_string(),
            Self::AutoRelease => "released after confirmation window elapsed".to_string(),
            Self::RaiseDispute { reason } => format!("dispute raised: {}", reason),
            Self::BeginPayout => "admin released funds to seller".to_string(),
            Self::BeginRefund => "admin refunded buyer".to_string(),
            Self::PayoutSucceeded => "payout succeeded".to_string(),
            Self::RefundSucceeded => "reversal succeeded".to_string(),
            Self::SettlementFailed => "settlement failed".to_string(),
            Self::AdminOverride { reason, .. } => format!("admin override: {}", reason),
        }
    }

    pub fn proof_of_delivery(&self) -> Option<&str> {
        match self {
            Self::ReportDelivered { proof_of_delivery } => Some(proof_of_delivery),
            _ => None,
        }
    }
}

/// The transition table. State is checked before the actor, so a request that lost a
/// race reports `InvalidTransition` rather than `NotAuthorized`.
pub fn next_status(
    current: OrderStatus,
    event: &OrderEvent,
    party: Party,
) -> EscrowResult<OrderStatus> {
    use OrderEvent as E;
    use OrderStatus::*;
    use Party as P;

    let (to, allowed): (OrderStatus, &[Party]) = match (current, event) {
        (Pending, E::CollectionSucceeded) => (Paid, &[P::System]),
        (Pending, E::Cancel) => (Cancelled, &[P::Buyer, P::Admin]),
        (Paid, E::Ship) => (Shipped, &[P::Seller]),
        (Shipped, E::ReportDelivered { .. }) => (Delivered, &[P::Seller]),
        (Shipped | Delivered, E::ConfirmDelivery) => (Completed, &[P::Buyer]),
        (Shipped | Delivered, E::AutoRelease) => (Completed, &[P::System]),
        (Paid | Shipped | Delivered, E::RaiseDispute { .. }) => (Disputed, &[P::Buyer, P::Seller]),
        (Disputed, E::BeginPayout) => (ProcessingPayout, &[P::Admin]),
        (Disputed, E::BeginRefund) => (ProcessingRefund, &[P::Admin]),
        (ProcessingPayout, E::PayoutSucceeded) => (Completed, &[P::System]),
        (ProcessingRefund, E::RefundSucceeded) => (Refunded, &[P::System]),
        (ProcessingPayout | ProcessingRefund, E::SettlementFailed) => (Disputed, &[P::System]),
        (Disputed, E::AdminOverride { target, .. }) if *target != Disputed => {
            (*target, &[P::Admin])
        }
        (from, event) => {
            return Err(EscrowError::InvalidTransition {
                from,
                event: event.name(),
            })
        }
    };

    if !allowed.contains(&party) {
        return Err(EscrowError::not_authorized(format!(
            "{:?} may not {} an order that is {}",
            party,
            event.name(),
            current
        )));
    }

    Ok(to)
}
