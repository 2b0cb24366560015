use crate::state_machine::OrderStatus;
use payment_providers::ProviderError;
use shared::UnknownVariant;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cannot {event} an order that is {from}")]
    InvalidTransition {
        from: OrderStatus,
        event: &'static str,
    },

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("seller not eligible: {0}")]
    SellerNotEligible(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{provider} reference {reference} is already recorded")]
    DuplicateCorrelationRef { provider: String, reference: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("order {order_id} changed while the step was running")]
    Inconsistent { order_id: Uuid },

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("corrupt record: {0}")]
    Corrupt(#[from] UnknownVariant),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("notification delivery failed: {0}")]
    Notification(String),
}

impl EscrowError {
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_authorized<S: Into<String>>(msg: S) -> Self {
        Self::NotAuthorized(msg.into())
    }

    pub fn order_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "order",
            id: id.to_string(),
        }
    }

    pub fn transaction_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "transaction",
            id: id.to_string(),
        }
    }
}

pub type EscrowResult<T> = Result<T, EscrowError>;
