use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Returned when a persisted or user-supplied label does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Implements `as_str`, `Display` and `FromStr` over fixed snake_case labels, the
/// form every status and kind is persisted and exchanged in.
#[macro_export]
macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok(Self::$variant),)+
                    other => Err($crate::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// How the buyer pays for an order. Each method maps to exactly one provider adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Mpesa,
    BankTransfer,
    Card,
}

string_enum!(PaymentMethod, "payment method", {
    Mpesa => "mpesa",
    BankTransfer => "bank_transfer",
    Card => "card",
});

/// Direction of a money movement attached to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// Buyer pays into escrow.
    Collection,
    /// Escrow pays the seller.
    Payout,
    /// Escrow returns a collection to the buyer.
    Reversal,
}

string_enum!(TransactionKind, "transaction kind", {
    Collection => "collection",
    Payout => "payout",
    Reversal => "reversal",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Refunded,
    Skipped,
}

string_enum!(TransactionStatus, "transaction status", {
    Pending => "pending",
    Processing => "processing",
    Success => "success",
    Failed => "failed",
    Refunded => "refunded",
    Skipped => "skipped",
});

impl TransactionStatus {
    /// Terminal statuses are written once and never change afterwards.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Refunded | Self::Skipped
        )
    }

    /// The terminal status a successful provider result settles a transaction of `kind` into.
    pub fn settled(kind: TransactionKind) -> Self {
        match kind {
            TransactionKind::Reversal => Self::Refunded,
            TransactionKind::Collection | TransactionKind::Payout => Self::Success,
        }
    }
}

/// Three-way provider verdict every adapter reduces its own vocabulary to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Success,
    Failure,
    Ambiguous,
}

/// Which webhook a provider called: the final result or a queue timeout notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    Result,
    Timeout,
}

string_enum!(CallbackKind, "callback kind", {
    Result => "result",
    Timeout => "timeout",
});

/// Provider callback or status-query answer after adapter normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub correlation_ref: String,
    pub provider_tx_id: Option<String>,
    pub outcome: EventOutcome,
    pub amount: Option<BigDecimal>,
    pub timestamp: DateTime<Utc>,
    pub detail: Option<String>,
}

impl NormalizedEvent {
    pub fn new(correlation_ref: impl Into<String>, outcome: EventOutcome) -> Self {
        Self {
            correlation_ref: correlation_ref.into(),
            provider_tx_id: None,
            outcome,
            amount: None,
            timestamp: Utc::now(),
            detail: None,
        }
    }

    pub fn with_provider_tx_id(mut self, provider_tx_id: impl Into<String>) -> Self {
        self.provider_tx_id = Some(provider_tx_id.into());
        self
    }

    pub fn with_amount(mut self, amount: BigDecimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Where a user can be reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub phone: Option<String>,
    pub email: Option<String>,
}

impl Contact {
    pub fn is_reachable(&self) -> bool {
        self.phone.is_some() || self.email.is_some()
    }
}

/// Message handed to the notification sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: Uuid,
    pub order_id: Uuid,
    pub recipient: Contact,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl NotificationEvent {
    pub fn new(order_id: Uuid, recipient: Contact, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            recipient,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}
