//! Payment provider adapters.
//!
//! Every provider (mobile money, bank transfer, card gateway) speaks its own wire
//! format and status vocabulary. The [`PaymentProvider`] trait hides that behind one
//! contract so the escrow engine only ever sees a [`NormalizedEvent`].

pub mod bank;
pub mod card;
pub mod config;
pub mod mpesa;
pub mod registry;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde_json::Value;
use shared::{CallbackKind, Contact, NormalizedEvent, TransactionKind};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use config::ProvidersConfig;
pub use registry::ProviderRegistry;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider {provider} unavailable: {message}")]
    Unavailable { provider: String, message: String },

    #[error("provider {provider} rejected the request: {message}")]
    Rejected { provider: String, message: String },

    #[error("provider {provider} timed out")]
    Timeout { provider: String },

    #[error("provider {provider} does not support {operation}")]
    Unsupported {
        provider: String,
        operation: &'static str,
    },

    #[error("malformed payload from {provider}: {message}")]
    Malformed { provider: String, message: String },
}

impl ProviderError {
    pub fn unavailable<S: Into<String>>(provider: &str, message: S) -> Self {
        Self::Unavailable {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn rejected<S: Into<String>>(provider: &str, message: S) -> Self {
        Self::Rejected {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn malformed<S: Into<String>>(provider: &str, message: S) -> Self {
        Self::Malformed {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn unsupported(provider: &str, operation: &'static str) -> Self {
        Self::Unsupported {
            provider: provider.to_string(),
            operation,
        }
    }

    /// Network failures become `Timeout` or `Unavailable`, never a panic.
    pub fn from_http(provider: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                provider: provider.to_string(),
            }
        } else {
            Self::unavailable(provider, err.to_string())
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Which money movements an adapter is configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub collection: bool,
    pub payout: bool,
    pub reversal: bool,
}

impl Capabilities {
    pub fn collection_only() -> Self {
        Self {
            collection: true,
            payout: false,
            reversal: false,
        }
    }

    pub fn supports(&self, kind: TransactionKind) -> bool {
        match kind {
            TransactionKind::Collection => self.collection,
            TransactionKind::Payout => self.payout,
            TransactionKind::Reversal => self.reversal,
        }
    }
}

/// A buyer or seller as seen by a provider.
#[derive(Debug, Clone)]
pub struct Party {
    pub id: Uuid,
    pub contact: Contact,
}

/// The order facts a provider needs to collect payment.
#[derive(Debug, Clone)]
pub struct CollectionOrder {
    pub order_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub description: String,
}

/// Result of an initiation call.
#[derive(Debug, Clone, PartialEq)]
pub struct Initiation {
    pub correlation_ref: String,
    pub provider_accepted: bool,
    /// Hosted checkout page the payer must be sent to, for redirect-style providers.
    pub redirect_url: Option<String>,
    pub message: Option<String>,
}

impl Initiation {
    pub fn accepted(correlation_ref: impl Into<String>) -> Self {
        Self {
            correlation_ref: correlation_ref.into(),
            provider_accepted: true,
            redirect_url: None,
            message: None,
        }
    }

    pub fn declined(correlation_ref: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            correlation_ref: correlation_ref.into(),
            provider_accepted: false,
            redirect_url: None,
            message: Some(message.into()),
        }
    }
}

/// Body a provider expects in the HTTP 200 answering its webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub content_type: &'static str,
    pub body: String,
}

impl Acknowledgement {
    pub fn json(body: Value) -> Self {
        Self {
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    pub fn text(body: &str) -> Self {
        Self {
            content_type: "text/plain",
            body: body.to_string(),
        }
    }
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Stable name persisted on every transaction this adapter creates.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    async fn initiate_collection(
        &self,
        order: &CollectionOrder,
        payer: &Party,
    ) -> ProviderResult<Initiation>;

    async fn initiate_payout(
        &self,
        _payee: &Party,
        _amount: &BigDecimal,
        _memo: &str,
    ) -> ProviderResult<Initiation> {
        Err(ProviderError::unsupported(self.name(), "payout"))
    }

    async fn initiate_reversal(
        &self,
        _original_provider_tx_id: &str,
        _amount: &BigDecimal,
        _memo: &str,
    ) -> ProviderResult<Initiation> {
        Err(ProviderError::unsupported(self.name(), "reversal"))
    }

    /// Turns a raw webhook body into the canonical event.
    fn normalize_callback(
        &self,
        kind: TransactionKind,
        callback: CallbackKind,
        body: &[u8],
    ) -> ProviderResult<NormalizedEvent>;

    /// Whether a webhook body can be taken at its word. When `false`, a callback only
    /// tells the engine to ask [`Self::query_status`] for the real outcome.
    fn trusts_callbacks(&self) -> bool {
        true
    }

    /// Asks the provider for the current state of an earlier request.
    async fn query_status(
        &self,
        kind: TransactionKind,
        correlation_ref: &str,
    ) -> ProviderResult<NormalizedEvent>;

    fn acknowledgement(&self, kind: TransactionKind) -> Acknowledgement;
}

pub(crate) fn http_client(provider: &str, timeout: Duration) -> ProviderResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::unavailable(provider, e.to_string()))
}

/// Reads a decimal that a provider may encode either as a JSON number or a string.
pub(crate) fn decimal_from_json(value: &Value) -> Option<BigDecimal> {
    match value {
        Value::Number(n) => BigDecimal::from_str(&n.to_string()).ok(),
        Value::String(s) => BigDecimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

/// Renders a status code that may arrive as a JSON number or string.
pub(crate) fn code_from_json(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.trim().to_string()),
        _ => None,
    }
}

pub(crate) fn local_reference(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4().simple())
}
