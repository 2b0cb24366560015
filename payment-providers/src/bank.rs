//! Bank transfer adapter.
//!
//! The bank confirms collections with a form-POST carrying a two-digit status code.
//! Payouts and reversals are settled manually by the bank desk, so this adapter only
//! collects.

use crate::config::{BankConfig, ProvidersConfig};
use crate::{
    decimal_from_json, http_client, local_reference, Acknowledgement, Capabilities,
    CollectionOrder, Initiation, Party, PaymentProvider, ProviderError, ProviderResult,
};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde::Deserialize;
use serde_json::{json, Value};
use shared::{CallbackKind, EventOutcome, NormalizedEvent, TransactionKind};
use std::str::FromStr;
use tracing::info;

pub const PROVIDER_NAME: &str = "bank";

pub struct BankTransferProvider {
    config: BankConfig,
    client: reqwest::Client,
    callback_url: String,
}

#[derive(Debug, Deserialize)]
struct CollectionResponse {
    reference: String,
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackForm {
    reference: String,
    status: String,
    #[serde(default)]
    amount: Option<String>,
    #[serde(default)]
    bank_ref: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl BankTransferProvider {
    pub fn new(config: BankConfig, providers: &ProvidersConfig) -> ProviderResult<Self> {
        Ok(Self {
            client: http_client(PROVIDER_NAME, providers.http_timeout)?,
            callback_url: providers.callback_url(
                PROVIDER_NAME,
                TransactionKind::Collection,
                CallbackKind::Result,
            ),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl PaymentProvider for BankTransferProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::collection_only()
    }

    async fn initiate_collection(
        &self,
        order: &CollectionOrder,
        payer: &Party,
    ) -> ProviderResult<Initiation> {
        let reference = local_reference("BNK");
        let response = self
            .client
            .post(self.url("/v1/collections"))
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "merchant_id": self.config.merchant_id,
                "reference": reference,
                "amount": order.amount.to_string(),
                "currency": order.currency,
                "narration": order.description,
                "payer": {
                    "email": payer.contact.email,
                    "phone": payer.contact.phone,
                },
                "callback_url": self.callback_url,
            }))
            .send()
            .await
            .map_err(|e| ProviderError::from_http(PROVIDER_NAME, e))?;

        if response.status().is_server_error() {
            return Err(ProviderError::unavailable(
                PROVIDER_NAME,
                format!("collection request answered {}", response.status()),
            ));
        }

        let body: CollectionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(PROVIDER_NAME, e.to_string()))?;

        if body.status.eq_ignore_ascii_case("ACCEPTED") {
            info!(order_id = %order.order_id, reference = %body.reference, "bank collection accepted");
            Ok(Initiation::accepted(body.reference))
        } else {
            Ok(Initiation::declined(
                body.reference,
                body.message.unwrap_or(body.status),
            ))
        }
    }

    /// The form post is unsigned; the outcome is read back from the status endpoint.
    fn trusts_callbacks(&self) -> bool {
        false
    }

    fn normalize_callback(
        &self,
        _kind: TransactionKind,
        callback: CallbackKind,
        body: &[u8],
    ) -> ProviderResult<NormalizedEvent> {
        let form: CallbackForm = serde_urlencoded::from_bytes(body)
            .map_err(|e| ProviderError::malformed(PROVIDER_NAME, e.to_string()))?;
        let outcome = match callback {
            CallbackKind::Timeout => EventOutcome::Ambiguous,
            CallbackKind::Result => outcome_for(&form.status),
        };

        let mut event = NormalizedEvent::new(form.reference, outcome);
        event.amount = form
            .amount
            .as_deref()
            .and_then(|a| BigDecimal::from_str(a.trim()).ok());
        event.provider_tx_id = form.bank_ref.filter(|r| !r.is_empty());
        event.detail = form.message;
        Ok(event)
    }

    async fn query_status(
        &self,
        _kind: TransactionKind,
        correlation_ref: &str,
    ) -> ProviderResult<NormalizedEvent> {
        let response = self
            .client
            .get(self.url(&format!("/v1/collections/{}", correlation_ref)))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::from_http(PROVIDER_NAME, e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(NormalizedEvent::new(correlation_ref, EventOutcome::Failure)
                .with_detail("bank has no record of the collection"));
        }
        if !response.status().is_success() {
            return Err(ProviderError::unavailable(
                PROVIDER_NAME,
                format!("status query answered {}", response.status()),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(PROVIDER_NAME, e.to_string()))?;
        let status = body
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::malformed(PROVIDER_NAME, "status query lacks status"))?;

        let mut event = NormalizedEvent::new(correlation_ref, outcome_for(status));
        event.amount = body.get("amount").and_then(decimal_from_json);
        event.provider_tx_id = body
            .get("bank_ref")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(event)
    }

    fn acknowledgement(&self, _kind: TransactionKind) -> Acknowledgement {
        Acknowledgement::text("OK")
    }
}

fn outcome_for(status: &str) -> EventOutcome {
    match status.trim() {
        "00" => EventOutcome::Success,
        "09" => EventOutcome::Ambiguous,
        _ => EventOutcome::Failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BankConfig;
    use std::time::Duration;

    fn provider() -> BankTransferProvider {
        let providers = ProvidersConfig {
            callback_base_url: "https://escrow.test".to_string(),
            http_timeout: Duration::from_secs(5),
            mpesa: None,
            bank: None,
            card: None,
        };
        let config = BankConfig {
            base_url: "https://bank.test".to_string(),
            api_key: "key".to_string(),
            merchant_id: "M-1".to_string(),
        };
        BankTransferProvider::new(config, &providers).unwrap()
    }

    #[test]
    fn form_post_success_is_normalized() {
        let body = b"reference=BNK-42&status=00&amount=1000.00&bank_ref=FT2301&message=Approved";
        let event = provider()
            .normalize_callback(TransactionKind::Collection, CallbackKind::Result, body)
            .unwrap();
        assert_eq!(event.correlation_ref, "BNK-42");
        assert_eq!(event.outcome, EventOutcome::Success);
        assert_eq!(event.amount, Some(BigDecimal::from(1000)));
        assert_eq!(event.provider_tx_id.as_deref(), Some("FT2301"));
    }

    #[test]
    fn pending_and_declined_codes() {
        assert_eq!(outcome_for("09"), EventOutcome::Ambiguous);
        assert_eq!(outcome_for("51"), EventOutcome::Failure);
    }

    #[test]
    fn bank_cannot_pay_out() {
        assert!(!provider().capabilities().payout);
        assert!(!provider().trusts_callbacks());
        assert!(provider().acknowledgement(TransactionKind::Collection).body == "OK");
    }
}
