//! Card gateway adapter (hosted checkout).
//!
//! The payer is redirected to the gateway's checkout page; the outcome arrives as a
//! JSON webhook with a string status and can be re-checked by transaction reference.

use crate::config::{CardConfig, ProvidersConfig};
use crate::{
    decimal_from_json, http_client, local_reference, Acknowledgement, Capabilities,
    CollectionOrder, Initiation, Party, PaymentProvider, ProviderError, ProviderResult,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use shared::{CallbackKind, EventOutcome, NormalizedEvent, TransactionKind};
use tracing::info;

pub const PROVIDER_NAME: &str = "card";

pub struct CardGatewayProvider {
    config: CardConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GatewayEnvelope {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Webhook {
    #[serde(default)]
    event: Option<String>,
    data: ChargeData,
}

#[derive(Debug, Deserialize)]
struct ChargeData {
    #[serde(default)]
    id: Option<Value>,
    tx_ref: String,
    #[serde(default)]
    amount: Option<Value>,
    status: String,
}

impl CardGatewayProvider {
    pub fn new(config: CardConfig, providers: &ProvidersConfig) -> ProviderResult<Self> {
        Ok(Self {
            client: http_client(PROVIDER_NAME, providers.http_timeout)?,
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl PaymentProvider for CardGatewayProvider {
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
        let email = payer
            .contact
            .email
            .as_deref()
            .ok_or_else(|| ProviderError::rejected(PROVIDER_NAME, "payer has no email address"))?;
        let tx_ref = local_reference("CARD");

        let response = self
            .client
            .post(self.url("/v3/payments"))
            .bearer_auth(&self.config.secret_key)
            .json(&json!({
                "tx_ref": tx_ref,
                "amount": order.amount.to_string(),
                "currency": order.currency,
                "redirect_url": self.config.redirect_url,
                "customer": {
                    "email": email,
                    "phonenumber": payer.contact.phone,
                },
                "customizations": { "title": order.description },
            }))
            .send()
            .await
            .map_err(|e| ProviderError::from_http(PROVIDER_NAME, e))?;

        if response.status().is_server_error() {
            return Err(ProviderError::unavailable(
                PROVIDER_NAME,
                format!("checkout request answered {}", response.status()),
            ));
        }

        let envelope: GatewayEnvelope = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(PROVIDER_NAME, e.to_string()))?;

        if envelope.status != "success" {
            return Ok(Initiation::declined(
                tx_ref,
                envelope.message.unwrap_or_else(|| "checkout declined".to_string()),
            ));
        }

        let link = envelope
            .data
            .as_ref()
            .and_then(|d| d.get("link"))
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::malformed(PROVIDER_NAME, "checkout response has no link"))?;

        info!(order_id = %order.order_id, tx_ref = %tx_ref, "card checkout created");
        let mut initiation = Initiation::accepted(tx_ref);
        initiation.redirect_url = Some(link.to_string());
        Ok(initiation)
    }

    /// Webhooks carry no verified signature and the buyer knows the `tx_ref`, so the
    /// outcome is always read back through verify.
    fn trusts_callbacks(&self) -> bool {
        false
    }

    fn normalize_callback(
        &self,
        _kind: TransactionKind,
        callback: CallbackKind,
        body: &[u8],
    ) -> ProviderResult<NormalizedEvent> {
        let webhook: Webhook = serde_json::from_slice(body)
            .map_err(|e| ProviderError::malformed(PROVIDER_NAME, e.to_string()))?;
        let outcome = match callback {
            CallbackKind::Timeout => EventOutcome::Ambiguous,
            CallbackKind::Result => outcome_for(&webhook.data.status),
        };
        Ok(charge_event(webhook.data, outcome, webhook.event))
    }

    async fn query_status(
        &self,
        _kind: TransactionKind,
        correlation_ref: &str,
    ) -> ProviderResult<NormalizedEvent> {
        let response = self
            .client
            .get(self.url("/v3/transactions/verify_by_reference"))
            .query(&[("tx_ref", correlation_ref)])
            .bearer_auth(&self.config.secret_key)
            .send()
            .await
            .map_err(|e| ProviderError::from_http(PROVIDER_NAME, e))?;

        if response.status().is_server_error() {
            return Err(ProviderError::unavailable(
                PROVIDER_NAME,
                format!("verify answered {}", response.status()),
            ));
        }

        let envelope: GatewayEnvelope = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(PROVIDER_NAME, e.to_string()))?;

        match envelope.data {
            Some(data) if envelope.status == "success" => {
                let charge: ChargeData = serde_json::from_value(data)
                    .map_err(|e| ProviderError::malformed(PROVIDER_NAME, e.to_string()))?;
                let outcome = outcome_for(&charge.status);
                Ok(charge_event(charge, outcome, None))
            }
            // the payer never completed checkout, so no money moved
            _ => Ok(NormalizedEvent::new(correlation_ref, EventOutcome::Failure).with_detail(
                envelope
                    .message
                    .unwrap_or_else(|| "no transaction found".to_string()),
            )),
        }
    }

    fn acknowledgement(&self, _kind: TransactionKind) -> Acknowledgement {
        Acknowledgement::json(json!({ "status": "received" }))
    }
}

fn charge_event(charge: ChargeData, outcome: EventOutcome, event: Option<String>) -> NormalizedEvent {
    let mut normalized = NormalizedEvent::new(charge.tx_ref, outcome);
    normalized.amount = charge.amount.as_ref().and_then(decimal_from_json);
    normalized.provider_tx_id = charge.id.as_ref().and_then(|id| match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    normalized.detail = event.or(Some(charge.status));
    normalized
}

fn outcome_for(status: &str) -> EventOutcome {
    match status.to_ascii_lowercase().as_str() {
        "successful" | "success" | "completed" => EventOutcome::Success,
        "failed" | "cancelled" | "error" => EventOutcome::Failure,
        _ => EventOutcome::Ambiguous,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use std::time::Duration;

    fn provider() -> CardGatewayProvider {
        let providers = ProvidersConfig {
            callback_base_url: "https://escrow.test".to_string(),
            http_timeout: Duration::from_secs(5),
            mpesa: None,
            bank: None,
            card: None,
        };
        let config = CardConfig {
            base_url: "https://cards.test".to_string(),
            secret_key: "sk_test".to_string(),
            redirect_url: "https://shop.test/paid".to_string(),
        };
        CardGatewayProvider::new(config, &providers).unwrap()
    }

    #[test]
    fn charge_completed_webhook() {
        let body = json!({
            "event": "charge.completed",
            "data": {
                "id": 285959875,
                "tx_ref": "CARD-abc",
                "amount": 1000,
                "currency": "KES",
                "status": "successful"
            }
        });

        let event = provider()
            .normalize_callback(
                TransactionKind::Collection,
                CallbackKind::Result,
                body.to_string().as_bytes(),
            )
            .unwrap();
        assert_eq!(event.correlation_ref, "CARD-abc");
        assert_eq!(event.outcome, EventOutcome::Success);
        assert_eq!(event.provider_tx_id.as_deref(), Some("285959875"));
        assert_eq!(event.amount, Some(BigDecimal::from(1000)));
    }

    #[test]
    fn webhooks_are_confirmed_by_verify() {
        assert!(!provider().trusts_callbacks());
    }

    #[test]
    fn unknown_status_is_ambiguous() {
        assert_eq!(outcome_for("pending"), EventOutcome::Ambiguous);
        assert_eq!(outcome_for("FAILED"), EventOutcome::Failure);
    }
}
