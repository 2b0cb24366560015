//! M-Pesa (Daraja) mobile-money adapter.
//!
//! Collections use STK push, payouts use B2C and refunds use the reversal API.
//! Callbacks are JSON with numeric `ResultCode`s where `0` means success.

use crate::config::{MpesaConfig, ProvidersConfig};
use crate::{
    code_from_json, decimal_from_json, http_client, Acknowledgement, Capabilities,
    CollectionOrder, Initiation, Party, PaymentProvider, ProviderError, ProviderResult,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bigdecimal::BigDecimal;
use chrono::{DateTime, FixedOffset, Utc};
use num_traits::ToPrimitive;
use serde::Deserialize;
use serde_json::{json, Value};
use shared::{CallbackKind, EventOutcome, NormalizedEvent, TransactionKind};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const PROVIDER_NAME: &str = "mpesa";

/// Codes meaning the payer or the switch has not finished yet.
const STILL_PROCESSING: &[&str] = &["500.001.1001", "4999"];

const EAT_OFFSET_SECS: i32 = 3 * 3600;

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

pub struct MpesaProvider {
    config: MpesaConfig,
    client: reqwest::Client,
    collection_callback_url: String,
    payout_result_url: String,
    payout_timeout_url: String,
    reversal_result_url: String,
    reversal_timeout_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl MpesaProvider {
    pub fn new(config: MpesaConfig, providers: &ProvidersConfig) -> ProviderResult<Self> {
        let url = |kind, callback| providers.callback_url(PROVIDER_NAME, kind, callback);
        Ok(Self {
            client: http_client(PROVIDER_NAME, providers.http_timeout)?,
            collection_callback_url: url(TransactionKind::Collection, CallbackKind::Result),
            payout_result_url: url(TransactionKind::Payout, CallbackKind::Result),
            payout_timeout_url: url(TransactionKind::Payout, CallbackKind::Timeout),
            reversal_result_url: url(TransactionKind::Reversal, CallbackKind::Result),
            reversal_timeout_url: url(TransactionKind::Reversal, CallbackKind::Timeout),
            config,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> ProviderResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Utc::now() {
                return Ok(token.value.clone());
            }
        }

        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .get(url)
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await
            .map_err(|e| ProviderError::from_http(PROVIDER_NAME, e))?;

        if !response.status().is_success() {
            return Err(ProviderError::unavailable(
                PROVIDER_NAME,
                format!("token request failed with {}", response.status()),
            ));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(PROVIDER_NAME, e.to_string()))?;
        let ttl = token
            .expires_in
            .as_deref()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(3599);
        // refresh a minute before Daraja expires it
        let expires_at = Utc::now() + chrono::Duration::seconds((ttl - 60).max(0));

        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at,
        });
        Ok(token.access_token)
    }

    fn password(&self, timestamp: &str) -> String {
        STANDARD.encode(format!(
            "{}{}{}",
            self.config.shortcode, self.config.passkey, timestamp
        ))
    }

    async fn post(&self, path: &str, body: &Value) -> ProviderResult<Value> {
        let token = self.access_token().await?;
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::from_http(PROVIDER_NAME, e))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::malformed(PROVIDER_NAME, e.to_string()))?;

        // Daraja reports business errors as 4xx/5xx with an errorCode body
        if status.is_server_error() && payload.get("errorCode").is_none() {
            return Err(ProviderError::unavailable(
                PROVIDER_NAME,
                format!("{} answered {}", path, status),
            ));
        }
        debug!(path, %status, "M-Pesa response received");
        Ok(payload)
    }

    async fn query_collection(&self, checkout_request_id: &str) -> ProviderResult<NormalizedEvent> {
        let timestamp = timestamp();
        let payload = self
            .post(
                "/mpesa/stkpushquery/v1/query",
                &json!({
                    "BusinessShortCode": self.config.shortcode,
                    "Password": self.password(&timestamp),
                    "Timestamp": timestamp,
                    "CheckoutRequestID": checkout_request_id,
                }),
            )
            .await?;

        if let Some(code) = payload.get("ResultCode").and_then(code_from_json) {
            let mut event = NormalizedEvent::new(checkout_request_id, outcome_for(&code));
            if let Some(desc) = payload.get("ResultDesc").and_then(Value::as_str) {
                event = event.with_detail(desc);
            }
            return Ok(event);
        }

        match payload.get("errorCode").and_then(code_from_json) {
            Some(code) if STILL_PROCESSING.contains(&code.as_str()) => Ok(NormalizedEvent::new(
                checkout_request_id,
                EventOutcome::Ambiguous,
            )
            .with_detail("payment still being processed")),
            Some(_) => Err(ProviderError::rejected(PROVIDER_NAME, error_message(&payload))),
            None => Err(ProviderError::malformed(
                PROVIDER_NAME,
                "status query answer carries neither ResultCode nor errorCode",
            )),
        }
    }
}

#[async_trait]
impl PaymentProvider for MpesaProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn capabilities(&self) -> Capabilities {
        let b2c = self.config.b2c.is_some();
        Capabilities {
            collection: true,
            payout: b2c,
            reversal: b2c,
        }
    }

    async fn initiate_collection(
        &self,
        order: &CollectionOrder,
        payer: &Party,
    ) -> ProviderResult<Initiation> {
        let phone = payer
            .contact
            .phone
            .as_deref()
            .ok_or_else(|| ProviderError::rejected(PROVIDER_NAME, "payer has no phone number"))?;
        let phone = msisdn(phone)?;
        let amount = whole_amount(&order.amount)?;
        let timestamp = timestamp();

        let payload = self
            .post(
                "/mpesa/stkpush/v1/processrequest",
                &json!({
                    "BusinessShortCode": self.config.shortcode,
                    "Password": self.password(&timestamp),
                    "Timestamp": timestamp,
                    "TransactionType": "CustomerPayBillOnline",
                    "Amount": amount,
                    "PartyA": phone,
                    "PartyB": self.config.shortcode,
                    "PhoneNumber": phone,
                    "CallBackURL": self.collection_callback_url,
                    "AccountReference": account_reference(order.order_id),
                    "TransactionDesc": truncate(&order.description, 13),
                }),
            )
            .await?;

        let initiation = accepted_initiation(&payload, "CheckoutRequestID", None)?;
        info!(order_id = %order.order_id, checkout_request_id = %initiation.correlation_ref, "STK push sent");
        Ok(initiation)
    }

    async fn initiate_payout(
        &self,
        payee: &Party,
        amount: &BigDecimal,
        memo: &str,
    ) -> ProviderResult<Initiation> {
        let b2c = self
            .config
            .b2c
            .as_ref()
            .ok_or_else(|| ProviderError::unsupported(PROVIDER_NAME, "payout"))?;
        let phone = payee
            .contact
            .phone
            .as_deref()
            .ok_or_else(|| ProviderError::rejected(PROVIDER_NAME, "payee has no phone number"))?;
        let originator_id = Uuid::new_v4().to_string();

        let payload = self
            .post(
                "/mpesa/b2c/v3/paymentrequest",
                &json!({
                    "OriginatorConversationID": originator_id,
                    "InitiatorName": b2c.initiator_name,
                    "SecurityCredential": b2c.security_credential,
                    "CommandID": "BusinessPayment",
                    "Amount": whole_amount(amount)?,
                    "PartyA": b2c.shortcode,
                    "PartyB": msisdn(phone)?,
                    "Remarks": truncate(memo, 100),
                    "QueueTimeOutURL": self.payout_timeout_url,
                    "ResultURL": self.payout_result_url,
                    "Occassion": "",
                }),
            )
            .await?;

        accepted_initiation(&payload, "OriginatorConversationID", Some(originator_id))
    }

    async fn initiate_reversal(
        &self,
        original_provider_tx_id: &str,
        amount: &BigDecimal,
        memo: &str,
    ) -> ProviderResult<Initiation> {
        let b2c = self
            .config
            .b2c
            .as_ref()
            .ok_or_else(|| ProviderError::unsupported(PROVIDER_NAME, "reversal"))?;

        let payload = self
            .post(
                "/mpesa/reversal/v1/request",
                &json!({
                    "Initiator": b2c.initiator_name,
                    "SecurityCredential": b2c.security_credential,
                    "CommandID": "TransactionReversal",
                    "TransactionID": original_provider_tx_id,
                    "Amount": whole_amount(amount)?,
                    "ReceiverParty": self.config.shortcode,
                    "RecieverIdentifierType": "11",
                    "ResultURL": self.reversal_result_url,
                    "QueueTimeOutURL": self.reversal_timeout_url,
                    "Remarks": truncate(memo, 100),
                    "Occasion": "",
                }),
            )
            .await?;

        accepted_initiation(&payload, "OriginatorConversationID", None)
    }

    fn normalize_callback(
        &self,
        kind: TransactionKind,
        callback: CallbackKind,
        body: &[u8],
    ) -> ProviderResult<NormalizedEvent> {
        match (callback, kind) {
            (CallbackKind::Timeout, _) => normalize_timeout(body),
            (CallbackKind::Result, TransactionKind::Collection) => normalize_stk_callback(body),
            (CallbackKind::Result, _) => normalize_result(body),
        }
    }

    async fn query_status(
        &self,
        kind: TransactionKind,
        correlation_ref: &str,
    ) -> ProviderResult<NormalizedEvent> {
        match kind {
            TransactionKind::Collection => self.query_collection(correlation_ref).await,
            // B2C and reversal status queries answer asynchronously on the result URL
            TransactionKind::Payout | TransactionKind::Reversal => Ok(NormalizedEvent::new(
                correlation_ref,
                EventOutcome::Ambiguous,
            )
            .with_detail("awaiting result callback")),
        }
    }

    fn acknowledgement(&self, _kind: TransactionKind) -> Acknowledgement {
        Acknowledgement::json(json!({ "ResultCode": 0, "ResultDesc": "Accepted" }))
    }
}

#[derive(Debug, Deserialize)]
struct StkEnvelope {
    #[serde(rename = "Body")]
    body: StkBody,
}

#[derive(Debug, Deserialize)]
struct StkBody {
    #[serde(rename = "stkCallback")]
    callback: StkCallback,
}

#[derive(Debug, Deserialize)]
struct StkCallback {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResultCode")]
    result_code: Value,
    #[serde(rename = "ResultDesc", default)]
    result_desc: Option<String>,
    #[serde(rename = "CallbackMetadata", default)]
    metadata: Option<StkMetadata>,
}

#[derive(Debug, Deserialize)]
struct StkMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<StkItem>,
}

#[derive(Debug, Deserialize)]
struct StkItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value", default)]
    value: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ResultEnvelope {
    #[serde(rename = "Result")]
    result: ResultBody,
}

#[derive(Debug, Deserialize)]
struct ResultBody {
    #[serde(rename = "ResultCode")]
    result_code: Value,
    #[serde(rename = "ResultDesc", default)]
    result_desc: Option<String>,
    #[serde(rename = "OriginatorConversationID")]
    originator_conversation_id: String,
    #[serde(rename = "TransactionID", default)]
    transaction_id: Option<String>,
    #[serde(rename = "ResultParameters", default)]
    parameters: Option<Value>,
}

pub(crate) fn normalize_stk_callback(body: &[u8]) -> ProviderResult<NormalizedEvent> {
    let envelope: StkEnvelope = serde_json::from_slice(body)
        .map_err(|e| ProviderError::malformed(PROVIDER_NAME, e.to_string()))?;
    let callback = envelope.body.callback;
    let code = code_from_json(&callback.result_code)
        .ok_or_else(|| ProviderError::malformed(PROVIDER_NAME, "ResultCode is not a code"))?;

    let mut event = NormalizedEvent::new(callback.checkout_request_id, outcome_for(&code));
    if let Some(desc) = callback.result_desc {
        event = event.with_detail(desc);
    }
    for item in callback.metadata.map(|m| m.items).unwrap_or_default() {
        let Some(value) = item.value else { continue };
        match item.name.as_str() {
            "Amount" => event.amount = decimal_from_json(&value),
            "MpesaReceiptNumber" => event.provider_tx_id = value.as_str().map(str::to_string),
            _ => {}
        }
    }
    Ok(event)
}

pub(crate) fn normalize_result(body: &[u8]) -> ProviderResult<NormalizedEvent> {
    let envelope: ResultEnvelope = serde_json::from_slice(body)
        .map_err(|e| ProviderError::malformed(PROVIDER_NAME, e.to_string()))?;
    let result = envelope.result;
    let code = code_from_json(&result.result_code)
        .ok_or_else(|| ProviderError::malformed(PROVIDER_NAME, "ResultCode is not a code"))?;

    let mut event = NormalizedEvent::new(result.originator_conversation_id, outcome_for(&code));
    event.provider_tx_id = result.transaction_id.filter(|id| !id.is_empty());
    event.detail = result.result_desc;

    // a single parameter arrives as an object instead of a one-element array
    let parameters = result
        .parameters
        .as_ref()
        .and_then(|p| p.get("ResultParameter"))
        .map(|p| match p {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        })
        .unwrap_or_default();
    for parameter in parameters {
        let key = parameter.get("Key").and_then(Value::as_str);
        if matches!(key, Some("TransactionAmount") | Some("Amount")) {
            event.amount = parameter.get("Value").and_then(decimal_from_json);
        }
    }
    Ok(event)
}

pub(crate) fn normalize_timeout(body: &[u8]) -> ProviderResult<NormalizedEvent> {
    let payload: Value = serde_json::from_slice(body)
        .map_err(|e| ProviderError::malformed(PROVIDER_NAME, e.to_string()))?;
    let reference = ["OriginatorConversationID", "CheckoutRequestID"]
        .iter()
        .find_map(|key| find_string(&payload, key))
        .ok_or_else(|| {
            ProviderError::malformed(PROVIDER_NAME, "timeout notice carries no correlation reference")
        })?;
    Ok(NormalizedEvent::new(reference, EventOutcome::Ambiguous).with_detail("queue timeout"))
}

fn outcome_for(code: &str) -> EventOutcome {
    if code == "0" {
        EventOutcome::Success
    } else if STILL_PROCESSING.contains(&code) {
        EventOutcome::Ambiguous
    } else {
        EventOutcome::Failure
    }
}

fn accepted_initiation(
    payload: &Value,
    reference_key: &str,
    fallback: Option<String>,
) -> ProviderResult<Initiation> {
    let code = payload.get("ResponseCode").and_then(code_from_json);
    if code.as_deref() != Some("0") {
        return Err(ProviderError::rejected(PROVIDER_NAME, error_message(payload)));
    }
    payload
        .get(reference_key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(fallback)
        .map(Initiation::accepted)
        .ok_or_else(|| {
            ProviderError::malformed(PROVIDER_NAME, format!("response is missing {}", reference_key))
        })
}

fn error_message(payload: &Value) -> String {
    ["errorMessage", "ResponseDescription", "ResultDesc"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .unwrap_or("request declined")
        .to_string()
}

fn find_string(value: &Value, key: &str) -> Option<String> {
    match value {
        Value::Object(map) => map
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| map.values().find_map(|v| find_string(v, key))),
        Value::Array(items) => items.iter().find_map(|v| find_string(v, key)),
        _ => None,
    }
}

/// Daraja only accepts `2547XXXXXXXX`-style numbers.
pub(crate) fn msisdn(phone: &str) -> ProviderResult<String> {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    let normalized = if let Some(rest) = digits.strip_prefix('0') {
        format!("254{}", rest)
    } else if digits.len() == 9 {
        format!("254{}", digits)
    } else {
        digits
    };

    if normalized.len() == 12 && normalized.starts_with("254") {
        Ok(normalized)
    } else {
        Err(ProviderError::rejected(
            PROVIDER_NAME,
            format!("'{}' is not a valid mobile number", phone),
        ))
    }
}

fn whole_amount(amount: &BigDecimal) -> ProviderResult<u64> {
    if !amount.is_integer() {
        return Err(ProviderError::rejected(
            PROVIDER_NAME,
            format!("M-Pesa only moves whole amounts, got {}", amount),
        ));
    }
    amount
        .to_u64()
        .filter(|value| *value > 0)
        .ok_or_else(|| ProviderError::rejected(PROVIDER_NAME, format!("invalid amount {}", amount)))
}

fn timestamp() -> String {
    let now = Utc::now();
    match FixedOffset::east_opt(EAT_OFFSET_SECS) {
        Some(eat) => now.with_timezone(&eat).format("%Y%m%d%H%M%S").to_string(),
        None => now.format("%Y%m%d%H%M%S").to_string(),
    }
}

fn account_reference(order_id: Uuid) -> String {
    order_id.simple().to_string()[..12].to_uppercase()
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
