use shared::{CallbackKind, TransactionKind};
use std::time::Duration;

/// Credentials and endpoints for every provider, built once at start-up.
#[derive(Debug, Clone)]
pub struct ProvidersConfig {
    /// Public base URL providers call back on, e.g. `https://escrow.example.com`.
    pub callback_base_url: String,
    pub http_timeout: Duration,
    pub mpesa: Option<MpesaConfig>,
    pub bank: Option<BankConfig>,
    pub card: Option<CardConfig>,
}

impl ProvidersConfig {
    pub fn callback_url(&self, provider: &str, kind: TransactionKind, callback: CallbackKind) -> String {
        format!(
            "{}/webhooks/{}/{}/{}",
            self.callback_base_url.trim_end_matches('/'),
            provider,
            kind,
            callback
        )
    }
}

#[derive(Debug, Clone)]
pub struct MpesaConfig {
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    /// Without B2C initiator credentials the adapter can only collect.
    pub b2c: Option<MpesaB2cConfig>,
}

#[derive(Debug, Clone)]
pub struct MpesaB2cConfig {
    pub initiator_name: String,
    pub security_credential: String,
    pub shortcode: String,
}

#[derive(Debug, Clone)]
pub struct BankConfig {
    pub base_url: String,
    pub api_key: String,
    pub merchant_id: String,
}

#[derive(Debug, Clone)]
pub struct CardConfig {
    pub base_url: String,
    pub secret_key: String,
    pub redirect_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_urls_are_per_provider_and_purpose() {
        let config = ProvidersConfig {
            callback_base_url: "https://escrow.example.com/".to_string(),
            http_timeout: Duration::from_secs(10),
            mpesa: None,
            bank: None,
            card: None,
        };
        assert_eq!(
            config.callback_url("mpesa", TransactionKind::Payout, CallbackKind::Timeout),
            "https://escrow.example.com/webhooks/mpesa/payout/timeout"
        );
    }
}
