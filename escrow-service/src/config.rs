use bigdecimal::BigDecimal;
use shared::Contact;
use std::time::Duration;

/// Policy knobs for the escrow engine, built once at start-up.
#[derive(Debug, Clone)]
pub struct EscrowConfig {
    /// Largest shortfall a collection may have and still mark the order paid.
    /// `None` accepts any shortfall and only records it.
    pub underpayment_tolerance: Option<BigDecimal>,
    pub default_currency: String,
    /// How long a transaction may wait for its callback before the sweeper asks the
    /// provider directly.
    pub callback_timeout: Duration,
    /// Shipped or delivered orders nobody acted on are completed after this long.
    /// `None` disables auto-release.
    pub auto_release_after: Option<Duration>,
    pub sweep_interval: Duration,
    /// Attempts for one reconciliation step when a concurrent writer moved the order.
    pub max_step_attempts: u32,
    pub sweep_batch_size: i64,
    /// Receives payments that need settling by hand.
    pub ops_contact: Contact,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            underpayment_tolerance: None,
            default_currency: "KES".to_string(),
            callback_timeout: Duration::from_secs(120),
            auto_release_after: Some(Duration::from_secs(14 * 24 * 60 * 60)),
            sweep_interval: Duration::from_secs(30),
            max_step_attempts: 3,
            sweep_batch_size: 100,
            ops_contact: Contact::default(),
        }
    }
}

impl EscrowConfig {
    /// Whether a collection short by `shortfall` may still mark the order paid.
    pub fn accepts_shortfall(&self, shortfall: &BigDecimal) -> bool {
        match &self.underpayment_tolerance {
            None => true,
            Some(tolerance) => shortfall <= tolerance,
        }
    }
}
