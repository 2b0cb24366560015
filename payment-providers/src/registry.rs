use crate::bank::BankTransferProvider;
use crate::card::CardGatewayProvider;
use crate::mpesa::MpesaProvider;
use crate::{PaymentProvider, ProviderResult, ProvidersConfig};
use shared::{PaymentMethod, TransactionKind};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Adapter lookup keyed by the order's payment method.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    by_method: HashMap<PaymentMethod, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one adapter per configured provider; unconfigured methods stay absent.
    pub fn from_config(config: &ProvidersConfig) -> ProviderResult<Self> {
        let mut registry = Self::new();

        if let Some(mpesa) = &config.mpesa {
            registry.register(
                PaymentMethod::Mpesa,
                Arc::new(MpesaProvider::new(mpesa.clone(), config)?),
            );
        }
        if let Some(bank) = &config.bank {
            registry.register(
                PaymentMethod::BankTransfer,
                Arc::new(BankTransferProvider::new(bank.clone(), config)?),
            );
        }
        if let Some(card) = &config.card {
            registry.register(
                PaymentMethod::Card,
                Arc::new(CardGatewayProvider::new(card.clone(), config)?),
            );
        }

        Ok(registry)
    }

    pub fn register(&mut self, method: PaymentMethod, provider: Arc<dyn PaymentProvider>) {
        let caps = provider.capabilities();
        info!(
            method = %method,
            provider = provider.name(),
            payout = caps.payout,
            reversal = caps.reversal,
            "payment provider registered"
        );
        self.by_method.insert(method, provider);
    }

    pub fn for_method(&self, method: PaymentMethod) -> Option<Arc<dyn PaymentProvider>> {
        self.by_method.get(&method).cloned()
    }

    /// The adapter for `method`, only if it is configured for `kind`.
    pub fn capable(
        &self,
        method: PaymentMethod,
        kind: TransactionKind,
    ) -> Option<Arc<dyn PaymentProvider>> {
        self.for_method(method)
            .filter(|provider| provider.capabilities().supports(kind))
    }

    /// Looks an adapter up by the provider name persisted on transactions.
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn PaymentProvider>> {
        self.by_method
            .values()
            .find(|provider| provider.name() == name)
            .cloned()
    }

    pub fn methods(&self) -> Vec<PaymentMethod> {
        self.by_method.keys().copied().collect()
    }
}
