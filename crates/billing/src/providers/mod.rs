//! Payment rails
//!
//! Each provider is a black box that issues invoices, reports their state in
//! batches and authenticates its own webhooks. A rail with no credentials is
//! simply absent from the registry.

mod cryptobot;
mod yookassa;

pub use cryptobot::{webhook_signature, CryptoBotConfig, CryptoBotProvider, SIGNATURE_HEADER};
pub use yookassa::{YooKassaConfig, YooKassaProvider};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;

use crate::error::{BillingError, BillingResult};
use crate::models::{CompletionPayload, InvoiceMetadata, PaymentMethod};

/// Provider-side state of one invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Pending,
    Completed(CompletionPayload),
    Expired,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInvoice {
    /// Provider's invoice id; becomes the payment's external id.
    pub payment_id: String,
    pub pay_url: String,
}

/// Raw inbound webhook, as received.
#[derive(Debug, Clone, Copy)]
pub struct WebhookRequest<'a> {
    pub headers: &'a HeaderMap,
    /// Shared-secret `token` query parameter, when the rail uses one.
    pub query_token: Option<&'a str>,
    pub body: &'a [u8],
}

/// An authenticated webhook that concerns one of our invoices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub payment_id: String,
    pub status: ProviderStatus,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn method(&self) -> PaymentMethod;

    async fn create_invoice(
        &self,
        amount_minor: i64,
        description: &str,
        metadata: &InvoiceMetadata,
    ) -> BillingResult<CreatedInvoice>;

    /// Current state of each id the provider knows; unknown ids are omitted.
    async fn get_statuses(&self, ids: &[String]) -> BillingResult<HashMap<String, ProviderStatus>>;

    /// `Ok(None)` for authentic events we do not act on; `InvalidWebhook`
    /// for anything unauthentic or malformed.
    async fn verify_webhook(&self, request: &WebhookRequest<'_>) -> BillingResult<Option<WebhookEvent>>;
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<PaymentMethod, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every rail that has credentials in the environment.
    pub fn from_env(timeout: Duration) -> BillingResult<Self> {
        let mut registry = Self::new();
        match YooKassaConfig::from_env() {
            Some(config) => registry.register(Arc::new(YooKassaProvider::new(config, timeout)?)),
            None => tracing::info!("YooKassa not configured"),
        }
        match CryptoBotConfig::from_env() {
            Some(config) => registry.register(Arc::new(CryptoBotProvider::new(config, timeout)?)),
            None => tracing::info!("CryptoBot not configured"),
        }
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) {
        self.providers.insert(provider.method(), provider);
    }

    pub fn get(&self, method: PaymentMethod) -> BillingResult<Arc<dyn PaymentProvider>> {
        self.providers
            .get(&method)
            .cloned()
            .ok_or_else(|| BillingError::ProviderNotConfigured(method.to_string()))
    }

    pub fn methods(&self) -> Vec<PaymentMethod> {
        let mut methods: Vec<_> = self.providers.keys().copied().collect();
        methods.sort_by_key(|m| m.as_str());
        methods
    }
}

/// Parse invoice metadata we attached at checkout. Anything else is ignored.
pub(crate) fn decode_metadata(raw: Option<&str>) -> Option<InvoiceMetadata> {
    let raw = raw?;
    match serde_json::from_str(raw) {
        Ok(meta) => Some(meta),
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring unreadable invoice metadata");
            None
        }
    }
}
