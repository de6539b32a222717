//! Shared harness: in-memory ledger, in-memory panel, a scripted payment
//! rail and a notifier that records what it was asked to send.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tunnelshop_billing::providers::CreatedInvoice;
use tunnelshop_billing::{
    BillingConfig, BillingError, BillingResult, BillingService, CompletionPayload, Host, InMemoryPanel, InvoiceMetadata,
    LocalHostLocks, MemoryLedgerStore, NewHost, NewPlan, Notice, Notifier, PaymentMethod, PaymentProvider, Plan,
    ProviderRegistry, ProviderStatus, RetryPolicy, UserId, WebhookEvent, WebhookRequest,
};

pub const HOST: &str = "nl-1";

/// Provider double whose invoice states are set by the test.
pub struct ScriptedProvider {
    method: PaymentMethod,
    next_id: AtomicU64,
    invoices: Mutex<HashMap<String, (i64, InvoiceMetadata, ProviderStatus)>>,
    pub status_queries: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(method: PaymentMethod) -> Self {
        Self {
            method,
            next_id: AtomicU64::new(1),
            invoices: Mutex::new(HashMap::new()),
            status_queries: AtomicUsize::new(0),
        }
    }

    /// Mark the invoice paid in full.
    pub fn pay(&self, id: &str) {
        let mut invoices = self.invoices.lock().unwrap();
        let (amount, metadata, status) = invoices.get_mut(id).unwrap();
        *status = ProviderStatus::Completed(CompletionPayload {
            paid_amount_minor: Some(*amount),
            metadata: Some(metadata.clone()),
        });
    }

    pub fn set_status(&self, id: &str, new: ProviderStatus) {
        let mut invoices = self.invoices.lock().unwrap();
        invoices.get_mut(id).unwrap().2 = new;
    }

    pub fn status(&self, id: &str) -> ProviderStatus {
        self.invoices.lock().unwrap().get(id).unwrap().2.clone()
    }
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    fn method(&self) -> PaymentMethod {
        self.method
    }

    async fn create_invoice(
        &self,
        amount_minor: i64,
        _description: &str,
        metadata: &InvoiceMetadata,
    ) -> BillingResult<CreatedInvoice> {
        let id = format!("{}-{}", self.method, self.next_id.fetch_add(1, Ordering::SeqCst));
        self.invoices
            .lock()
            .unwrap()
            .insert(id.clone(), (amount_minor, metadata.clone(), ProviderStatus::Pending));
        Ok(CreatedInvoice {
            pay_url: format!("https://pay.example/{id}"),
            payment_id: id,
        })
    }

    async fn get_statuses(&self, ids: &[String]) -> BillingResult<HashMap<String, ProviderStatus>> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        let invoices = self.invoices.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| invoices.get(id).map(|(_, _, status)| (id.clone(), status.clone())))
            .collect())
    }

    /// Body is the bare invoice id; authentication is covered by the real
    /// providers' unit tests.
    async fn verify_webhook(&self, request: &WebhookRequest<'_>) -> BillingResult<Option<WebhookEvent>> {
        let id = std::str::from_utf8(request.body)
            .map_err(|_| BillingError::InvalidWebhook("not utf-8".into()))?
            .trim()
            .to_string();
        let status = self
            .invoices
            .lock()
            .unwrap()
            .get(&id)
            .map(|(_, _, status)| status.clone())
            .ok_or_else(|| BillingError::InvalidWebhook(format!("unknown invoice {id}")))?;
        Ok(Some(WebhookEvent { payment_id: id, status }))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub user: Mutex<Vec<(UserId, Notice)>>,
    pub operator: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn user_notices(&self, user_id: UserId) -> Vec<Notice> {
        self.user
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == user_id)
            .map(|(_, n)| n.clone())
            .collect()
    }

    pub fn operator_notices(&self) -> Vec<Notice> {
        self.operator.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_user(&self, user_id: UserId, notice: &Notice) {
        self.user.lock().unwrap().push((user_id, notice.clone()));
    }

    async fn notify_operator(&self, notice: &Notice) {
        self.operator.lock().unwrap().push(notice.clone());
    }
}

pub struct Harness {
    pub service: BillingService,
    pub store: Arc<MemoryLedgerStore>,
    pub panel: Arc<InMemoryPanel>,
    pub notifier: Arc<RecordingNotifier>,
    pub yookassa: Arc<ScriptedProvider>,
    pub cryptobot: Arc<ScriptedProvider>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(BillingConfig::default(), InMemoryPanel::new()).await
    }

    pub async fn with(config: BillingConfig, panel: InMemoryPanel) -> Self {
        let store = Arc::new(MemoryLedgerStore::new());
        let panel = Arc::new(panel);
        let notifier = Arc::new(RecordingNotifier::default());
        let yookassa = Arc::new(ScriptedProvider::new(PaymentMethod::YooKassa));
        let cryptobot = Arc::new(ScriptedProvider::new(PaymentMethod::CryptoBot));

        let mut providers = ProviderRegistry::new();
        providers.register(yookassa.clone());
        providers.register(cryptobot.clone());

        let service = BillingService::new(
            config,
            store.clone(),
            panel.clone(),
            Arc::new(LocalHostLocks::new()),
            notifier.clone(),
            providers,
            RetryPolicy::immediate(3),
        );

        let harness = Self {
            service,
            store,
            panel,
            notifier,
            yookassa,
            cryptobot,
        };
        harness.add_host(HOST, 443).await;
        harness
    }

    pub async fn add_host(&self, name: &str, port: u16) -> Host {
        self.panel.add_host(name, port).unwrap();
        self.service
            .checkout
            .create_host(&NewHost {
                name: name.to_string(),
                base_url: format!("https://{name}.example.com:2053"),
                username: "admin".into(),
                password: "secret".into(),
                inbound_id: 1,
            })
            .await
            .unwrap()
    }

    pub async fn add_plan(&self, host: &str, months: i32, price_minor: i64) -> Plan {
        self.service
            .checkout
            .create_plan(&NewPlan {
                host_name: host.to_string(),
                name: format!("{months} mo"),
                months,
                price_minor,
            })
            .await
            .unwrap()
    }

    pub fn provider(&self, method: PaymentMethod) -> &ScriptedProvider {
        match method {
            PaymentMethod::CryptoBot => &self.cryptobot,
            _ => &self.yookassa,
        }
    }
}
