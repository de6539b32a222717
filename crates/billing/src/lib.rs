// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider and panel detail strings
#![allow(clippy::too_many_arguments)] // Fulfillment wiring passes each collaborator explicitly
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tunnelshop billing engine
//!
//! Turns provider payment completions into provisioned VPN credentials,
//! exactly once per payment.
//!
//! ## Flow
//!
//! - **Checkout**: issue a provider invoice carrying typed metadata and
//!   record a `pending` payment
//! - **Intake**: webhooks, the poll loop and manual checks report completions
//! - **Guard**: an atomic `pending → claimed` transition elects one processor
//! - **Orchestrator**: writes the panel client under a per-host lease, then
//!   commits every ledger effect in one store transaction
//! - **Recovery**: stale claims left by crashed workers are resumed

pub mod actions;
pub mod adapter;
pub mod checkout;
pub mod config;
pub mod error;
pub mod expiry;
pub mod guard;
pub mod host_lock;
pub mod intake;
pub mod invariants;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod panel;
pub mod providers;
pub mod recovery;
pub mod referral;

// Actions
pub use actions::CallbackAction;

// Adapter
pub use adapter::{CredentialStoreAdapter, IntentJournal, ProvisionedKey, RetryPolicy};

// Checkout
pub use checkout::{ActionReply, Checkout, CheckoutRequest, CheckoutService, CredentialStatus, UserProfile};

// Config
pub use config::BillingConfig;

// Error
pub use error::{BillingError, BillingResult};

// Guard
pub use guard::IdempotencyGuard;

// Host locks
pub use host_lock::{HostLease, HostWriteLock, LocalHostLocks, PgHostLocks};

// Intake
pub use intake::{CompletionIntake, ManualCheck, Observation, PollSummary};

// Invariants
pub use invariants::{InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity};

// Ledger
pub use ledger::{ClaimOutcome, ClaimedPayment, LedgerStats, LedgerStore, MemoryLedgerStore, PgLedgerStore};

// Models
pub use models::{
    CompletionPayload, Credential, Host, InvoiceMetadata, NewHost, NewPlan, Payment, PaymentMethod, PaymentState,
    Plan, PurchaseIntent, User, UserId,
};

// Notifications
pub use notify::{LogNotifier, Notice, Notifier, TelegramNotifier};

// Orchestrator
pub use orchestrator::{FulfillOutcome, Fulfillment, ProvisioningOrchestrator};

// Panel
pub use panel::{InMemoryPanel, PanelClient, XuiPanelClient};

// Providers
pub use providers::{PaymentProvider, ProviderRegistry, ProviderStatus, WebhookEvent, WebhookRequest};

// Recovery
pub use recovery::{RecoverySweep, SweepSummary};

// Referral
pub use referral::ReferralPolicy;

use std::sync::Arc;

use sqlx::PgPool;

/// The engine, wired.
#[derive(Clone)]
pub struct BillingService {
    pub config: BillingConfig,
    pub store: Arc<dyn LedgerStore>,
    pub orchestrator: Arc<ProvisioningOrchestrator>,
    pub intake: CompletionIntake,
    pub checkout: CheckoutService,
    pub recovery: RecoverySweep,
}

impl BillingService {
    /// Postgres ledger, Postgres advisory host locks, 3x-ui panels, and
    /// whichever rails and bot are configured in the environment.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env();
        let store: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(pool.clone()));
        let panel: Arc<dyn PanelClient> = Arc::new(XuiPanelClient::new(config.remote_timeout)?);
        let locks: Arc<dyn HostWriteLock> = Arc::new(PgHostLocks::new(pool));
        let notifier: Arc<dyn Notifier> = match config::env_opt("TELEGRAM_BOT_TOKEN") {
            Some(token) => Arc::new(TelegramNotifier::new(token, config.admin_chat_id, config.remote_timeout)?),
            None => {
                tracing::warn!("TELEGRAM_BOT_TOKEN not set, notifications go to the log");
                Arc::new(LogNotifier)
            }
        };
        let providers = ProviderRegistry::from_env(config.remote_timeout)?;

        Ok(Self::new(config, store, panel, locks, notifier, providers, RetryPolicy::default()))
    }

    /// Create a billing service with explicit collaborators
    pub fn new(
        config: BillingConfig,
        store: Arc<dyn LedgerStore>,
        panel: Arc<dyn PanelClient>,
        locks: Arc<dyn HostWriteLock>,
        notifier: Arc<dyn Notifier>,
        providers: ProviderRegistry,
        retry: RetryPolicy,
    ) -> Self {
        let adapter = Arc::new(CredentialStoreAdapter::new(panel, locks, retry));
        let orchestrator = Arc::new(ProvisioningOrchestrator::new(
            store.clone(),
            adapter.clone(),
            notifier,
            ReferralPolicy::from_config(&config),
            config.max_fulfill_attempts,
        ));
        let intake = CompletionIntake::new(
            store.clone(),
            orchestrator.clone(),
            providers,
            config.poll_batch_size,
        );
        let checkout = CheckoutService::new(store.clone(), intake.clone(), adapter, &config);
        let recovery = RecoverySweep::new(
            store.clone(),
            orchestrator.clone(),
            config.claim_timeout,
            config.poll_batch_size,
        );

        Self {
            config,
            store,
            orchestrator,
            intake,
            checkout,
            recovery,
        }
    }
}
