//! Payment ledger storage
//!
//! The ledger is the only mutual-exclusion authority for payment processing:
//! the claim transition and the fulfillment commit are each atomic in the
//! store, whichever process or intake path performs them.

mod memory;
mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    Credential, Host, NewHost, NewPayment, NewPlan, Payment, PaymentMethod, PaymentState, Plan,
    ProvisionCheckpoint, ReferralCredit, Transaction, User, UserId,
};

/// Result of an attempt to take processing rights for a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the payment and must fulfill or release it.
    Won(ClaimedPayment),
    AlreadyClaimed,
    AlreadyFulfilled,
    /// `failed` or `expired`; only an operator moves it on.
    Terminal(PaymentState),
}

/// A payment together with the token proving the current claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedPayment {
    pub payment: Payment,
    pub token: Uuid,
}

/// Referral reward to credit inside the fulfillment commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferralAward {
    pub referrer_id: UserId,
    pub amount_minor: i64,
}

/// Everything written by the fulfillment commit.
#[derive(Debug, Clone)]
pub struct FulfillmentRecord {
    pub external_id: String,
    pub claim_token: Uuid,
    pub user_id: UserId,
    pub username: String,
    pub host_name: String,
    pub label: String,
    pub remote_id: String,
    pub expires_at: OffsetDateTime,
    pub amount_minor: i64,
    pub months: i32,
    pub is_trial: bool,
    pub method: PaymentMethod,
    pub metadata: serde_json::Value,
    pub referral: Option<ReferralAward>,
}

/// What the fulfillment commit changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub credential: Credential,
    /// False when the credential row already existed (renewal).
    pub credential_created: bool,
    pub referral_credited: bool,
}

/// Operator totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub users: i64,
    pub banned_users: i64,
    pub credentials: i64,
    pub active_credentials: i64,
    pub transactions: i64,
    pub revenue_minor: i64,
    pub pending_payments: i64,
    pub failed_payments: i64,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Users

    /// Create the user on first contact. An existing user keeps their
    /// referrer; a referrer equal to the user is ignored.
    async fn ensure_user(
        &self,
        id: UserId,
        username: &str,
        referrer: Option<UserId>,
    ) -> BillingResult<User>;
    async fn get_user(&self, id: UserId) -> BillingResult<Option<User>>;
    async fn set_banned(&self, id: UserId, banned: bool) -> BillingResult<bool>;

    // Hosts and plans

    async fn create_host(&self, host: &NewHost) -> BillingResult<Host>;
    async fn get_host(&self, name: &str) -> BillingResult<Option<Host>>;
    async fn list_active_hosts(&self) -> BillingResult<Vec<Host>>;
    async fn deactivate_host(&self, name: &str) -> BillingResult<bool>;
    async fn create_plan(&self, plan: &NewPlan) -> BillingResult<Plan>;
    async fn get_plan(&self, id: i64) -> BillingResult<Option<Plan>>;
    async fn list_active_plans(&self, host_name: &str) -> BillingResult<Vec<Plan>>;
    /// Retire plan `id` and insert its successor in one step.
    async fn replace_plan(&self, id: i64, name: &str, price_minor: i64) -> BillingResult<Plan>;
    async fn retire_plan(&self, id: i64) -> BillingResult<bool>;

    // Credentials

    async fn get_credential(&self, id: i64) -> BillingResult<Option<Credential>>;
    async fn find_credential(&self, host_name: &str, label: &str)
        -> BillingResult<Option<Credential>>;
    async fn list_user_credentials(&self, user_id: UserId) -> BillingResult<Vec<Credential>>;
    async fn delete_credential(&self, id: i64) -> BillingResult<bool>;

    // Payments

    /// Insert a `pending` payment, or return the existing row for the id.
    async fn create_payment(&self, new: &NewPayment) -> BillingResult<Payment>;
    async fn get_payment(&self, external_id: &str) -> BillingResult<Option<Payment>>;

    /// Atomically insert-if-absent (when `new` is given) and move the payment
    /// from `pending` to `claimed` under `token`.
    async fn claim_payment(
        &self,
        external_id: &str,
        new: Option<&NewPayment>,
        token: Uuid,
    ) -> BillingResult<Option<ClaimOutcome>>;

    /// Persist the panel write target or its confirmation; fails with
    /// `ClaimLost` if `token` no longer owns the payment.
    async fn record_checkpoint(
        &self,
        external_id: &str,
        token: Uuid,
        checkpoint: &ProvisionCheckpoint,
    ) -> BillingResult<()>;

    /// Another unfinished payment whose panel write on `(host_name, label)`
    /// is journaled but not yet confirmed.
    async fn find_open_intent(
        &self,
        host_name: &str,
        label: &str,
        excluding: &str,
    ) -> BillingResult<Option<String>>;

    /// Apply every ledger effect of a fulfilled payment and mark it
    /// `fulfilled`, all or nothing.
    async fn commit_fulfillment(&self, record: &FulfillmentRecord) -> BillingResult<CommitResult>;

    /// `claimed → pending` for the holder of `token`.
    async fn release_claim(&self, external_id: &str, token: Uuid, error: &str)
        -> BillingResult<bool>;

    /// `claimed → failed` for the holder of `token`.
    async fn mark_failed(&self, external_id: &str, token: Uuid, error: &str) -> BillingResult<bool>;

    /// Provider-side terminal state observed for a `pending` payment.
    async fn close_pending(
        &self,
        external_id: &str,
        state: PaymentState,
        reason: &str,
    ) -> BillingResult<bool>;

    /// Operator reset `failed → pending` with the attempt counter cleared.
    async fn reset_failed(&self, external_id: &str) -> BillingResult<bool>;

    /// `pending` payments with a row id above `after_id`, in id order.
    async fn list_pending(&self, after_id: i64, limit: i64) -> BillingResult<Vec<Payment>>;

    /// Re-claim `claimed` rows older than `older_than` under fresh tokens.
    async fn reclaim_stale(
        &self,
        older_than: Duration,
        limit: i64,
    ) -> BillingResult<Vec<ClaimedPayment>>;

    // Reporting

    async fn list_transactions(&self, user_id: UserId) -> BillingResult<Vec<Transaction>>;
    async fn list_referral_credits(&self, referrer_id: UserId)
        -> BillingResult<Vec<ReferralCredit>>;
    async fn stats(&self, now: OffsetDateTime) -> BillingResult<LedgerStats>;
}
