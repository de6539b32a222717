//! In-memory ledger store
//!
//! A single mutex guards all tables, so every trait method is atomic the
//! same way a Postgres transaction is. Used by tests and local runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{ClaimOutcome, ClaimedPayment, CommitResult, FulfillmentRecord, LedgerStats, LedgerStore};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    Credential, Host, NewHost, NewPayment, NewPlan, Payment, PaymentState, Plan,
    ProvisionCheckpoint, ReferralCredit, Transaction, User, UserId,
};

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, User>,
    hosts: Vec<Host>,
    plans: Vec<Plan>,
    credentials: Vec<Credential>,
    payments: Vec<Payment>,
    transactions: Vec<Transaction>,
    referral_credits: Vec<ReferralCredit>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn payment_mut(&mut self, external_id: &str) -> Option<&mut Payment> {
        self.payments.iter_mut().find(|p| p.external_id == external_id)
    }

    fn insert_payment(&mut self, new: &NewPayment) -> Payment {
        let now = OffsetDateTime::now_utc();
        let id = self.next_id();
        let meta = &new.metadata;
        let payment = Payment {
            id,
            external_id: new.external_id.clone(),
            user_id: meta.user_id,
            plan_id: meta.plan_id,
            host_name: meta.host_name.clone(),
            months: meta.months,
            duration_days: meta.duration_days,
            amount_minor: meta.price_minor,
            method: meta.method,
            intent: meta.intent,
            state: PaymentState::Pending,
            claim_token: None,
            claimed_at: None,
            attempts: 0,
            checkpoint: None,
            last_error: None,
            fulfilled_at: None,
            created_at: now,
            updated_at: now,
        };
        self.payments.push(payment.clone());
        payment
    }

    fn owned_claim(&mut self, external_id: &str, token: Uuid) -> BillingResult<&mut Payment> {
        match self.payment_mut(external_id) {
            Some(p) if p.state == PaymentState::Claimed && p.claim_token == Some(token) => Ok(p),
            _ => Err(BillingError::ClaimLost(external_id.to_string())),
        }
    }
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    tables: Mutex<Tables>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> BillingResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| BillingError::Database("ledger mutex poisoned".into()))
    }

    /// Backdate a claim, as if the claiming worker had crashed long ago.
    pub fn age_claim(&self, external_id: &str, by: Duration) -> BillingResult<()> {
        let mut t = self.tables()?;
        let p = t
            .payment_mut(external_id)
            .ok_or_else(|| BillingError::not_found("payment", external_id))?;
        if let Some(at) = p.claimed_at {
            p.claimed_at = Some(at - by);
        }
        Ok(())
    }

    pub fn all_payments(&self) -> BillingResult<Vec<Payment>> {
        Ok(self.tables()?.payments.clone())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn ensure_user(
        &self,
        id: UserId,
        username: &str,
        referrer: Option<UserId>,
    ) -> BillingResult<User> {
        let mut t = self.tables()?;
        let referrer = referrer
            .filter(|r| *r != id)
            .filter(|r| t.users.contains_key(r));
        let user = t.users.entry(id).or_insert_with(|| User {
            id,
            username: username.to_string(),
            total_spent_minor: 0,
            total_months: 0,
            referred_by: referrer,
            referral_balance_minor: 0,
            is_banned: false,
            trial_used: false,
            created_at: OffsetDateTime::now_utc(),
        });
        if !username.is_empty() {
            user.username = username.to_string();
        }
        Ok(user.clone())
    }

    async fn get_user(&self, id: UserId) -> BillingResult<Option<User>> {
        Ok(self.tables()?.users.get(&id).cloned())
    }

    async fn set_banned(&self, id: UserId, banned: bool) -> BillingResult<bool> {
        let mut t = self.tables()?;
        Ok(match t.users.get_mut(&id) {
            Some(u) => {
                u.is_banned = banned;
                true
            }
            None => false,
        })
    }

    async fn create_host(&self, host: &NewHost) -> BillingResult<Host> {
        let mut t = self.tables()?;
        if t.hosts.iter().any(|h| h.name == host.name) {
            return Err(BillingError::Validation(format!("host '{}' already exists", host.name)));
        }
        let id = t.next_id();
        let row = Host {
            id,
            name: host.name.clone(),
            base_url: host.base_url.clone(),
            username: host.username.clone(),
            password: host.password.clone(),
            inbound_id: host.inbound_id,
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
        };
        t.hosts.push(row.clone());
        Ok(row)
    }

    async fn get_host(&self, name: &str) -> BillingResult<Option<Host>> {
        Ok(self.tables()?.hosts.iter().find(|h| h.name == name).cloned())
    }

    async fn list_active_hosts(&self) -> BillingResult<Vec<Host>> {
        Ok(self.tables()?.hosts.iter().filter(|h| h.is_active).cloned().collect())
    }

    async fn deactivate_host(&self, name: &str) -> BillingResult<bool> {
        let mut t = self.tables()?;
        let now = OffsetDateTime::now_utc();
        let Some(host) = t.hosts.iter_mut().find(|h| h.name == name && h.is_active) else {
            return Ok(false);
        };
        host.is_active = false;
        for plan in t.plans.iter_mut().filter(|p| p.host_name == name && p.is_active) {
            plan.is_active = false;
            plan.retired_at = Some(now);
        }
        Ok(true)
    }

    async fn create_plan(&self, plan: &NewPlan) -> BillingResult<Plan> {
        plan.validate()?;
        let mut t = self.tables()?;
        if !t.hosts.iter().any(|h| h.name == plan.host_name) {
            return Err(BillingError::not_found("host", &plan.host_name));
        }
        let id = t.next_id();
        let row = Plan {
            id,
            host_name: plan.host_name.clone(),
            name: plan.name.clone(),
            months: plan.months,
            price_minor: plan.price_minor,
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
            retired_at: None,
        };
        t.plans.push(row.clone());
        Ok(row)
    }

    async fn get_plan(&self, id: i64) -> BillingResult<Option<Plan>> {
        Ok(self.tables()?.plans.iter().find(|p| p.id == id).cloned())
    }

    async fn list_active_plans(&self, host_name: &str) -> BillingResult<Vec<Plan>> {
        Ok(self
            .tables()?
            .plans
            .iter()
            .filter(|p| p.host_name == host_name && p.is_active)
            .cloned()
            .collect())
    }

    async fn replace_plan(&self, id: i64, name: &str, price_minor: i64) -> BillingResult<Plan> {
        let mut t = self.tables()?;
        let Some(old) = t.plans.iter_mut().find(|p| p.id == id && p.is_active) else {
            return Err(BillingError::not_found("plan", id));
        };
        let successor = NewPlan {
            host_name: old.host_name.clone(),
            name: name.to_string(),
            months: old.months,
            price_minor,
        };
        successor.validate()?;
        old.is_active = false;
        old.retired_at = Some(OffsetDateTime::now_utc());
        let new_id = t.next_id();
        let row = Plan {
            id: new_id,
            host_name: successor.host_name,
            name: successor.name,
            months: successor.months,
            price_minor,
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
            retired_at: None,
        };
        t.plans.push(row.clone());
        Ok(row)
    }

    async fn retire_plan(&self, id: i64) -> BillingResult<bool> {
        let mut t = self.tables()?;
        Ok(match t.plans.iter_mut().find(|p| p.id == id && p.is_active) {
            Some(p) => {
                p.is_active = false;
                p.retired_at = Some(OffsetDateTime::now_utc());
                true
            }
            None => false,
        })
    }

    async fn get_credential(&self, id: i64) -> BillingResult<Option<Credential>> {
        Ok(self.tables()?.credentials.iter().find(|c| c.id == id).cloned())
    }

    async fn find_credential(
        &self,
        host_name: &str,
        label: &str,
    ) -> BillingResult<Option<Credential>> {
        Ok(self
            .tables()?
            .credentials
            .iter()
            .find(|c| c.host_name == host_name && c.label == label)
            .cloned())
    }

    async fn list_user_credentials(&self, user_id: UserId) -> BillingResult<Vec<Credential>> {
        Ok(self
            .tables()?
            .credentials
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn delete_credential(&self, id: i64) -> BillingResult<bool> {
        let mut t = self.tables()?;
        let before = t.credentials.len();
        t.credentials.retain(|c| c.id != id);
        Ok(t.credentials.len() != before)
    }

    async fn create_payment(&self, new: &NewPayment) -> BillingResult<Payment> {
        let mut t = self.tables()?;
        if let Some(existing) = t.payment_mut(&new.external_id) {
            return Ok(existing.clone());
        }
        if !t.users.contains_key(&new.metadata.user_id) {
            return Err(BillingError::not_found("user", new.metadata.user_id));
        }
        Ok(t.insert_payment(new))
    }

    async fn get_payment(&self, external_id: &str) -> BillingResult<Option<Payment>> {
        Ok(self
            .tables()?
            .payments
            .iter()
            .find(|p| p.external_id == external_id)
            .cloned())
    }

    async fn claim_payment(
        &self,
        external_id: &str,
        new: Option<&NewPayment>,
        token: Uuid,
    ) -> BillingResult<Option<ClaimOutcome>> {
        let mut t = self.tables()?;
        if t.payment_mut(external_id).is_none() {
            match new {
                Some(new) => {
                    t.users.entry(new.metadata.user_id).or_insert_with(|| User {
                        id: new.metadata.user_id,
                        username: String::new(),
                        total_spent_minor: 0,
                        total_months: 0,
                        referred_by: None,
                        referral_balance_minor: 0,
                        is_banned: false,
                        trial_used: false,
                        created_at: OffsetDateTime::now_utc(),
                    });
                    t.insert_payment(new);
                }
                None => return Ok(None),
            }
        }
        let Some(payment) = t.payment_mut(external_id) else {
            return Ok(None);
        };
        let outcome = match payment.state {
            PaymentState::Pending => {
                let now = OffsetDateTime::now_utc();
                payment.state = PaymentState::Claimed;
                payment.claim_token = Some(token);
                payment.claimed_at = Some(now);
                payment.attempts += 1;
                payment.updated_at = now;
                ClaimOutcome::Won(ClaimedPayment {
                    payment: payment.clone(),
                    token,
                })
            }
            PaymentState::Claimed => ClaimOutcome::AlreadyClaimed,
            PaymentState::Fulfilled => ClaimOutcome::AlreadyFulfilled,
            state => ClaimOutcome::Terminal(state),
        };
        Ok(Some(outcome))
    }

    async fn record_checkpoint(
        &self,
        external_id: &str,
        token: Uuid,
        checkpoint: &ProvisionCheckpoint,
    ) -> BillingResult<()> {
        let mut t = self.tables()?;
        let p = t.owned_claim(external_id, token)?;
        p.checkpoint = Some(checkpoint.clone());
        p.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn find_open_intent(
        &self,
        host_name: &str,
        label: &str,
        excluding: &str,
    ) -> BillingResult<Option<String>> {
        Ok(self
            .tables()?
            .payments
            .iter()
            .find(|p| {
                p.external_id != excluding
                    && p.host_name == host_name
                    && matches!(p.state, PaymentState::Pending | PaymentState::Claimed | PaymentState::Failed)
                    && p.checkpoint.as_ref().is_some_and(|c| c.label == label && !c.confirmed)
            })
            .map(|p| p.external_id.clone()))
    }

    async fn commit_fulfillment(&self, record: &FulfillmentRecord) -> BillingResult<CommitResult> {
        let mut t = self.tables()?;
        // Validate everything before the first write so a failure leaves no trace.
        t.owned_claim(&record.external_id, record.claim_token)?;
        if !t.users.contains_key(&record.user_id) {
            return Err(BillingError::not_found("user", record.user_id));
        }
        let now = OffsetDateTime::now_utc();

        let existing = t
            .credentials
            .iter()
            .position(|c| c.host_name == record.host_name && c.label == record.label);
        let (credential, credential_created) = match existing {
            Some(idx) => {
                let c = &mut t.credentials[idx];
                c.remote_id = record.remote_id.clone();
                c.expires_at = record.expires_at;
                c.updated_at = now;
                (c.clone(), false)
            }
            None => {
                let id = t.next_id();
                let c = Credential {
                    id,
                    user_id: record.user_id,
                    host_name: record.host_name.clone(),
                    remote_id: record.remote_id.clone(),
                    label: record.label.clone(),
                    expires_at: record.expires_at,
                    created_at: now,
                    updated_at: now,
                };
                t.credentials.push(c.clone());
                (c, true)
            }
        };

        let already_logged = t
            .transactions
            .iter()
            .any(|tx| tx.payment_id == record.external_id);
        if !already_logged {
            let id = t.next_id();
            t.transactions.push(Transaction {
                id,
                payment_id: record.external_id.clone(),
                user_id: record.user_id,
                username: record.username.clone(),
                amount_minor: record.amount_minor,
                method: record.method.to_string(),
                metadata: record.metadata.clone(),
                created_at: now,
            });
            if let Some(user) = t.users.get_mut(&record.user_id) {
                user.total_spent_minor += record.amount_minor;
                user.total_months += record.months;
                user.trial_used |= record.is_trial;
            }
        }

        let mut referral_credited = false;
        if let Some(award) = record.referral {
            let duplicate = t.referral_credits.iter().any(|rc| {
                rc.referrer_id == award.referrer_id && rc.payment_id == record.external_id
            });
            if !duplicate && t.users.contains_key(&award.referrer_id) {
                let id = t.next_id();
                t.referral_credits.push(ReferralCredit {
                    id,
                    referrer_id: award.referrer_id,
                    referee_id: record.user_id,
                    payment_id: record.external_id.clone(),
                    amount_minor: award.amount_minor,
                    created_at: now,
                });
                if let Some(referrer) = t.users.get_mut(&award.referrer_id) {
                    referrer.referral_balance_minor += award.amount_minor;
                }
                referral_credited = true;
            }
        }

        let p = t.owned_claim(&record.external_id, record.claim_token)?;
        p.state = PaymentState::Fulfilled;
        p.claim_token = None;
        p.last_error = None;
        p.fulfilled_at = Some(now);
        p.updated_at = now;

        Ok(CommitResult {
            credential,
            credential_created,
            referral_credited,
        })
    }

    async fn release_claim(
        &self,
        external_id: &str,
        token: Uuid,
        error: &str,
    ) -> BillingResult<bool> {
        let mut t = self.tables()?;
        let Ok(p) = t.owned_claim(external_id, token) else {
            return Ok(false);
        };
        p.state = PaymentState::Pending;
        p.claim_token = None;
        p.claimed_at = None;
        p.last_error = Some(error.to_string());
        p.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn mark_failed(&self, external_id: &str, token: Uuid, error: &str) -> BillingResult<bool> {
        let mut t = self.tables()?;
        let Ok(p) = t.owned_claim(external_id, token) else {
            return Ok(false);
        };
        p.state = PaymentState::Failed;
        p.claim_token = None;
        p.last_error = Some(error.to_string());
        p.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn close_pending(
        &self,
        external_id: &str,
        state: PaymentState,
        reason: &str,
    ) -> BillingResult<bool> {
        if !matches!(state, PaymentState::Failed | PaymentState::Expired) {
            return Err(BillingError::Validation(format!(
                "cannot close a pending payment as {state}"
            )));
        }
        let mut t = self.tables()?;
        Ok(match t.payment_mut(external_id) {
            Some(p) if p.state == PaymentState::Pending => {
                p.state = state;
                p.last_error = Some(reason.to_string());
                p.updated_at = OffsetDateTime::now_utc();
                true
            }
            _ => false,
        })
    }

    async fn reset_failed(&self, external_id: &str) -> BillingResult<bool> {
        let mut t = self.tables()?;
        Ok(match t.payment_mut(external_id) {
            Some(p) if p.state == PaymentState::Failed => {
                p.state = PaymentState::Pending;
                p.attempts = 0;
                p.claim_token = None;
                p.claimed_at = None;
                p.updated_at = OffsetDateTime::now_utc();
                true
            }
            _ => false,
        })
    }

    async fn list_pending(&self, after_id: i64, limit: i64) -> BillingResult<Vec<Payment>> {
        let t = self.tables()?;
        let mut pending: Vec<Payment> = t
            .payments
            .iter()
            .filter(|p| p.state == PaymentState::Pending && p.id > after_id)
            .cloned()
            .collect();
        pending.sort_by_key(|p| p.id);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn reclaim_stale(
        &self,
        older_than: Duration,
        limit: i64,
    ) -> BillingResult<Vec<ClaimedPayment>> {
        let mut t = self.tables()?;
        let now = OffsetDateTime::now_utc();
        let cutoff = now - older_than;
        let mut reclaimed = Vec::new();
        for p in t.payments.iter_mut() {
            if reclaimed.len() as i64 >= limit {
                break;
            }
            let stale = p.state == PaymentState::Claimed
                && p.claimed_at.map(|at| at < cutoff).unwrap_or(true);
            if stale {
                let token = Uuid::new_v4();
                p.claim_token = Some(token);
                p.claimed_at = Some(now);
                p.attempts += 1;
                p.last_error = Some("recovered from stale claim".into());
                p.updated_at = now;
                reclaimed.push(ClaimedPayment {
                    payment: p.clone(),
                    token,
                });
            }
        }
        Ok(reclaimed)
    }

    async fn list_transactions(&self, user_id: UserId) -> BillingResult<Vec<Transaction>> {
        Ok(self
            .tables()?
            .transactions
            .iter()
            .filter(|tx| tx.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_referral_credits(
        &self,
        referrer_id: UserId,
    ) -> BillingResult<Vec<ReferralCredit>> {
        Ok(self
            .tables()?
            .referral_credits
            .iter()
            .filter(|rc| rc.referrer_id == referrer_id)
            .cloned()
            .collect())
    }

    async fn stats(&self, now: OffsetDateTime) -> BillingResult<LedgerStats> {
        let t = self.tables()?;
        let count_payments = |state| t.payments.iter().filter(|p| p.state == state).count() as i64;
        Ok(LedgerStats {
            users: t.users.len() as i64,
            banned_users: t.users.values().filter(|u| u.is_banned).count() as i64,
            credentials: t.credentials.len() as i64,
            active_credentials: t.credentials.iter().filter(|c| c.is_active(now)).count() as i64,
            transactions: t.transactions.len() as i64,
            revenue_minor: t.transactions.iter().map(|tx| tx.amount_minor).sum(),
            pending_payments: count_payments(PaymentState::Pending),
            failed_payments: count_payments(PaymentState::Failed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InvoiceMetadata, PaymentMethod, PurchaseIntent};

    fn new_payment(id: &str) -> NewPayment {
        NewPayment {
            external_id: id.to_string(),
            metadata: InvoiceMetadata {
                user_id: 42,
                plan_id: Some(1),
                host_name: "nl-1".into(),
                months: 1,
                duration_days: 30,
                price_minor: 30_000,
                method: PaymentMethod::YooKassa,
                intent: PurchaseIntent::Purchase,
            },
        }
    }

    #[tokio::test]
    async fn test_claim_transitions() {
        let store = MemoryLedgerStore::new();
        store.ensure_user(42, "alice", None).await.unwrap();
        let first = Uuid::new_v4();

        let won = store
            .claim_payment("p-1", Some(&new_payment("p-1")), first)
            .await
            .unwrap();
        assert!(matches!(won, Some(ClaimOutcome::Won(ref c)) if c.token == first));

        let again = store
            .claim_payment("p-1", Some(&new_payment("p-1")), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(again, Some(ClaimOutcome::AlreadyClaimed));

        assert!(store.release_claim("p-1", first, "timeout").await.unwrap());
        let payment = store.get_payment("p-1").await.unwrap().unwrap();
        assert_eq!(payment.state, PaymentState::Pending);
        assert_eq!(payment.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_claim_unknown_without_payload_is_none() {
        let store = MemoryLedgerStore::new();
        let outcome = store.claim_payment("nope", None, Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome, None);
    }

    #[tokio::test]
    async fn test_stale_token_cannot_release() {
        let store = MemoryLedgerStore::new();
        store.ensure_user(42, "alice", None).await.unwrap();
        let token = Uuid::new_v4();
        store
            .claim_payment("p-2", Some(&new_payment("p-2")), token)
            .await
            .unwrap();
        assert!(!store.release_claim("p-2", Uuid::new_v4(), "x").await.unwrap());
        assert!(!store.mark_failed("p-2", Uuid::new_v4(), "x").await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_pages_by_id() {
        let store = MemoryLedgerStore::new();
        store.ensure_user(42, "alice", None).await.unwrap();
        for id in ["p-1", "p-2", "p-3"] {
            store.create_payment(&new_payment(id)).await.unwrap();
        }

        let first = store.list_pending(0, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let rest = store.list_pending(first[1].id, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].external_id, "p-3");
    }

    #[tokio::test]
    async fn test_unconfirmed_checkpoint_is_an_open_intent() {
        let store = MemoryLedgerStore::new();
        store.ensure_user(42, "alice", None).await.unwrap();
        let token = Uuid::new_v4();
        store
            .claim_payment("p-1", Some(&new_payment("p-1")), token)
            .await
            .unwrap();
        let intent = ProvisionCheckpoint {
            remote_id: "r-1".into(),
            label: "user42@nl-1.bot".into(),
            expires_at: OffsetDateTime::now_utc(),
            confirmed: false,
        };
        store.record_checkpoint("p-1", token, &intent).await.unwrap();

        let open = store.find_open_intent("nl-1", "user42@nl-1.bot", "p-2").await.unwrap();
        assert_eq!(open.as_deref(), Some("p-1"));
        assert_eq!(
            store.find_open_intent("nl-1", "user42@nl-1.bot", "p-1").await.unwrap(),
            None
        );

        let confirmed = ProvisionCheckpoint {
            confirmed: true,
            ..intent
        };
        store.record_checkpoint("p-1", token, &confirmed).await.unwrap();
        assert_eq!(
            store.find_open_intent("nl-1", "user42@nl-1.bot", "p-2").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_self_referral_ignored() {
        let store = MemoryLedgerStore::new();
        let user = store.ensure_user(7, "bob", Some(7)).await.unwrap();
        assert_eq!(user.referred_by, None);
    }

    #[tokio::test]
    async fn test_referrer_kept_on_second_contact() {
        let store = MemoryLedgerStore::new();
        store.ensure_user(1, "referrer", None).await.unwrap();
        store.ensure_user(2, "carol", Some(1)).await.unwrap();
        let user = store.ensure_user(2, "carol", None).await.unwrap();
        assert_eq!(user.referred_by, Some(1));
    }
}
