//! Checkout, trials and operator actions
//!
//! Everything here ends either in a provider invoice plus a `pending`
//! payment, or in the shared intake path. Nothing in this module writes
//! fulfillment effects directly.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::actions::CallbackAction;
use crate::adapter::CredentialStoreAdapter;
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::intake::{CompletionIntake, ManualCheck, Observation};
use crate::ledger::{LedgerStats, LedgerStore};
use crate::models::{
    format_minor, CompletionPayload, Credential, Host, InvoiceMetadata, NewHost, NewPayment, NewPlan, PaymentMethod,
    Plan, PurchaseIntent, User, UserId,
};
use crate::referral::ReferralPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckoutRequest {
    pub user_id: UserId,
    pub plan_id: i64,
    pub method: PaymentMethod,
    /// Renew this credential instead of issuing a new one.
    #[serde(default)]
    pub renew_credential_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkout {
    pub payment_id: String,
    pub pay_url: String,
    pub amount_minor: i64,
    pub list_price_minor: i64,
    pub discounted: bool,
}

/// Reply to a front-end callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ActionReply {
    Invoice(Checkout),
    Trial { observation: Observation },
    Check { check: ManualCheck },
    Key { uri: String },
}

/// A credential with its state at the time of the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialStatus {
    #[serde(flatten)]
    pub credential: Credential,
    pub active: bool,
}

/// What a user sees about their own account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserProfile {
    #[serde(flatten)]
    pub user: User,
    pub credentials: Vec<CredentialStatus>,
    pub purchases: usize,
    pub referrals_credited: usize,
    pub referral_earned_minor: i64,
}

#[derive(Debug, Clone, Copy)]
struct TrialSettings {
    enabled: bool,
    duration_days: i32,
}

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn LedgerStore>,
    intake: CompletionIntake,
    adapter: Arc<CredentialStoreAdapter>,
    referrals: ReferralPolicy,
    trial: TrialSettings,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        intake: CompletionIntake,
        adapter: Arc<CredentialStoreAdapter>,
        config: &BillingConfig,
    ) -> Self {
        Self {
            store,
            intake,
            adapter,
            referrals: ReferralPolicy::from_config(config),
            trial: TrialSettings {
                enabled: config.trial_enabled,
                duration_days: config.trial_duration_days,
            },
        }
    }

    /// Register a user on first contact.
    pub async fn ensure_user(&self, user_id: UserId, username: &str, referrer: Option<UserId>) -> BillingResult<User> {
        let user = self.store.ensure_user(user_id, username, referrer).await?;
        if referrer.is_some() && user.referred_by.is_none() {
            tracing::debug!(user_id, referrer = ?referrer, "Referrer ignored");
        }
        Ok(user)
    }

    async fn active_user(&self, user_id: UserId) -> BillingResult<User> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::not_found("user", user_id))?;
        if user.is_banned {
            return Err(BillingError::Validation(format!("user {user_id} is banned")));
        }
        Ok(user)
    }

    /// Issue a provider invoice and record the `pending` payment.
    pub async fn create_checkout(&self, request: &CheckoutRequest) -> BillingResult<Checkout> {
        if request.method == PaymentMethod::Trial {
            return Err(BillingError::Validation("trials are not sold through checkout".into()));
        }
        let user = self.active_user(request.user_id).await?;

        let plan = self
            .store
            .get_plan(request.plan_id)
            .await?
            .ok_or_else(|| BillingError::not_found("plan", request.plan_id))?;
        if !plan.is_active {
            return Err(BillingError::Validation(format!("plan {} is retired", plan.id)));
        }
        let host = self.active_host(&plan.host_name).await?;

        let intent = match request.renew_credential_id {
            Some(credential_id) => {
                let credential = self
                    .store
                    .get_credential(credential_id)
                    .await?
                    .ok_or_else(|| BillingError::not_found("credential", credential_id))?;
                if credential.user_id != user.id || credential.host_name != host.name {
                    return Err(BillingError::Validation(format!(
                        "credential {credential_id} cannot be renewed with plan {}",
                        plan.id
                    )));
                }
                PurchaseIntent::Renewal { credential_id }
            }
            None => PurchaseIntent::Purchase,
        };

        let (amount_minor, discounted) = self.referrals.checkout_price(&user, plan.price_minor);
        if amount_minor <= 0 {
            return Err(BillingError::Validation(format!("plan {} has no payable price", plan.id)));
        }

        let provider = self.intake.providers().get(request.method)?;
        let metadata = InvoiceMetadata {
            user_id: user.id,
            plan_id: Some(plan.id),
            host_name: host.name.clone(),
            months: plan.months,
            duration_days: plan.duration_days(),
            price_minor: amount_minor,
            method: request.method,
            intent,
        };
        let description = format!("VPN на {} мес. ({})", plan.months, host.name);
        let invoice = provider.create_invoice(amount_minor, &description, &metadata).await?;

        // The invoice carries its metadata, so a lost insert is recovered by
        // the completion signal.
        if let Err(e) = self
            .store
            .create_payment(&NewPayment {
                external_id: invoice.payment_id.clone(),
                metadata,
            })
            .await
        {
            tracing::error!(payment_id = %invoice.payment_id, error = %e, "Invoice issued but payment row not stored");
            return Err(e);
        }

        tracing::info!(
            payment_id = %invoice.payment_id,
            user_id = user.id,
            plan_id = plan.id,
            method = %request.method,
            amount = %format_minor(amount_minor),
            discounted,
            "Checkout created"
        );
        Ok(Checkout {
            payment_id: invoice.payment_id,
            pay_url: invoice.pay_url,
            amount_minor,
            list_price_minor: plan.price_minor,
            discounted,
        })
    }

    /// One free trial per user, on the first active host.
    ///
    /// The trial runs through the normal claim path under the fixed id
    /// `trial-{user_id}`, so it can only ever be fulfilled once.
    pub async fn start_trial(&self, user_id: UserId) -> BillingResult<Observation> {
        if !self.trial.enabled {
            return Err(BillingError::Validation("trials are disabled".into()));
        }
        let user = self.active_user(user_id).await?;
        if user.trial_used {
            return Err(BillingError::Validation(format!("user {user_id} already used the trial")));
        }
        let host = self
            .store
            .list_active_hosts()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BillingError::not_found("host", "any active"))?;

        let payment_id = format!("trial-{user_id}");
        let payload = CompletionPayload {
            paid_amount_minor: None,
            metadata: Some(InvoiceMetadata {
                user_id,
                plan_id: None,
                host_name: host.name.clone(),
                months: 0,
                duration_days: self.trial.duration_days,
                price_minor: 0,
                method: PaymentMethod::Trial,
                intent: PurchaseIntent::Trial,
            }),
        };
        tracing::info!(user_id, host = %host.name, "Starting trial");
        self.intake.observe_completion(&payment_id, payload).await
    }

    /// Fresh connection URI for a credential, optionally checking its owner.
    pub async fn credential_uri(&self, credential_id: i64, owner: Option<UserId>) -> BillingResult<String> {
        let credential = self.credential(credential_id).await?;
        if owner.is_some_and(|owner| owner != credential.user_id) {
            return Err(BillingError::not_found("credential", credential_id));
        }
        let host = self
            .store
            .get_host(&credential.host_name)
            .await?
            .ok_or_else(|| BillingError::not_found("host", &credential.host_name))?;
        self.adapter
            .connection_uri(&host, &credential.label)
            .await?
            .ok_or_else(|| BillingError::Provider(format!("host {} has no reality listener", host.name)))
    }

    /// Run a front-end callback for `user_id`.
    pub async fn dispatch(&self, user_id: UserId, action: CallbackAction) -> BillingResult<ActionReply> {
        tracing::debug!(user_id, action = %action, "Dispatching callback");
        match action {
            CallbackAction::Buy { plan_id, method } => {
                let checkout = self
                    .create_checkout(&CheckoutRequest {
                        user_id,
                        plan_id,
                        method,
                        renew_credential_id: None,
                    })
                    .await?;
                Ok(ActionReply::Invoice(checkout))
            }
            CallbackAction::Renew {
                credential_id,
                plan_id,
                method,
            } => {
                let checkout = self
                    .create_checkout(&CheckoutRequest {
                        user_id,
                        plan_id,
                        method,
                        renew_credential_id: Some(credential_id),
                    })
                    .await?;
                Ok(ActionReply::Invoice(checkout))
            }
            CallbackAction::Trial => Ok(ActionReply::Trial {
                observation: self.start_trial(user_id).await?,
            }),
            CallbackAction::Check { payment_id } => {
                let payment = self
                    .store
                    .get_payment(&payment_id)
                    .await?
                    .filter(|p| p.user_id == user_id)
                    .ok_or_else(|| BillingError::not_found("payment", &payment_id))?;
                Ok(ActionReply::Check {
                    check: self.intake.manual_check(&payment.external_id).await?,
                })
            }
            CallbackAction::ShowKey { credential_id } => Ok(ActionReply::Key {
                uri: self.credential_uri(credential_id, Some(user_id)).await?,
            }),
        }
    }

    pub async fn profile(&self, user_id: UserId) -> BillingResult<UserProfile> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::not_found("user", user_id))?;
        let now = OffsetDateTime::now_utc();
        let credentials = self
            .store
            .list_user_credentials(user_id)
            .await?
            .into_iter()
            .map(|credential| CredentialStatus {
                active: credential.is_active(now),
                credential,
            })
            .collect();
        let purchases = self
            .store
            .list_transactions(user_id)
            .await?
            .iter()
            .filter(|tx| tx.amount_minor > 0)
            .count();
        let credits = self.store.list_referral_credits(user_id).await?;

        Ok(UserProfile {
            user,
            credentials,
            purchases,
            referrals_credited: credits.len(),
            referral_earned_minor: credits.iter().map(|c| c.amount_minor).sum(),
        })
    }

    // Operator actions

    pub async fn stats(&self) -> BillingResult<LedgerStats> {
        self.store.stats(OffsetDateTime::now_utc()).await
    }

    /// `failed → pending`, then re-check immediately.
    pub async fn retry_failed(&self, payment_id: &str) -> BillingResult<ManualCheck> {
        if !self.store.reset_failed(payment_id).await? {
            return match self.store.get_payment(payment_id).await? {
                Some(p) => Err(BillingError::Validation(format!(
                    "payment {payment_id} is {}, not failed",
                    p.state
                ))),
                None => Err(BillingError::not_found("payment", payment_id)),
            };
        }
        tracing::info!(payment_id = %payment_id, "Operator reset failed payment");
        self.intake.manual_check(payment_id).await
    }

    /// Delete the panel client, then the local row.
    pub async fn revoke_credential(&self, credential_id: i64) -> BillingResult<Credential> {
        let credential = self.credential(credential_id).await?;
        let host = self
            .store
            .get_host(&credential.host_name)
            .await?
            .ok_or_else(|| BillingError::not_found("host", &credential.host_name))?;

        let removed = self.adapter.remove(&host, &credential.label).await?;
        if !removed {
            tracing::warn!(credential_id, host = %host.name, "Client was already gone from the panel");
        }
        self.store.delete_credential(credential_id).await?;
        tracing::info!(credential_id, user_id = credential.user_id, host = %host.name, "Credential revoked");
        Ok(credential)
    }

    pub async fn set_banned(&self, user_id: UserId, banned: bool) -> BillingResult<()> {
        if !self.store.set_banned(user_id, banned).await? {
            return Err(BillingError::not_found("user", user_id));
        }
        tracing::info!(user_id, banned, "User ban flag changed");
        Ok(())
    }

    pub async fn create_host(&self, host: &NewHost) -> BillingResult<Host> {
        if host.name.trim().is_empty() {
            return Err(BillingError::Validation("host name must not be empty".into()));
        }
        url::Url::parse(&host.base_url)
            .map_err(|e| BillingError::Validation(format!("bad panel URL: {e}")))?;
        let created = self.store.create_host(host).await?;
        tracing::info!(host = %created.name, "Host created");
        Ok(created)
    }

    /// Stop selling a host. Existing credentials keep working.
    pub async fn deactivate_host(&self, name: &str) -> BillingResult<()> {
        if !self.store.deactivate_host(name).await? {
            return Err(BillingError::not_found("host", name));
        }
        tracing::info!(host = %name, "Host deactivated");
        Ok(())
    }

    pub async fn create_plan(&self, plan: &NewPlan) -> BillingResult<Plan> {
        plan.validate()?;
        self.active_host(&plan.host_name).await?;
        self.store.create_plan(plan).await
    }

    /// Retire plan `id` and publish a successor with the new name and price.
    /// Invoices already issued keep their original price.
    pub async fn replace_plan(&self, id: i64, name: &str, price_minor: i64) -> BillingResult<Plan> {
        if price_minor < 0 {
            return Err(BillingError::Validation("plan price must not be negative".into()));
        }
        if name.trim().is_empty() {
            return Err(BillingError::Validation("plan name must not be empty".into()));
        }
        let plan = self.store.replace_plan(id, name, price_minor).await?;
        tracing::info!(old_plan_id = id, plan_id = plan.id, price = %format_minor(price_minor), "Plan replaced");
        Ok(plan)
    }

    pub async fn retire_plan(&self, id: i64) -> BillingResult<()> {
        if !self.store.retire_plan(id).await? {
            return Err(BillingError::not_found("plan", id));
        }
        Ok(())
    }

    pub async fn list_plans(&self, host_name: &str) -> BillingResult<Vec<Plan>> {
        self.store.list_active_plans(host_name).await
    }

    async fn active_host(&self, name: &str) -> BillingResult<Host> {
        let host = self
            .store
            .get_host(name)
            .await?
            .ok_or_else(|| BillingError::not_found("host", name))?;
        if !host.is_active {
            return Err(BillingError::Validation(format!("host {name} is not active")));
        }
        Ok(host)
    }

    async fn credential(&self, id: i64) -> BillingResult<Credential> {
        self.store
            .get_credential(id)
            .await?
            .ok_or_else(|| BillingError::not_found("credential", id))
    }
}
