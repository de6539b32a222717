//! Provisioning orchestrator
//!
//! Turns a claimed payment into its durable effects: a provisioned or
//! renewed panel client, one ledger commit, and the notifications. The
//! caller must hold the claim; every store write is conditioned on its
//! token.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::adapter::{CredentialStoreAdapter, IntentJournal, ProvisionedKey};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{ClaimedPayment, FulfillmentRecord, LedgerStore};
use crate::models::{Credential, Host, PaymentState, ProvisionCheckpoint, PurchaseIntent, User, UserId};
use crate::notify::{Notice, Notifier};
use crate::referral::ReferralPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fulfillment {
    pub payment_id: String,
    pub user_id: UserId,
    pub credential: Credential,
    pub uri: Option<String>,
    pub renewed: bool,
    pub referral_credited: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillOutcome {
    Fulfilled(Box<Fulfillment>),
    /// Released back to `pending` (or left for the recovery sweep).
    Deferred { error: String },
    /// Parked in `failed` for operator action.
    Failed { error: String },
    /// Another worker took over the claim; nothing was changed by us.
    Lost,
}

/// Deterministic client label for a new credential.
pub fn credential_label(user_id: UserId, host: &Host, trial: bool) -> String {
    if trial {
        format!("user{user_id}-trial@{}.bot", host.slug())
    } else {
        format!("user{user_id}@{}.bot", host.slug())
    }
}

/// Journals a payment's panel write target on the payment row itself.
struct PaymentJournal<'a> {
    store: &'a dyn LedgerStore,
    claimed: &'a ClaimedPayment,
}

#[async_trait]
impl<'a> IntentJournal for PaymentJournal<'a> {
    async fn record_intent(&self, intent: &ProvisionCheckpoint) -> BillingResult<()> {
        let payment = &self.claimed.payment;
        // Two unconfirmed targets on one client would each read as landed
        // once the other is written.
        if let Some(other) = self
            .store
            .find_open_intent(&payment.host_name, &intent.label, &payment.external_id)
            .await?
        {
            return Err(BillingError::Conflict {
                host: payment.host_name.clone(),
                detail: format!("payment {other} has an unconfirmed write on {}", intent.label),
            });
        }
        self.store
            .record_checkpoint(&payment.external_id, self.claimed.token, intent)
            .await
    }
}

pub struct ProvisioningOrchestrator {
    store: Arc<dyn LedgerStore>,
    adapter: Arc<CredentialStoreAdapter>,
    notifier: Arc<dyn Notifier>,
    referrals: ReferralPolicy,
    max_attempts: i32,
}

impl ProvisioningOrchestrator {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        adapter: Arc<CredentialStoreAdapter>,
        notifier: Arc<dyn Notifier>,
        referrals: ReferralPolicy,
        max_attempts: i32,
    ) -> Self {
        Self {
            store,
            adapter,
            notifier,
            referrals,
            max_attempts,
        }
    }

    pub fn adapter(&self) -> &Arc<CredentialStoreAdapter> {
        &self.adapter
    }

    /// Fulfill and settle: on error the claim is released or the payment
    /// parked, according to the error class and attempt count.
    pub async fn run(&self, claimed: &ClaimedPayment, paid_amount_minor: Option<i64>) -> FulfillOutcome {
        match self.fulfill(claimed, paid_amount_minor).await {
            Ok(done) => FulfillOutcome::Fulfilled(Box::new(done)),
            Err(e) => self.settle_failure(claimed, &e).await,
        }
    }

    pub async fn fulfill(
        &self,
        claimed: &ClaimedPayment,
        paid_amount_minor: Option<i64>,
    ) -> BillingResult<Fulfillment> {
        let payment = &claimed.payment;

        if let Some(paid) = paid_amount_minor {
            if paid < payment.amount_minor {
                return Err(BillingError::Validation(format!(
                    "paid {paid} is less than the invoiced {}",
                    payment.amount_minor
                )));
            }
        }

        let user = self
            .store
            .get_user(payment.user_id)
            .await?
            .ok_or_else(|| BillingError::not_found("user", payment.user_id))?;

        if let Some(plan_id) = payment.plan_id {
            let plan = self
                .store
                .get_plan(plan_id)
                .await?
                .ok_or_else(|| BillingError::not_found("plan", plan_id))?;
            if plan.host_name != payment.host_name {
                return Err(BillingError::Validation(format!(
                    "plan {plan_id} belongs to host {}, payment names {}",
                    plan.host_name, payment.host_name
                )));
            }
        }

        let host = self
            .store
            .get_host(&payment.host_name)
            .await?
            .ok_or_else(|| BillingError::not_found("host", &payment.host_name))?;
        if !host.is_active {
            tracing::warn!(
                payment_id = %payment.external_id,
                host = %host.name,
                "Fulfilling a paid invoice on a deactivated host"
            );
        }

        let label = self.resolve_label(&user, &host, payment.intent).await?;
        let key = self.provision(claimed, &host, &label).await?;

        let record = FulfillmentRecord {
            external_id: payment.external_id.clone(),
            claim_token: claimed.token,
            user_id: user.id,
            username: user.username.clone(),
            host_name: host.name.clone(),
            label: key.label.clone(),
            remote_id: key.remote_id.clone(),
            expires_at: key.expires_at,
            amount_minor: payment.amount_minor,
            months: payment.months,
            is_trial: payment.intent.is_trial(),
            method: payment.method,
            metadata: serde_json::to_value(payment.metadata())?,
            referral: self.referrals.award(&user, payment),
        };
        let commit = self.store.commit_fulfillment(&record).await?;

        tracing::info!(
            payment_id = %payment.external_id,
            user_id = user.id,
            host = %host.name,
            credential_id = commit.credential.id,
            expires_at = %commit.credential.expires_at,
            referral_credited = commit.referral_credited,
            "Payment fulfilled"
        );

        let renewed = !commit.credential_created;
        self.notifier
            .notify_user(
                user.id,
                &Notice::KeyProvisioned {
                    host_name: host.name.clone(),
                    expires_at: commit.credential.expires_at,
                    uri: key.uri.clone(),
                    renewed,
                },
            )
            .await;
        if payment.is_revenue_bearing() {
            self.notifier
                .notify_operator(&Notice::PurchaseCompleted {
                    user_id: user.id,
                    username: user.username.clone(),
                    amount_minor: payment.amount_minor,
                    method: payment.method,
                    host_name: host.name.clone(),
                    months: payment.months,
                })
                .await;
        }

        Ok(Fulfillment {
            payment_id: payment.external_id.clone(),
            user_id: user.id,
            credential: commit.credential,
            uri: key.uri,
            renewed,
            referral_credited: commit.referral_credited,
        })
    }

    async fn resolve_label(&self, user: &User, host: &Host, intent: PurchaseIntent) -> BillingResult<String> {
        match intent {
            PurchaseIntent::Trial => Ok(credential_label(user.id, host, true)),
            PurchaseIntent::Purchase => Ok(credential_label(user.id, host, false)),
            PurchaseIntent::Renewal { credential_id } => {
                let credential = self
                    .store
                    .get_credential(credential_id)
                    .await?
                    .ok_or_else(|| BillingError::not_found("credential", credential_id))?;
                if credential.user_id != user.id || credential.host_name != host.name {
                    return Err(BillingError::Validation(format!(
                        "credential {credential_id} does not belong to user {} on {}",
                        user.id, host.name
                    )));
                }
                Ok(credential.label)
            }
        }
    }

    /// Panel write for this payment. A confirmed checkpoint from an earlier
    /// attempt skips the write; an unconfirmed one is written as journaled.
    async fn provision(&self, claimed: &ClaimedPayment, host: &Host, label: &str) -> BillingResult<ProvisionedKey> {
        let payment = &claimed.payment;
        let checkpoint = payment.checkpoint.as_ref().filter(|c| c.label == label);

        if let Some(checkpoint) = checkpoint.filter(|c| c.confirmed) {
            tracing::info!(
                payment_id = %payment.external_id,
                remote_id = %checkpoint.remote_id,
                "Resuming from provisioning checkpoint"
            );
            let uri = match self.adapter.connection_uri(host, label).await {
                Ok(uri) => uri,
                Err(e) => {
                    tracing::warn!(payment_id = %payment.external_id, error = %e, "Could not rebuild connection URI");
                    None
                }
            };
            return Ok(ProvisionedKey {
                remote_id: checkpoint.remote_id.clone(),
                label: checkpoint.label.clone(),
                expires_at: checkpoint.expires_at,
                uri,
                created: false,
            });
        }

        self.ensure_claim_held(claimed).await?;
        let journal = PaymentJournal {
            store: self.store.as_ref(),
            claimed,
        };
        let key = self
            .adapter
            .provision_or_renew(host, label, payment.duration_days, checkpoint, &journal)
            .await?;
        self.store
            .record_checkpoint(
                &payment.external_id,
                claimed.token,
                &ProvisionCheckpoint {
                    remote_id: key.remote_id.clone(),
                    label: key.label.clone(),
                    expires_at: key.expires_at,
                    confirmed: true,
                },
            )
            .await?;
        Ok(key)
    }

    /// A worker that stalled past the claim timeout must not write the panel
    /// after the sweep took over.
    async fn ensure_claim_held(&self, claimed: &ClaimedPayment) -> BillingResult<()> {
        let id = &claimed.payment.external_id;
        match self.store.get_payment(id).await? {
            Some(p) if p.state == PaymentState::Claimed && p.claim_token == Some(claimed.token) => Ok(()),
            _ => Err(BillingError::ClaimLost(id.clone())),
        }
    }

    /// Release or park a claim after a failed fulfillment.
    pub async fn settle_failure(&self, claimed: &ClaimedPayment, error: &BillingError) -> FulfillOutcome {
        let payment = &claimed.payment;
        let id = payment.external_id.as_str();

        if let BillingError::ClaimLost(_) = error {
            tracing::warn!(payment_id = %id, "Claim lost during fulfillment; leaving payment to its new owner");
            return FulfillOutcome::Lost;
        }

        let park = error.is_permanent() || payment.attempts >= self.max_attempts;
        let message = error.to_string();

        if park {
            match self.store.mark_failed(id, claimed.token, &message).await {
                Ok(true) => {}
                Ok(false) => return FulfillOutcome::Lost,
                Err(e) => {
                    tracing::error!(payment_id = %id, error = %e, "Failed to park payment; recovery sweep will retry");
                    return FulfillOutcome::Deferred { error: message };
                }
            }
            tracing::error!(
                payment_id = %id,
                user_id = payment.user_id,
                attempts = payment.attempts,
                error = %message,
                "Fulfillment failed permanently"
            );
            self.notifier
                .notify_user(
                    payment.user_id,
                    &Notice::ProvisioningDelayed {
                        payment_id: id.to_string(),
                    },
                )
                .await;
            self.notifier
                .notify_operator(&Notice::FulfillmentFailed {
                    payment_id: id.to_string(),
                    user_id: payment.user_id,
                    error: message.clone(),
                    parked: true,
                })
                .await;
            return FulfillOutcome::Failed { error: message };
        }

        match self.store.release_claim(id, claimed.token, &message).await {
            Ok(true) => {}
            Ok(false) => return FulfillOutcome::Lost,
            Err(e) => {
                tracing::error!(payment_id = %id, error = %e, "Failed to release claim; recovery sweep will retry");
            }
        }
        tracing::warn!(
            payment_id = %id,
            attempts = payment.attempts,
            error = %message,
            "Fulfillment deferred"
        );
        if let BillingError::Authentication { target } = error {
            self.notifier
                .notify_operator(&Notice::HostUnreachable {
                    host_name: target.clone(),
                    error: message.clone(),
                })
                .await;
        }
        FulfillOutcome::Deferred { error: message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    #[test]
    fn test_labels_follow_host_slug() {
        let host = Host {
            id: 1,
            name: "NL Fast".into(),
            base_url: "https://nl.example.com".into(),
            username: "a".into(),
            password: "b".into(),
            inbound_id: 1,
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
        };
        assert_eq!(credential_label(42, &host, false), "user42@nlfast.bot");
        assert_eq!(credential_label(42, &host, true), "user42-trial@nlfast.bot");
    }
}
