//! Completion intake
//!
//! Webhooks, the poll loop and manual checks all end in
//! [`CompletionIntake::observe_completion`]. Duplicate signals are a normal
//! outcome, not an error.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{BillingError, BillingResult};
use crate::guard::IdempotencyGuard;
use crate::ledger::{ClaimOutcome, LedgerStore};
use crate::models::{CompletionPayload, Payment, PaymentMethod, PaymentState};
use crate::orchestrator::{FulfillOutcome, Fulfillment, ProvisioningOrchestrator};
use crate::providers::{ProviderRegistry, ProviderStatus, WebhookEvent, WebhookRequest};

/// What one completion signal led to.
///
/// Returned to end users as is, so failures carry no error detail; that
/// stays in the payment's `last_error` and the logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Observation {
    Fulfilled(Box<Fulfillment>),
    /// Not provisioned yet; a later pass retries.
    Deferred,
    /// Parked until an operator retries it.
    Failed,
    Lost,
    AlreadyClaimed,
    AlreadyFulfilled,
    Terminal { state: PaymentState },
}

impl From<FulfillOutcome> for Observation {
    fn from(outcome: FulfillOutcome) -> Self {
        match outcome {
            FulfillOutcome::Fulfilled(done) => Observation::Fulfilled(done),
            FulfillOutcome::Deferred { .. } => Observation::Deferred,
            FulfillOutcome::Failed { .. } => Observation::Failed,
            FulfillOutcome::Lost => Observation::Lost,
        }
    }
}

/// Result of a synchronous re-check of one payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum ManualCheck {
    Observed { observation: Observation },
    /// The provider has not seen the money yet.
    StillPending,
    /// The provider reported the invoice dead; the payment was closed.
    Closed { state: PaymentState },
    /// The payment is not `pending`, so nothing was asked of the provider.
    Unchanged { state: PaymentState },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollSummary {
    pub checked: usize,
    pub fulfilled: usize,
    pub deferred: usize,
    pub failed: usize,
    pub closed: usize,
    pub still_pending: usize,
    pub duplicates: usize,
    pub errors: usize,
}

impl PollSummary {
    fn count(&mut self, observation: &Observation) {
        match observation {
            Observation::Fulfilled(_) => self.fulfilled += 1,
            Observation::Deferred => self.deferred += 1,
            Observation::Failed => self.failed += 1,
            Observation::Lost
            | Observation::AlreadyClaimed
            | Observation::AlreadyFulfilled
            | Observation::Terminal { .. } => self.duplicates += 1,
        }
    }
}

#[derive(Clone)]
pub struct CompletionIntake {
    store: Arc<dyn LedgerStore>,
    guard: IdempotencyGuard,
    orchestrator: Arc<ProvisioningOrchestrator>,
    providers: ProviderRegistry,
    batch_size: i64,
}

impl CompletionIntake {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        orchestrator: Arc<ProvisioningOrchestrator>,
        providers: ProviderRegistry,
        batch_size: i64,
    ) -> Self {
        Self {
            guard: IdempotencyGuard::new(store.clone()),
            store,
            orchestrator,
            providers,
            batch_size: batch_size.max(1),
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Claim the payment and, if this call won, fulfill it.
    pub async fn observe_completion(
        &self,
        payment_id: &str,
        payload: CompletionPayload,
    ) -> BillingResult<Observation> {
        let observation = match self.guard.claim(payment_id, &payload).await? {
            ClaimOutcome::Won(claimed) => self
                .orchestrator
                .run(&claimed, payload.paid_amount_minor)
                .await
                .into(),
            ClaimOutcome::AlreadyClaimed => Observation::AlreadyClaimed,
            ClaimOutcome::AlreadyFulfilled => Observation::AlreadyFulfilled,
            ClaimOutcome::Terminal(state) => Observation::Terminal { state },
        };
        Ok(observation)
    }

    /// Authenticate a webhook. Processing is left to [`Self::apply_event`]
    /// so the HTTP handler can acknowledge first.
    pub async fn verify_webhook(
        &self,
        method: PaymentMethod,
        request: &WebhookRequest<'_>,
    ) -> BillingResult<Option<WebhookEvent>> {
        self.providers.get(method)?.verify_webhook(request).await
    }

    pub async fn apply_event(&self, event: WebhookEvent) -> BillingResult<Option<Observation>> {
        let WebhookEvent { payment_id, status } = event;
        self.apply_status(&payment_id, status).await
    }

    /// `None` when the status called for no action.
    async fn apply_status(&self, payment_id: &str, status: ProviderStatus) -> BillingResult<Option<Observation>> {
        match status {
            ProviderStatus::Completed(payload) => self.observe_completion(payment_id, payload).await.map(Some),
            ProviderStatus::Pending => Ok(None),
            ProviderStatus::Expired => {
                self.close(payment_id, PaymentState::Expired).await?;
                Ok(None)
            }
            ProviderStatus::Failed => {
                self.close(payment_id, PaymentState::Failed).await?;
                Ok(None)
            }
        }
    }

    async fn close(&self, payment_id: &str, state: PaymentState) -> BillingResult<bool> {
        let reason = format!("provider reported invoice {state}");
        let closed = self.store.close_pending(payment_id, state, &reason).await?;
        if closed {
            tracing::info!(payment_id = %payment_id, state = %state, "Closed pending payment");
        }
        Ok(closed)
    }

    /// Re-check one payment with its provider, now.
    pub async fn manual_check(&self, payment_id: &str) -> BillingResult<ManualCheck> {
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| BillingError::not_found("payment", payment_id))?;

        if payment.state != PaymentState::Pending {
            return Ok(ManualCheck::Unchanged { state: payment.state });
        }

        // Trials have no provider; a pending trial is a deferred fulfillment.
        if payment.method == PaymentMethod::Trial {
            let observation = self
                .observe_completion(payment_id, CompletionPayload::default())
                .await?;
            return Ok(ManualCheck::Observed { observation });
        }

        let provider = self.providers.get(payment.method)?;
        let mut statuses = provider.get_statuses(&[payment.external_id.clone()]).await?;
        let status = statuses
            .remove(&payment.external_id)
            .ok_or_else(|| BillingError::not_found("provider invoice", payment_id))?;

        Ok(match status {
            ProviderStatus::Pending => ManualCheck::StillPending,
            ProviderStatus::Completed(payload) => ManualCheck::Observed {
                observation: self.observe_completion(payment_id, payload).await?,
            },
            ProviderStatus::Expired => {
                self.close(payment_id, PaymentState::Expired).await?;
                ManualCheck::Closed {
                    state: PaymentState::Expired,
                }
            }
            ProviderStatus::Failed => {
                self.close(payment_id, PaymentState::Failed).await?;
                ManualCheck::Closed {
                    state: PaymentState::Failed,
                }
            }
        })
    }

    /// One pass of the poll loop over every `pending` payment, taken in
    /// pages of `batch_size` so each provider query stays bounded.
    ///
    /// Provider errors are counted and logged; one rail being down does not
    /// stop the others.
    pub async fn poll_pending(&self) -> BillingResult<PollSummary> {
        let mut summary = PollSummary::default();
        let mut after_id = 0;
        loop {
            let page = self.store.list_pending(after_id, self.batch_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;
            let full = page.len() as i64 >= self.batch_size;
            self.poll_page(page, &mut summary).await;
            if !full {
                break;
            }
        }

        if summary.fulfilled + summary.failed + summary.closed + summary.errors > 0 {
            tracing::info!(
                checked = summary.checked,
                fulfilled = summary.fulfilled,
                deferred = summary.deferred,
                failed = summary.failed,
                closed = summary.closed,
                errors = summary.errors,
                "Poll pass finished"
            );
        }
        Ok(summary)
    }

    async fn poll_page(&self, pending: Vec<Payment>, summary: &mut PollSummary) {
        let mut by_method: HashMap<PaymentMethod, Vec<Payment>> = HashMap::new();
        for payment in pending {
            by_method.entry(payment.method).or_default().push(payment);
        }

        for (method, payments) in by_method {
            if method == PaymentMethod::Trial {
                for payment in payments {
                    summary.checked += 1;
                    self.record(
                        summary,
                        &payment.external_id,
                        self.observe_completion(&payment.external_id, CompletionPayload::default())
                            .await
                            .map(Some),
                    );
                }
                continue;
            }

            let provider = match self.providers.get(method) {
                Ok(provider) => provider,
                Err(e) => {
                    tracing::warn!(method = %method, count = payments.len(), error = %e, "Pending payments on an unconfigured rail");
                    summary.errors += payments.len();
                    continue;
                }
            };

            let ids: Vec<String> = payments.iter().map(|p| p.external_id.clone()).collect();
            let mut statuses = match provider.get_statuses(&ids).await {
                Ok(statuses) => statuses,
                Err(e) => {
                    tracing::warn!(method = %method, count = ids.len(), error = %e, "Provider status query failed");
                    summary.errors += ids.len();
                    continue;
                }
            };

            for id in ids {
                summary.checked += 1;
                let Some(status) = statuses.remove(&id) else {
                    summary.still_pending += 1;
                    continue;
                };
                let closing = matches!(status, ProviderStatus::Expired | ProviderStatus::Failed);
                match self.apply_status(&id, status).await {
                    Ok(None) if closing => summary.closed += 1,
                    result => self.record(summary, &id, result),
                }
            }
        }
    }

    fn record(&self, summary: &mut PollSummary, payment_id: &str, result: BillingResult<Option<Observation>>) {
        match result {
            Ok(Some(observation)) => summary.count(&observation),
            Ok(None) => summary.still_pending += 1,
            Err(e) => {
                tracing::warn!(payment_id = %payment_id, error = %e, "Failed to process polled payment");
                summary.errors += 1;
            }
        }
    }
}
