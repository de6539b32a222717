//! Stale-claim recovery
//!
//! A claim older than the timeout belongs to a worker that crashed or hung.
//! The sweep takes it over under a fresh token and resumes fulfillment; the
//! provisioning checkpoint keeps a resumed payment from extending the
//! credential twice.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::BillingResult;
use crate::ledger::LedgerStore;
use crate::orchestrator::{FulfillOutcome, ProvisioningOrchestrator};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub reclaimed: usize,
    pub fulfilled: usize,
    pub deferred: usize,
    pub failed: usize,
    pub lost: usize,
}

#[derive(Clone)]
pub struct RecoverySweep {
    store: Arc<dyn LedgerStore>,
    orchestrator: Arc<ProvisioningOrchestrator>,
    claim_timeout: Duration,
    batch_size: i64,
}

impl RecoverySweep {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        orchestrator: Arc<ProvisioningOrchestrator>,
        claim_timeout: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            orchestrator,
            claim_timeout,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run(&self) -> BillingResult<SweepSummary> {
        let stale = self
            .store
            .reclaim_stale(self.claim_timeout, self.batch_size)
            .await?;
        let mut summary = SweepSummary {
            reclaimed: stale.len(),
            ..SweepSummary::default()
        };

        for claimed in stale {
            tracing::warn!(
                payment_id = %claimed.payment.external_id,
                attempts = claimed.payment.attempts,
                checkpointed = claimed.payment.checkpoint.is_some(),
                "Resuming stale claim"
            );
            match self.orchestrator.run(&claimed, None).await {
                FulfillOutcome::Fulfilled(_) => summary.fulfilled += 1,
                FulfillOutcome::Deferred { .. } => summary.deferred += 1,
                FulfillOutcome::Failed { .. } => summary.failed += 1,
                FulfillOutcome::Lost => summary.lost += 1,
            }
        }

        if summary.reclaimed > 0 {
            tracing::info!(
                reclaimed = summary.reclaimed,
                fulfilled = summary.fulfilled,
                deferred = summary.deferred,
                failed = summary.failed,
                "Recovery sweep finished"
            );
        }
        Ok(summary)
    }
}
