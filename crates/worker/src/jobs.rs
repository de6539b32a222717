//! Scheduled job bodies
//!
//! Each job holds a [`JobGate`] so a run that outlasts its schedule is not
//! overlapped by the next tick.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use tunnelshop_billing::{
    BillingService, InvariantChecker, InvariantCheckSummary, PollSummary, SweepSummary, ViolationSeverity,
};

/// Single-flight guard for a scheduled job.
#[derive(Clone, Default)]
pub struct JobGate(Arc<Mutex<()>>);

impl JobGate {
    /// Run `job` unless a previous run still holds the gate.
    pub async fn run<F, T>(&self, name: &'static str, job: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        let Ok(_held) = self.0.try_lock() else {
            debug!(job = name, "Previous run still in progress, skipping tick");
            return None;
        };
        Some(job.await)
    }
}

/// Feed provider completions of pending invoices through the intake.
pub async fn poll_pending(billing: &BillingService) -> Option<PollSummary> {
    match billing.intake.poll_pending().await {
        Ok(summary) => {
            if summary.checked > 0 {
                info!(
                    checked = summary.checked,
                    fulfilled = summary.fulfilled,
                    deferred = summary.deferred,
                    failed = summary.failed,
                    closed = summary.closed,
                    still_pending = summary.still_pending,
                    duplicates = summary.duplicates,
                    errors = summary.errors,
                    "Poll cycle complete"
                );
            }
            if summary.errors > 0 {
                warn!(errors = summary.errors, "Some payments could not be checked this cycle");
            }
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "Poll cycle failed");
            None
        }
    }
}

/// Resume claims abandoned by crashed processes.
pub async fn recover_stale_claims(billing: &BillingService) -> Option<SweepSummary> {
    match billing.recovery.run().await {
        Ok(summary) => {
            if summary.reclaimed > 0 {
                warn!(
                    reclaimed = summary.reclaimed,
                    fulfilled = summary.fulfilled,
                    deferred = summary.deferred,
                    failed = summary.failed,
                    lost = summary.lost,
                    "Recovered stale claims"
                );
            } else {
                debug!("No stale claims");
            }
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "Recovery sweep failed");
            None
        }
    }
}

pub async fn check_invariants(checker: &InvariantChecker) -> Option<InvariantCheckSummary> {
    match checker.run_all_checks().await {
        Ok(summary) => {
            log_invariant_summary(&summary);
            Some(summary)
        }
        Err(e) => {
            error!(error = %e, "Invariant check failed to run");
            None
        }
    }
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.violations.is_empty() {
        info!(checks_run = summary.checks_run, "Ledger invariants hold");
        return;
    }
    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => {
                error!(invariant = %violation.invariant, users = ?violation.user_ids, "{}", violation.description)
            }
            _ => warn!(invariant = %violation.invariant, users = ?violation.user_ids, "{}", violation.description),
        }
    }
    warn!(
        checks_run = summary.checks_run,
        violations = summary.violations.len(),
        "Ledger invariant violations found"
    );
}
