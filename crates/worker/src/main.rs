// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Tunnelshop Background Worker
//!
//! Handles scheduled jobs:
//! - Pending-invoice poll (every minute)
//! - Stale-claim recovery sweep (every 5 minutes, and once at startup)
//! - Ledger invariant check (hourly)
//! - Heartbeat (every 5 minutes)

mod jobs;

use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;
use tunnelshop_billing::{BillingService, InvariantChecker};
use tunnelshop_shared::{create_pool, init_tracing, run_migrations};

use crate::jobs::JobGate;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("info,tunnelshop_worker=debug,tunnelshop_billing=debug");

    info!("Starting Tunnelshop Worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url = std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let max_connections = std::env::var("DB_MAX_CONNECTIONS")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(10);
    let pool = create_pool(&database_url, max_connections).await?;
    run_migrations(&pool).await?;

    let billing = BillingService::from_env(pool.clone())?;
    let checker = InvariantChecker::new(pool, billing.config.claim_timeout);
    info!(rails = ?billing.intake.providers().methods(), "Billing service initialized");

    let sweep_gate = JobGate::default();
    sweep_gate
        .run("recovery_sweep", jobs::recover_stale_claims(&billing))
        .await;

    let scheduler = JobScheduler::new().await?;

    // Job 1: Poll pending invoices (every minute)
    let poll_billing = billing.clone();
    let poll_gate = JobGate::default();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = poll_billing.clone();
            let gate = poll_gate.clone();
            Box::pin(async move {
                gate.run("poll_pending", jobs::poll_pending(&billing)).await;
            })
        })?)
        .await?;
    info!("Scheduled: Pending invoice poll (every minute)");

    // Job 2: Recovery sweep (every 5 minutes)
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("30 */5 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            let gate = sweep_gate.clone();
            Box::pin(async move {
                gate.run("recovery_sweep", jobs::recover_stale_claims(&billing)).await;
            })
        })?)
        .await?;
    info!("Scheduled: Stale claim recovery (every 5 minutes)");

    // Job 3: Ledger invariants (hourly)
    let invariant_gate = JobGate::default();
    scheduler
        .add(Job::new_async("0 15 * * * *", move |_uuid, _l| {
            let checker = checker.clone();
            let gate = invariant_gate.clone();
            Box::pin(async move {
                gate.run("invariants", jobs::check_invariants(&checker)).await;
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant check (hourly)");

    // Job 4: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Tunnelshop Worker started with 4 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
