//! Ledger invariants
//!
//! Read-only consistency checks, run periodically by the worker. Each check
//! is one SQL query; a violation carries enough context to find the rows.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::models::UserId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub user_ids: Vec<UserId>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money taken without the service delivered, or the reverse.
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(checks_run: usize, violations: Vec<InvariantViolation>) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();
        Self {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    external_id: String,
    user_id: UserId,
    state: String,
}

#[derive(Debug, sqlx::FromRow)]
struct TotalsRow {
    user_id: UserId,
    recorded_minor: i64,
    derived_minor: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleClaimRow {
    external_id: String,
    user_id: UserId,
    attempts: i32,
    claimed_at: Option<OffsetDateTime>,
}

const CHECKS: [&str; 5] = [
    "fulfilled_has_transaction",
    "transaction_has_fulfilled_payment",
    "spend_matches_transactions",
    "referral_balance_matches_credits",
    "no_stale_claims",
];

#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
    claim_timeout: Duration,
}

impl InvariantChecker {
    pub fn new(pool: PgPool, claim_timeout: Duration) -> Self {
        Self { pool, claim_timeout }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        for name in CHECKS {
            violations.extend(self.run_check(name).await?);
        }
        Ok(InvariantCheckSummary::from_violations(CHECKS.len(), violations))
    }

    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "fulfilled_has_transaction" => self.check_fulfilled_has_transaction().await,
            "transaction_has_fulfilled_payment" => self.check_transaction_has_fulfilled_payment().await,
            "spend_matches_transactions" => self.check_spend_matches_transactions().await,
            "referral_balance_matches_credits" => self.check_referral_balance().await,
            "no_stale_claims" => self.check_stale_claims().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }

    /// A fulfilled payment without its transaction means the commit was
    /// split, which the single-transaction commit forbids.
    async fn check_fulfilled_has_transaction(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            r#"
            SELECT p.external_id, p.user_id, p.state
            FROM payments p
            LEFT JOIN transactions t ON t.payment_id = p.external_id
            WHERE p.state = 'fulfilled' AND t.id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "fulfilled_has_transaction".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Payment {} is fulfilled but has no transaction", row.external_id),
                context: serde_json::json!({ "payment_id": row.external_id }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_transaction_has_fulfilled_payment(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            r#"
            SELECT p.external_id, p.user_id, p.state
            FROM transactions t
            JOIN payments p ON p.external_id = t.payment_id
            WHERE p.state <> 'fulfilled'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "transaction_has_fulfilled_payment".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Transaction exists for payment {} in state '{}'",
                    row.external_id, row.state
                ),
                context: serde_json::json!({ "payment_id": row.external_id, "state": row.state }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_spend_matches_transactions(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TotalsRow> = sqlx::query_as(
            r#"
            SELECT u.id AS user_id,
                   u.total_spent_minor AS recorded_minor,
                   COALESCE(SUM(t.amount_minor), 0)::BIGINT AS derived_minor
            FROM users u
            LEFT JOIN transactions t ON t.user_id = u.id
            GROUP BY u.id, u.total_spent_minor
            HAVING u.total_spent_minor <> COALESCE(SUM(t.amount_minor), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| totals_violation("spend_matches_transactions", "total spent", row, ViolationSeverity::High))
            .collect())
    }

    async fn check_referral_balance(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TotalsRow> = sqlx::query_as(
            r#"
            SELECT u.id AS user_id,
                   u.referral_balance_minor AS recorded_minor,
                   COALESCE(SUM(c.amount_minor), 0)::BIGINT AS derived_minor
            FROM users u
            LEFT JOIN referral_credits c ON c.referrer_id = u.id
            GROUP BY u.id, u.referral_balance_minor
            HAVING u.referral_balance_minor <> COALESCE(SUM(c.amount_minor), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                totals_violation(
                    "referral_balance_matches_credits",
                    "referral balance",
                    row,
                    ViolationSeverity::Medium,
                )
            })
            .collect())
    }

    /// Stale claims are expected briefly after a crash; one that survives
    /// the recovery sweep needs a look.
    async fn check_stale_claims(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleClaimRow> = sqlx::query_as(
            r#"
            SELECT external_id, user_id, attempts, claimed_at
            FROM payments
            WHERE state = 'claimed'
              AND (claimed_at IS NULL OR claimed_at < NOW() - make_interval(secs => $1))
            "#,
        )
        .bind(self.claim_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stale_claims".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Payment {} has been claimed since {:?} ({} attempts)",
                    row.external_id, row.claimed_at, row.attempts
                ),
                context: serde_json::json!({
                    "payment_id": row.external_id,
                    "attempts": row.attempts,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }
}

fn totals_violation(
    invariant: &str,
    what: &str,
    row: TotalsRow,
    severity: ViolationSeverity,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        user_ids: vec![row.user_id],
        description: format!(
            "User {} {what} is {} but the log sums to {}",
            row.user_id, row.recorded_minor, row.derived_minor
        ),
        context: serde_json::json!({
            "recorded_minor": row.recorded_minor,
            "derived_minor": row.derived_minor,
        }),
        severity,
    }
}
