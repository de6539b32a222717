//! Postgres ledger store
//!
//! Claims use an insert-if-absent followed by a conditional state update, the
//! same pattern as webhook event deduplication: only one concurrent caller
//! can see its `UPDATE ... WHERE state = 'pending'` return a row.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{ClaimOutcome, ClaimedPayment, CommitResult, FulfillmentRecord, LedgerStats, LedgerStore};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    Credential, Host, NewHost, NewPayment, NewPlan, Payment, PaymentState, Plan,
    ProvisionCheckpoint, PurchaseIntent, ReferralCredit, Transaction, User, UserId,
};

const USER_COLUMNS: &str = "id, username, total_spent_minor, total_months, referred_by, \
    referral_balance_minor, is_banned, trial_used, created_at";

const HOST_COLUMNS: &str =
    "id, name, base_url, username, password, inbound_id, is_active, created_at";

const PLAN_COLUMNS: &str =
    "id, host_name, name, months, price_minor, is_active, created_at, retired_at";

const CREDENTIAL_COLUMNS: &str =
    "id, user_id, host_name, remote_id, label, expires_at, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, external_id, user_id, plan_id, host_name, months, \
    duration_days, amount_minor, method, intent, state, claim_token, claimed_at, attempts, \
    provisioned_remote_id, provisioned_label, provisioned_expires_at, provisioned_confirmed, last_error, \
    fulfilled_at, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: i64,
    external_id: String,
    user_id: i64,
    plan_id: Option<i64>,
    host_name: String,
    months: i32,
    duration_days: i32,
    amount_minor: i64,
    method: String,
    intent: Json<PurchaseIntent>,
    state: String,
    claim_token: Option<Uuid>,
    claimed_at: Option<OffsetDateTime>,
    attempts: i32,
    provisioned_remote_id: Option<String>,
    provisioned_label: Option<String>,
    provisioned_expires_at: Option<OffsetDateTime>,
    provisioned_confirmed: bool,
    last_error: Option<String>,
    fulfilled_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let checkpoint = match (
            row.provisioned_remote_id,
            row.provisioned_label,
            row.provisioned_expires_at,
        ) {
            (Some(remote_id), Some(label), Some(expires_at)) => Some(ProvisionCheckpoint {
                remote_id,
                label,
                expires_at,
                confirmed: row.provisioned_confirmed,
            }),
            _ => None,
        };
        Ok(Payment {
            id: row.id,
            external_id: row.external_id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            host_name: row.host_name,
            months: row.months,
            duration_days: row.duration_days,
            amount_minor: row.amount_minor,
            method: row
                .method
                .parse()
                .map_err(|_| BillingError::Database(format!("unknown method '{}'", row.method)))?,
            intent: row.intent.0,
            state: row.state.parse()?,
            claim_token: row.claim_token,
            claimed_at: row.claimed_at,
            attempts: row.attempts,
            checkpoint,
            last_error: row.last_error,
            fulfilled_at: row.fulfilled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UpsertedCredential {
    #[sqlx(flatten)]
    credential: Credential,
    inserted: bool,
}

fn unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_payment<'e, E>(executor: E, new: &NewPayment) -> BillingResult<()>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let meta = &new.metadata;
        sqlx::query(
            r#"
            INSERT INTO payments
                (external_id, user_id, plan_id, host_name, months, duration_days,
                 amount_minor, method, intent)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (external_id) DO NOTHING
            "#,
        )
        .bind(&new.external_id)
        .bind(meta.user_id)
        .bind(meta.plan_id)
        .bind(&meta.host_name)
        .bind(meta.months)
        .bind(meta.duration_days)
        .bind(meta.price_minor)
        .bind(meta.method.as_str())
        .bind(Json(meta.intent))
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn ensure_user(
        &self,
        id: UserId,
        username: &str,
        referrer: Option<UserId>,
    ) -> BillingResult<User> {
        let user: User = sqlx::query_as(&format!(
            r#"
            INSERT INTO users (id, username, referred_by)
            VALUES ($1, $2, (SELECT id FROM users WHERE id = $3 AND id <> $1))
            ON CONFLICT (id) DO UPDATE SET
                username = CASE WHEN EXCLUDED.username = '' THEN users.username
                                ELSE EXCLUDED.username END
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(username)
        .bind(referrer)
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    async fn get_user(&self, id: UserId) -> BillingResult<Option<User>> {
        let user = sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn set_banned(&self, id: UserId, banned: bool) -> BillingResult<bool> {
        let result = sqlx::query("UPDATE users SET is_banned = $2 WHERE id = $1")
            .bind(id)
            .bind(banned)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_host(&self, host: &NewHost) -> BillingResult<Host> {
        sqlx::query_as(&format!(
            r#"
            INSERT INTO hosts (name, base_url, username, password, inbound_id)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {HOST_COLUMNS}
            "#
        ))
        .bind(&host.name)
        .bind(&host.base_url)
        .bind(&host.username)
        .bind(&host.password)
        .bind(host.inbound_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if unique_violation(&e) {
                BillingError::Validation(format!("host '{}' already exists", host.name))
            } else {
                e.into()
            }
        })
    }

    async fn get_host(&self, name: &str) -> BillingResult<Option<Host>> {
        let host = sqlx::query_as(&format!("SELECT {HOST_COLUMNS} FROM hosts WHERE name = $1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(host)
    }

    async fn list_active_hosts(&self) -> BillingResult<Vec<Host>> {
        let hosts = sqlx::query_as(&format!(
            "SELECT {HOST_COLUMNS} FROM hosts WHERE is_active ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(hosts)
    }

    async fn deactivate_host(&self, name: &str) -> BillingResult<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("UPDATE hosts SET is_active = FALSE WHERE name = $1 AND is_active")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE plans SET is_active = FALSE, retired_at = NOW() WHERE host_name = $1 AND is_active",
        )
        .bind(name)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn create_plan(&self, plan: &NewPlan) -> BillingResult<Plan> {
        plan.validate()?;
        if self.get_host(&plan.host_name).await?.is_none() {
            return Err(BillingError::not_found("host", &plan.host_name));
        }
        let row = sqlx::query_as(&format!(
            r#"
            INSERT INTO plans (host_name, name, months, price_minor)
            VALUES ($1, $2, $3, $4)
            RETURNING {PLAN_COLUMNS}
            "#
        ))
        .bind(&plan.host_name)
        .bind(&plan.name)
        .bind(plan.months)
        .bind(plan.price_minor)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_plan(&self, id: i64) -> BillingResult<Option<Plan>> {
        let plan = sqlx::query_as(&format!("SELECT {PLAN_COLUMNS} FROM plans WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(plan)
    }

    async fn list_active_plans(&self, host_name: &str) -> BillingResult<Vec<Plan>> {
        let plans = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM plans WHERE host_name = $1 AND is_active ORDER BY months, id"
        ))
        .bind(host_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }

    async fn replace_plan(&self, id: i64, name: &str, price_minor: i64) -> BillingResult<Plan> {
        let mut tx = self.pool.begin().await?;
        let retired: Option<(String, i32)> = sqlx::query_as(
            r#"
            UPDATE plans SET is_active = FALSE, retired_at = NOW()
            WHERE id = $1 AND is_active
            RETURNING host_name, months
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((host_name, months)) = retired else {
            return Err(BillingError::not_found("plan", id));
        };
        NewPlan {
            host_name: host_name.clone(),
            name: name.to_string(),
            months,
            price_minor,
        }
        .validate()?;
        let plan: Plan = sqlx::query_as(&format!(
            r#"
            INSERT INTO plans (host_name, name, months, price_minor)
            VALUES ($1, $2, $3, $4)
            RETURNING {PLAN_COLUMNS}
            "#
        ))
        .bind(&host_name)
        .bind(name)
        .bind(months)
        .bind(price_minor)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(plan)
    }

    async fn retire_plan(&self, id: i64) -> BillingResult<bool> {
        let result = sqlx::query(
            "UPDATE plans SET is_active = FALSE, retired_at = NOW() WHERE id = $1 AND is_active",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_credential(&self, id: i64) -> BillingResult<Option<Credential>> {
        let credential = sqlx::query_as(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(credential)
    }

    async fn find_credential(
        &self,
        host_name: &str,
        label: &str,
    ) -> BillingResult<Option<Credential>> {
        let credential = sqlx::query_as(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE host_name = $1 AND label = $2"
        ))
        .bind(host_name)
        .bind(label)
        .fetch_optional(&self.pool)
        .await?;
        Ok(credential)
    }

    async fn list_user_credentials(&self, user_id: UserId) -> BillingResult<Vec<Credential>> {
        let credentials = sqlx::query_as(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE user_id = $1 ORDER BY expires_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(credentials)
    }

    async fn delete_credential(&self, id: i64) -> BillingResult<bool> {
        let result = sqlx::query("DELETE FROM credentials WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_payment(&self, new: &NewPayment) -> BillingResult<Payment> {
        Self::insert_payment(&self.pool, new).await?;
        self.get_payment(&new.external_id)
            .await?
            .ok_or_else(|| BillingError::not_found("payment", &new.external_id))
    }

    async fn get_payment(&self, external_id: &str) -> BillingResult<Option<Payment>> {
        let row: Option<PaymentRow> = sqlx::query_as(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Payment::try_from).transpose()
    }

    async fn claim_payment(
        &self,
        external_id: &str,
        new: Option<&NewPayment>,
        token: Uuid,
    ) -> BillingResult<Option<ClaimOutcome>> {
        let mut tx = self.pool.begin().await?;

        if let Some(new) = new {
            sqlx::query("INSERT INTO users (id) VALUES ($1) ON CONFLICT (id) DO NOTHING")
                .bind(new.metadata.user_id)
                .execute(&mut *tx)
                .await?;
            Self::insert_payment(&mut *tx, new).await?;
        }

        let won: Option<PaymentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payments SET
                state = 'claimed',
                claim_token = $2,
                claimed_at = NOW(),
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE external_id = $1 AND state = 'pending'
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(external_id)
        .bind(token)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match won {
            Some(row) => Some(ClaimOutcome::Won(ClaimedPayment {
                payment: row.try_into()?,
                token,
            })),
            None => {
                let state: Option<(String,)> =
                    sqlx::query_as("SELECT state FROM payments WHERE external_id = $1")
                        .bind(external_id)
                        .fetch_optional(&mut *tx)
                        .await?;
                match state {
                    None => None,
                    Some((state,)) => Some(match state.parse()? {
                        PaymentState::Claimed => ClaimOutcome::AlreadyClaimed,
                        PaymentState::Fulfilled => ClaimOutcome::AlreadyFulfilled,
                        other => ClaimOutcome::Terminal(other),
                    }),
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn record_checkpoint(
        &self,
        external_id: &str,
        token: Uuid,
        checkpoint: &ProvisionCheckpoint,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE payments SET
                provisioned_remote_id = $3,
                provisioned_label = $4,
                provisioned_expires_at = $5,
                provisioned_confirmed = $6,
                updated_at = NOW()
            WHERE external_id = $1 AND state = 'claimed' AND claim_token = $2
            "#,
        )
        .bind(external_id)
        .bind(token)
        .bind(&checkpoint.remote_id)
        .bind(&checkpoint.label)
        .bind(checkpoint.expires_at)
        .bind(checkpoint.confirmed)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::ClaimLost(external_id.to_string()));
        }
        Ok(())
    }

    async fn find_open_intent(
        &self,
        host_name: &str,
        label: &str,
        excluding: &str,
    ) -> BillingResult<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT external_id FROM payments
            WHERE host_name = $1
              AND provisioned_label = $2
              AND NOT provisioned_confirmed
              AND external_id <> $3
              AND state IN ('pending', 'claimed', 'failed')
            LIMIT 1
            "#,
        )
        .bind(host_name)
        .bind(label)
        .bind(excluding)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn commit_fulfillment(&self, record: &FulfillmentRecord) -> BillingResult<CommitResult> {
        let mut tx = self.pool.begin().await?;

        // Lock the payment row; a stale token aborts before any write.
        let owned: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM payments
            WHERE external_id = $1 AND state = 'claimed' AND claim_token = $2
            FOR UPDATE
            "#,
        )
        .bind(&record.external_id)
        .bind(record.claim_token)
        .fetch_optional(&mut *tx)
        .await?;
        if owned.is_none() {
            return Err(BillingError::ClaimLost(record.external_id.clone()));
        }

        let upserted: UpsertedCredential = sqlx::query_as(&format!(
            r#"
            INSERT INTO credentials (user_id, host_name, remote_id, label, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (host_name, label) DO UPDATE SET
                remote_id = EXCLUDED.remote_id,
                expires_at = EXCLUDED.expires_at,
                updated_at = NOW()
            RETURNING {CREDENTIAL_COLUMNS}, (xmax = 0) AS inserted
            "#
        ))
        .bind(record.user_id)
        .bind(&record.host_name)
        .bind(&record.remote_id)
        .bind(&record.label)
        .bind(record.expires_at)
        .fetch_one(&mut *tx)
        .await?;

        let logged: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO transactions (payment_id, user_id, username, amount_minor, method, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (payment_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&record.external_id)
        .bind(record.user_id)
        .bind(&record.username)
        .bind(record.amount_minor)
        .bind(record.method.as_str())
        .bind(&record.metadata)
        .fetch_optional(&mut *tx)
        .await?;

        // Totals move only together with a new transaction row.
        if logged.is_some() {
            sqlx::query(
                r#"
                UPDATE users SET
                    total_spent_minor = total_spent_minor + $2,
                    total_months = total_months + $3,
                    trial_used = trial_used OR $4
                WHERE id = $1
                "#,
            )
            .bind(record.user_id)
            .bind(record.amount_minor)
            .bind(record.months)
            .bind(record.is_trial)
            .execute(&mut *tx)
            .await?;
        }

        let mut referral_credited = false;
        if let Some(award) = record.referral {
            let credited: Option<(i64,)> = sqlx::query_as(
                r#"
                INSERT INTO referral_credits (referrer_id, referee_id, payment_id, amount_minor)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (referrer_id, payment_id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(award.referrer_id)
            .bind(record.user_id)
            .bind(&record.external_id)
            .bind(award.amount_minor)
            .fetch_optional(&mut *tx)
            .await?;
            if credited.is_some() {
                sqlx::query(
                    "UPDATE users SET referral_balance_minor = referral_balance_minor + $2 WHERE id = $1",
                )
                .bind(award.referrer_id)
                .bind(award.amount_minor)
                .execute(&mut *tx)
                .await?;
                referral_credited = true;
            }
        }

        sqlx::query(
            r#"
            UPDATE payments SET
                state = 'fulfilled',
                claim_token = NULL,
                last_error = NULL,
                fulfilled_at = NOW(),
                updated_at = NOW()
            WHERE external_id = $1 AND claim_token = $2
            "#,
        )
        .bind(&record.external_id)
        .bind(record.claim_token)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CommitResult {
            credential: upserted.credential,
            credential_created: upserted.inserted,
            referral_credited,
        })
    }

    async fn release_claim(
        &self,
        external_id: &str,
        token: Uuid,
        error: &str,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments SET
                state = 'pending',
                claim_token = NULL,
                claimed_at = NULL,
                last_error = $3,
                updated_at = NOW()
            WHERE external_id = $1 AND state = 'claimed' AND claim_token = $2
            "#,
        )
        .bind(external_id)
        .bind(token)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, external_id: &str, token: Uuid, error: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments SET
                state = 'failed',
                claim_token = NULL,
                last_error = $3,
                updated_at = NOW()
            WHERE external_id = $1 AND state = 'claimed' AND claim_token = $2
            "#,
        )
        .bind(external_id)
        .bind(token)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
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
        let result = sqlx::query(
            r#"
            UPDATE payments SET state = $2, last_error = $3, updated_at = NOW()
            WHERE external_id = $1 AND state = 'pending'
            "#,
        )
        .bind(external_id)
        .bind(state.as_str())
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reset_failed(&self, external_id: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments SET
                state = 'pending',
                attempts = 0,
                claim_token = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE external_id = $1 AND state = 'failed'
            "#,
        )
        .bind(external_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_pending(&self, after_id: i64, limit: i64) -> BillingResult<Vec<Payment>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS} FROM payments
            WHERE state = 'pending' AND id > $1
            ORDER BY id
            LIMIT $2
            "#
        ))
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Payment::try_from).collect()
    }

    async fn reclaim_stale(
        &self,
        older_than: Duration,
        limit: i64,
    ) -> BillingResult<Vec<ClaimedPayment>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payments SET
                claim_token = gen_random_uuid(),
                claimed_at = NOW(),
                attempts = attempts + 1,
                last_error = 'recovered from stale claim',
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM payments
                WHERE state = 'claimed'
                  AND claimed_at < NOW() - make_interval(secs => $1)
                ORDER BY claimed_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(older_than.as_secs_f64())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let payment = Payment::try_from(row)?;
                let token = payment
                    .claim_token
                    .ok_or_else(|| BillingError::Database("reclaimed row without token".into()))?;
                Ok(ClaimedPayment { payment, token })
            })
            .collect()
    }

    async fn list_transactions(&self, user_id: UserId) -> BillingResult<Vec<Transaction>> {
        let rows = sqlx::query_as(
            r#"
            SELECT id, payment_id, user_id, username, amount_minor, method, metadata, created_at
            FROM transactions WHERE user_id = $1 ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_referral_credits(
        &self,
        referrer_id: UserId,
    ) -> BillingResult<Vec<ReferralCredit>> {
        let rows = sqlx::query_as(
            r#"
            SELECT id, referrer_id, referee_id, payment_id, amount_minor, created_at
            FROM referral_credits WHERE referrer_id = $1 ORDER BY created_at
            "#,
        )
        .bind(referrer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn stats(&self, now: OffsetDateTime) -> BillingResult<LedgerStats> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM users) AS users,
                (SELECT COUNT(*) FROM users WHERE is_banned) AS banned_users,
                (SELECT COUNT(*) FROM credentials) AS credentials,
                (SELECT COUNT(*) FROM credentials WHERE expires_at > $1) AS active_credentials,
                (SELECT COUNT(*) FROM transactions) AS transactions,
                (SELECT COALESCE(SUM(amount_minor), 0)::BIGINT FROM transactions) AS revenue_minor,
                (SELECT COUNT(*) FROM payments WHERE state = 'pending') AS pending_payments,
                (SELECT COUNT(*) FROM payments WHERE state = 'failed') AS failed_payments
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(LedgerStats {
            users: row.users,
            banned_users: row.banned_users,
            credentials: row.credentials,
            active_credentials: row.active_credentials,
            transactions: row.transactions,
            revenue_minor: row.revenue_minor,
            pending_payments: row.pending_payments,
            failed_payments: row.failed_payments,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StatsRow {
    users: i64,
    banned_users: i64,
    credentials: i64,
    active_credentials: i64,
    transactions: i64,
    revenue_minor: i64,
    pending_payments: i64,
    failed_payments: i64,
}
