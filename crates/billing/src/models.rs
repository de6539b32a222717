//! Ledger domain types
//!
//! Money is carried in minor units (kopecks) as `i64`, mirroring how the
//! providers settle. Timestamps are UTC `OffsetDateTime`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Chat-platform user id. Users are keyed by the id the front-end sees.
pub type UserId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub total_spent_minor: i64,
    pub total_months: i32,
    pub referred_by: Option<UserId>,
    pub referral_balance_minor: i64,
    pub is_banned: bool,
    pub trial_used: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl User {
    /// True until the first revenue-bearing purchase has been fulfilled.
    pub fn is_first_purchase(&self) -> bool {
        self.total_spent_minor == 0
    }
}

#[derive(Clone, sqlx::FromRow)]
pub struct Host {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub inbound_id: i32,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .field("inbound_id", &self.inbound_id)
            .field("is_active", &self.is_active)
            .finish()
    }
}

impl Host {
    /// Lowercased host name without whitespace, used inside credential labels.
    pub fn slug(&self) -> String {
        self.name
            .chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewHost {
    pub name: String,
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub inbound_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub id: i64,
    pub host_name: String,
    pub name: String,
    pub months: i32,
    pub price_minor: i64,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub retired_at: Option<OffsetDateTime>,
}

impl Plan {
    pub fn duration_days(&self) -> i32 {
        self.months * DAYS_PER_MONTH
    }
}

/// A purchased month is provisioned as a fixed thirty days.
pub const DAYS_PER_MONTH: i32 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct NewPlan {
    pub host_name: String,
    pub name: String,
    pub months: i32,
    pub price_minor: i64,
}

impl NewPlan {
    pub fn validate(&self) -> BillingResult<()> {
        if self.months <= 0 {
            return Err(BillingError::Validation("plan months must be positive".into()));
        }
        if self.price_minor < 0 {
            return Err(BillingError::Validation("plan price must not be negative".into()));
        }
        if self.name.trim().is_empty() {
            return Err(BillingError::Validation("plan name must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Credential {
    pub id: i64,
    pub user_id: UserId,
    pub host_name: String,
    pub remote_id: String,
    pub label: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Credential {
    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        self.expires_at > now
    }
}

/// Processing state of a payment.
///
/// `fulfilled`, `failed` and `expired` are terminal for automatic processing;
/// only an operator moves `failed` back to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentState {
    Pending,
    Claimed,
    Fulfilled,
    Failed,
    Expired,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Pending => "pending",
            PaymentState::Claimed => "claimed",
            PaymentState::Fulfilled => "fulfilled",
            PaymentState::Failed => "failed",
            PaymentState::Expired => "expired",
        }
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentState {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentState::Pending),
            "claimed" => Ok(PaymentState::Claimed),
            "fulfilled" => Ok(PaymentState::Fulfilled),
            "failed" => Ok(PaymentState::Failed),
            "expired" => Ok(PaymentState::Expired),
            other => Err(BillingError::Database(format!("unknown payment state '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    /// Bank card / SBP gateway.
    YooKassa,
    /// Crypto-asset invoicing.
    CryptoBot,
    /// Free trial, never touches a provider.
    Trial,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::YooKassa => "yookassa",
            PaymentMethod::CryptoBot => "cryptobot",
            PaymentMethod::Trial => "trial",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yookassa" => Ok(PaymentMethod::YooKassa),
            "cryptobot" => Ok(PaymentMethod::CryptoBot),
            "trial" => Ok(PaymentMethod::Trial),
            other => Err(BillingError::Validation(format!("unknown payment method '{other}'"))),
        }
    }
}

/// What the purchaser intends the payment to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PurchaseIntent {
    Trial,
    Purchase,
    Renewal { credential_id: i64 },
}

impl PurchaseIntent {
    pub fn is_trial(&self) -> bool {
        matches!(self, PurchaseIntent::Trial)
    }
}

/// Typed invoice metadata.
///
/// Sent to the provider at checkout and echoed back on completion, so a
/// payment row can be materialized even if the completion signal is the
/// first time this process hears about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceMetadata {
    pub user_id: UserId,
    pub plan_id: Option<i64>,
    pub host_name: String,
    pub months: i32,
    pub duration_days: i32,
    pub price_minor: i64,
    pub method: PaymentMethod,
    pub intent: PurchaseIntent,
}

impl InvoiceMetadata {
    pub fn is_revenue_bearing(&self) -> bool {
        !self.intent.is_trial() && self.price_minor > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub external_id: String,
    pub metadata: InvoiceMetadata,
}

/// What a completion signal tells us about a payment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionPayload {
    /// Amount the provider reports as paid, when it reports one.
    pub paid_amount_minor: Option<i64>,
    pub metadata: Option<InvoiceMetadata>,
}

/// Target state of the panel client for a payment.
///
/// Written before the panel write (`confirmed == false`) and again once the
/// panel is read back holding it. A resumed fulfillment writes this target
/// instead of recomputing one, so the credential is never extended twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionCheckpoint {
    pub remote_id: String,
    pub label: String,
    pub expires_at: OffsetDateTime,
    pub confirmed: bool,
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub id: i64,
    pub external_id: String,
    pub user_id: UserId,
    pub plan_id: Option<i64>,
    pub host_name: String,
    pub months: i32,
    pub duration_days: i32,
    pub amount_minor: i64,
    pub method: PaymentMethod,
    pub intent: PurchaseIntent,
    pub state: PaymentState,
    pub claim_token: Option<Uuid>,
    pub claimed_at: Option<OffsetDateTime>,
    pub attempts: i32,
    pub checkpoint: Option<ProvisionCheckpoint>,
    pub last_error: Option<String>,
    pub fulfilled_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Payment {
    pub fn is_revenue_bearing(&self) -> bool {
        !self.intent.is_trial() && self.amount_minor > 0
    }

    /// Metadata snapshot written to the transaction log.
    pub fn metadata(&self) -> InvoiceMetadata {
        InvoiceMetadata {
            user_id: self.user_id,
            plan_id: self.plan_id,
            host_name: self.host_name.clone(),
            months: self.months,
            duration_days: self.duration_days,
            price_minor: self.amount_minor,
            method: self.method,
            intent: self.intent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Transaction {
    pub id: i64,
    pub payment_id: String,
    pub user_id: UserId,
    pub username: String,
    pub amount_minor: i64,
    pub method: String,
    pub metadata: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReferralCredit {
    pub id: i64,
    pub referrer_id: UserId,
    pub referee_id: UserId,
    pub payment_id: String,
    pub amount_minor: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Format minor units as a decimal string with two places ("300.00").
pub fn format_minor(amount_minor: i64) -> String {
    let sign = if amount_minor < 0 { "-" } else { "" };
    let abs = amount_minor.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// Parse a provider decimal amount ("300", "300.5", "300.00") into minor units.
pub fn parse_minor(value: &str) -> Option<i64> {
    let value = value.trim();
    let (whole, frac) = match value.split_once('.') {
        Some((w, f)) => (w, f),
        None => (value, ""),
    };
    if whole.is_empty() || frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = whole.parse().ok()?;
    if whole < 0 {
        return None;
    }
    let frac: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        _ => frac.parse().ok()?,
    };
    whole.checked_mul(100)?.checked_add(frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_minor() {
        assert_eq!(format_minor(30000), "300.00");
        assert_eq!(format_minor(27005), "270.05");
        assert_eq!(format_minor(7), "0.07");
        assert_eq!(format_minor(-150), "-1.50");
    }

    #[test]
    fn test_parse_minor() {
        assert_eq!(parse_minor("300.00"), Some(30000));
        assert_eq!(parse_minor("300"), Some(30000));
        assert_eq!(parse_minor("270.5"), Some(27050));
        assert_eq!(parse_minor(" 0.07 "), Some(7));
        assert_eq!(parse_minor("1.234"), None);
        assert_eq!(parse_minor("abc"), None);
        assert_eq!(parse_minor("-5.00"), None);
        assert_eq!(parse_minor(".50"), None);
    }

    #[test]
    fn test_host_slug_strips_whitespace_and_case() {
        let host = Host {
            id: 1,
            name: "NL Amsterdam 1".into(),
            base_url: "https://nl.example.com:54321".into(),
            username: "admin".into(),
            password: "secret".into(),
            inbound_id: 1,
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
        };
        assert_eq!(host.slug(), "nlamsterdam1");
        assert!(!format!("{host:?}").contains("secret"));
    }

    #[test]
    fn test_intent_serde_shape() {
        let json = serde_json::to_value(PurchaseIntent::Renewal { credential_id: 9 }).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "renewal", "credential_id": 9}));
        let back: PurchaseIntent = serde_json::from_value(serde_json::json!({"kind": "trial"})).unwrap();
        assert_eq!(back, PurchaseIntent::Trial);
    }

    #[test]
    fn test_payment_state_round_trip_strings() {
        for state in [
            PaymentState::Pending,
            PaymentState::Claimed,
            PaymentState::Fulfilled,
            PaymentState::Failed,
            PaymentState::Expired,
        ] {
            assert_eq!(state.as_str().parse::<PaymentState>().unwrap(), state);
        }
        assert!("done".parse::<PaymentState>().is_err());
    }
}
