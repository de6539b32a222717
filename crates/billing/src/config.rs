//! Engine configuration
//!
//! Every knob has a default so the engine can run with nothing but a
//! database; payment rails are optional and an unconfigured rail is simply
//! not offered.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Tunables shared by the fulfillment pipeline.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub trial_enabled: bool,
    pub trial_duration_days: i32,
    pub enable_referrals: bool,
    /// Reward credited to the referrer, in basis points of the paid amount.
    pub referral_reward_bps: i64,
    /// Discount on a referred user's first purchase, in basis points.
    pub referral_discount_bps: i64,
    /// Claims older than this are considered abandoned by a crashed worker.
    pub claim_timeout: Duration,
    /// After this many failed attempts a payment is parked in `failed`.
    pub max_fulfill_attempts: i32,
    /// Per-request timeout for every remote call.
    pub remote_timeout: Duration,
    pub poll_batch_size: i64,
    /// Chat id that receives operator alerts.
    pub admin_chat_id: Option<i64>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            trial_enabled: true,
            trial_duration_days: 3,
            enable_referrals: true,
            referral_reward_bps: 1_000,
            referral_discount_bps: 1_000,
            claim_timeout: Duration::from_secs(30 * 60),
            max_fulfill_attempts: 5,
            remote_timeout: Duration::from_secs(15),
            poll_batch_size: 100,
            admin_chat_id: None,
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            trial_enabled: env_bool("TRIAL_ENABLED", defaults.trial_enabled),
            trial_duration_days: env_parse("TRIAL_DURATION_DAYS", defaults.trial_duration_days),
            enable_referrals: env_bool("ENABLE_REFERRALS", defaults.enable_referrals),
            referral_reward_bps: env_percent_bps("REFERRAL_PERCENTAGE", defaults.referral_reward_bps),
            referral_discount_bps: env_percent_bps(
                "REFERRAL_DISCOUNT",
                defaults.referral_discount_bps,
            ),
            claim_timeout: Duration::from_secs(
                env_parse::<u64>("CLAIM_TIMEOUT_MINUTES", 30).max(1) * 60,
            ),
            max_fulfill_attempts: env_parse("MAX_FULFILL_ATTEMPTS", defaults.max_fulfill_attempts)
                .max(1),
            remote_timeout: Duration::from_secs(env_parse::<u64>("REMOTE_TIMEOUT_SECS", 15).max(1)),
            poll_batch_size: env_parse("POLL_BATCH_SIZE", defaults.poll_batch_size).max(1),
            admin_chat_id: env::var("ADMIN_CHAT_ID").ok().and_then(|v| v.trim().parse().ok()),
        }
    }
}

pub(crate) fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key = %key, value = %raw, "Unparseable setting, using default");
                default
            }
        },
        Err(_) => default,
    }
}

pub(crate) fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Reads a percentage such as "10" or "7.5" and returns basis points.
fn env_percent_bps(key: &str, default_bps: i64) -> i64 {
    let pct: f64 = env_parse(key, default_bps as f64 / 100.0);
    if !(0.0..=100.0).contains(&pct) {
        tracing::warn!(key = %key, value = pct, "Percentage out of range, using default");
        return default_bps;
    }
    (pct * 100.0).round() as i64
}

/// Non-empty env var, or `None`.
pub(crate) fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear() {
        for key in [
            "TRIAL_ENABLED",
            "TRIAL_DURATION_DAYS",
            "ENABLE_REFERRALS",
            "REFERRAL_PERCENTAGE",
            "REFERRAL_DISCOUNT",
            "CLAIM_TIMEOUT_MINUTES",
            "MAX_FULFILL_ATTEMPTS",
            "ADMIN_CHAT_ID",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        clear();
        let config = BillingConfig::from_env();
        assert!(config.trial_enabled);
        assert_eq!(config.trial_duration_days, 3);
        assert_eq!(config.referral_reward_bps, 1_000);
        assert_eq!(config.claim_timeout, Duration::from_secs(1_800));
        assert_eq!(config.max_fulfill_attempts, 5);
        assert_eq!(config.admin_chat_id, None);
    }

    #[test]
    #[serial]
    fn test_overrides_from_env() {
        clear();
        env::set_var("TRIAL_ENABLED", "false");
        env::set_var("REFERRAL_DISCOUNT", "7.5");
        env::set_var("CLAIM_TIMEOUT_MINUTES", "45");
        env::set_var("ADMIN_CHAT_ID", "123456");
        let config = BillingConfig::from_env();
        assert!(!config.trial_enabled);
        assert_eq!(config.referral_discount_bps, 750);
        assert_eq!(config.claim_timeout, Duration::from_secs(45 * 60));
        assert_eq!(config.admin_chat_id, Some(123_456));
        clear();
    }

    #[test]
    #[serial]
    fn test_out_of_range_percentage_falls_back() {
        clear();
        env::set_var("REFERRAL_PERCENTAGE", "250");
        assert_eq!(BillingConfig::from_env().referral_reward_bps, 1_000);
        clear();
    }
}
