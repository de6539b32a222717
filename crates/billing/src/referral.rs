//! Referral pricing and rewards.
//!
//! Rates are basis points; every result is rounded half-up to whole kopecks.

use crate::config::BillingConfig;
use crate::ledger::ReferralAward;
use crate::models::{Payment, User};

#[derive(Debug, Clone, Copy)]
pub struct ReferralPolicy {
    pub enabled: bool,
    pub reward_bps: i64,
    pub discount_bps: i64,
}

impl ReferralPolicy {
    pub fn from_config(config: &BillingConfig) -> Self {
        Self {
            enabled: config.enable_referrals,
            reward_bps: config.referral_reward_bps,
            discount_bps: config.referral_discount_bps,
        }
    }

    /// Price after the one-time referral discount. The discount applies only
    /// to a referred user who has never made a revenue-bearing purchase.
    pub fn checkout_price(&self, user: &User, list_price_minor: i64) -> (i64, bool) {
        let eligible = self.enabled
            && self.discount_bps > 0
            && list_price_minor > 0
            && user.referred_by.is_some()
            && user.is_first_purchase();
        if !eligible {
            return (list_price_minor, false);
        }
        let discount = share_of(list_price_minor, self.discount_bps);
        ((list_price_minor - discount).max(0), true)
    }

    /// Reward owed to the payer's referrer for a fulfilled payment.
    pub fn award(&self, payer: &User, payment: &Payment) -> Option<ReferralAward> {
        if !self.enabled || !payment.is_revenue_bearing() {
            return None;
        }
        let referrer_id = payer.referred_by.filter(|r| *r != payer.id)?;
        let amount_minor = share_of(payment.amount_minor, self.reward_bps);
        (amount_minor > 0).then_some(ReferralAward {
            referrer_id,
            amount_minor,
        })
    }
}

/// `amount * bps / 10_000`, rounded half-up.
pub fn share_of(amount_minor: i64, bps: i64) -> i64 {
    (amount_minor * bps + 5_000).div_euclid(10_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PaymentMethod, PaymentState, PurchaseIntent};
    use time::OffsetDateTime;

    fn policy() -> ReferralPolicy {
        ReferralPolicy {
            enabled: true,
            reward_bps: 1_000,
            discount_bps: 1_000,
        }
    }

    fn user(referred_by: Option<i64>, spent: i64) -> User {
        User {
            id: 10,
            username: "u".into(),
            total_spent_minor: spent,
            total_months: 0,
            referred_by,
            referral_balance_minor: 0,
            is_banned: false,
            trial_used: false,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn payment(amount: i64, intent: PurchaseIntent) -> Payment {
        let now = OffsetDateTime::now_utc();
        Payment {
            id: 1,
            external_id: "p".into(),
            user_id: 10,
            plan_id: Some(1),
            host_name: "nl".into(),
            months: 1,
            duration_days: 30,
            amount_minor: amount,
            method: PaymentMethod::YooKassa,
            intent,
            state: PaymentState::Claimed,
            claim_token: None,
            claimed_at: None,
            attempts: 1,
            checkpoint: None,
            last_error: None,
            fulfilled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_half_up_rounding() {
        assert_eq!(share_of(30_000, 1_000), 3_000);
        assert_eq!(share_of(15, 1_000), 2);
        assert_eq!(share_of(14, 1_000), 1);
        assert_eq!(share_of(12_345, 750), 926);
    }

    #[test]
    fn test_discount_only_on_first_purchase() {
        let p = policy();
        assert_eq!(p.checkout_price(&user(Some(1), 0), 30_000), (27_000, true));
        assert_eq!(p.checkout_price(&user(Some(1), 27_000), 30_000), (30_000, false));
        assert_eq!(p.checkout_price(&user(None, 0), 30_000), (30_000, false));
    }

    #[test]
    fn test_award_skips_trials_and_unreferred() {
        let p = policy();
        assert_eq!(
            p.award(&user(Some(1), 0), &payment(27_000, PurchaseIntent::Purchase)),
            Some(ReferralAward {
                referrer_id: 1,
                amount_minor: 2_700
            })
        );
        assert_eq!(p.award(&user(Some(1), 0), &payment(0, PurchaseIntent::Trial)), None);
        assert_eq!(p.award(&user(None, 0), &payment(30_000, PurchaseIntent::Purchase)), None);
    }

    #[test]
    fn test_disabled_policy_is_inert() {
        let p = ReferralPolicy {
            enabled: false,
            ..policy()
        };
        assert_eq!(p.checkout_price(&user(Some(1), 0), 30_000), (30_000, false));
        assert_eq!(
            p.award(&user(Some(1), 0), &payment(30_000, PurchaseIntent::Purchase)),
            None
        );
    }
}
