//! Idempotency guard
//!
//! Every intake path (webhook, poll loop, manual check, trial) funnels through
//! [`IdempotencyGuard::claim`]; only a `Won` outcome may proceed to
//! fulfillment.

use std::sync::Arc;
use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{ClaimOutcome, LedgerStore};
use crate::models::{CompletionPayload, NewPayment};

/// Store round-trips attempted before a transient claim failure is surfaced.
const CLAIM_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn LedgerStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Claim exclusive processing rights for `payment_id`.
    ///
    /// If the payment is unknown locally it is materialized from the
    /// payload's invoice metadata first. Unknown with no metadata is
    /// `NotFound`.
    pub async fn claim(
        &self,
        payment_id: &str,
        payload: &CompletionPayload,
    ) -> BillingResult<ClaimOutcome> {
        let new = payload.metadata.clone().map(|metadata| NewPayment {
            external_id: payment_id.to_string(),
            metadata,
        });
        let token = Uuid::new_v4();

        let strategy = ExponentialBackoff::from_millis(50)
            .max_delay(Duration::from_secs(1))
            .map(jitter)
            .take(CLAIM_ATTEMPTS - 1);

        let outcome = RetryIf::spawn(
            strategy,
            || self.store.claim_payment(payment_id, new.as_ref(), token),
            |e: &BillingError| matches!(e, BillingError::Database(_)),
        )
        .await?;

        match outcome {
            Some(outcome) => {
                match &outcome {
                    ClaimOutcome::Won(claimed) => tracing::info!(
                        payment_id = %payment_id,
                        attempt = claimed.payment.attempts,
                        "Claimed payment for fulfillment"
                    ),
                    other => tracing::info!(
                        payment_id = %payment_id,
                        outcome = ?other,
                        "Duplicate completion signal ignored"
                    ),
                }
                Ok(outcome)
            }
            None => {
                tracing::warn!(
                    payment_id = %payment_id,
                    "Completion for unknown payment without invoice metadata"
                );
                Err(BillingError::not_found("payment", payment_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedgerStore;
    use crate::models::{InvoiceMetadata, PaymentMethod, PurchaseIntent};

    fn payload() -> CompletionPayload {
        CompletionPayload {
            paid_amount_minor: Some(30_000),
            metadata: Some(InvoiceMetadata {
                user_id: 5,
                plan_id: None,
                host_name: "nl-1".into(),
                months: 1,
                duration_days: 30,
                price_minor: 30_000,
                method: PaymentMethod::CryptoBot,
                intent: PurchaseIntent::Purchase,
            }),
        }
    }

    #[tokio::test]
    async fn test_exactly_one_winner_among_concurrent_claims() {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        let guard = IdempotencyGuard::new(store);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move {
                guard.claim("inv-1", &payload()).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), ClaimOutcome::Won(_)) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_unknown_payment_without_metadata_is_not_found() {
        let guard = IdempotencyGuard::new(Arc::new(MemoryLedgerStore::new()));
        let err = guard
            .claim("ghost", &CompletionPayload::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound { .. }));
    }
}
