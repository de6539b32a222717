//! Billing error taxonomy
//!
//! Expected outcomes (duplicate completion, claim lost to another worker) are
//! modelled as return values elsewhere; this enum is for real failures.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Timeouts, connection resets, 5xx responses.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Bad operator credentials for a panel or provider.
    #[error("authentication failed for {target}")]
    Authentication { target: String },

    /// Panel write race detected; the read-modify-write must be recomputed.
    #[error("write conflict on host {host}: {detail}")]
    Conflict { host: String, detail: String },

    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid webhook: {0}")]
    InvalidWebhook(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("payment provider error: {0}")]
    Provider(String),

    #[error("payment method not configured: {0}")]
    ProviderNotConfigured(String),

    /// Our claim token no longer matches; another worker owns the payment.
    #[error("claim on payment {0} was lost")]
    ClaimLost(String),
}

impl BillingError {
    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    /// Errors worth an immediate re-fetch-and-recompute attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::Conflict { .. })
    }

    /// Configuration or data errors that will not heal by retrying; the
    /// payment is parked in `failed` until an operator intervenes.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Validation(_) | Self::ProviderNotConfigured(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => Self::not_found("row", "query returned no rows"),
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::Provider(format!("malformed response: {e}"));
        }
        if let Some(status) = e.status() {
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
            {
                return Self::Authentication {
                    target: e.url().map(|u| u.host_str().unwrap_or("").to_string()).unwrap_or_default(),
                };
            }
            if status.is_client_error() {
                return Self::Provider(format!("request rejected with {status}"));
            }
        }
        // Strip the URL: it may carry tokens in the path or query.
        Self::TransientNetwork(e.without_url().to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        Self::Provider(format!("invalid JSON: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(BillingError::TransientNetwork("timeout".into()).is_retryable());
        assert!(BillingError::Conflict {
            host: "nl-1".into(),
            detail: "entry vanished".into()
        }
        .is_retryable());
        assert!(!BillingError::Authentication {
            target: "nl-1".into()
        }
        .is_retryable());
        assert!(!BillingError::not_found("plan", 7).is_retryable());
    }

    #[test]
    fn test_permanent_classification() {
        assert!(BillingError::not_found("listener", 3).is_permanent());
        assert!(BillingError::Validation("bad".into()).is_permanent());
        assert!(!BillingError::TransientNetwork("reset".into()).is_permanent());
        assert!(!BillingError::Authentication {
            target: "nl-1".into()
        }
        .is_permanent());
    }
}
