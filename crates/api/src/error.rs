//! API error type
//!
//! Every failure maps to a short generic message; details go to the log.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tunnelshop_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid webhook")]
    InvalidWebhook,

    #[error("upstream unavailable")]
    Unavailable,

    #[error("internal error")]
    Internal,
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NotFound { kind, key } => {
                tracing::debug!(kind, key = %key, "Lookup missed");
                ApiError::NotFound
            }
            BillingError::Validation(msg) => ApiError::Validation(msg),
            BillingError::ProviderNotConfigured(method) => {
                ApiError::Validation(format!("payment method {method} is not available"))
            }
            BillingError::InvalidWebhook(reason) => {
                tracing::warn!(reason = %reason, "Rejected webhook");
                ApiError::InvalidWebhook
            }
            err @ (BillingError::TransientNetwork(_)
            | BillingError::Authentication { .. }
            | BillingError::Conflict { .. }
            | BillingError::Provider(_)) => {
                tracing::error!(error = %err, "Upstream call failed");
                ApiError::Unavailable
            }
            err @ (BillingError::Database(_) | BillingError::ClaimLost(_)) => {
                tracing::error!(error = %err, "Request failed");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Authentication required".to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string()),
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::InvalidWebhook => (StatusCode::BAD_REQUEST, "Invalid webhook".to_string()),
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily unavailable, try again later".to_string(),
            ),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string()),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
