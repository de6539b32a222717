//! Provider webhooks
//!
//! Authenticity is checked before answering; the fulfillment itself runs in
//! a spawned task so the provider gets its 200 without waiting on a panel.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
};
use serde::Deserialize;
use tunnelshop_billing::{PaymentMethod, WebhookRequest};

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    pub token: Option<String>,
}

pub async fn yookassa(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    receive(&state, PaymentMethod::YooKassa, &headers, query.token.as_deref(), &body).await
}

pub async fn cryptobot(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> ApiResult<StatusCode> {
    receive(&state, PaymentMethod::CryptoBot, &headers, None, &body).await
}

async fn receive(
    state: &AppState,
    method: PaymentMethod,
    headers: &HeaderMap,
    query_token: Option<&str>,
    body: &[u8],
) -> ApiResult<StatusCode> {
    let request = WebhookRequest {
        headers,
        query_token,
        body,
    };
    let Some(event) = state.billing.intake.verify_webhook(method, &request).await? else {
        return Ok(StatusCode::OK);
    };

    tracing::info!(%method, payment_id = %event.payment_id, "Webhook accepted");
    let intake = state.billing.intake.clone();
    tokio::spawn(async move {
        let payment_id = event.payment_id.clone();
        match intake.apply_event(event).await {
            Ok(Some(observation)) => {
                tracing::info!(payment_id = %payment_id, ?observation, "Webhook processed")
            }
            Ok(None) => tracing::debug!(payment_id = %payment_id, "Webhook needed no action"),
            // The poll loop picks the payment up again.
            Err(e) => tracing::error!(payment_id = %payment_id, error = %e, "Webhook processing failed"),
        }
    });

    Ok(StatusCode::OK)
}
