//! Checkout, trial and manual payment checks

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use tunnelshop_billing::{Checkout, CheckoutRequest, ManualCheck, Observation, UserId};

use crate::{error::ApiResult, state::AppState};

pub async fn create_checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<Checkout>> {
    let checkout = state.billing.checkout.create_checkout(&request).await?;
    Ok(Json(checkout))
}

#[derive(Debug, Deserialize)]
pub struct TrialRequest {
    pub user_id: UserId,
}

pub async fn start_trial(
    State(state): State<AppState>,
    Json(request): Json<TrialRequest>,
) -> ApiResult<Json<Observation>> {
    Ok(Json(state.billing.checkout.start_trial(request.user_id).await?))
}

/// Synchronous re-check of one payment against its provider.
pub async fn check_payment(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<ManualCheck>> {
    Ok(Json(state.billing.intake.manual_check(&id).await?))
}
