use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use tunnelshop_billing::{Plan, User, UserId, UserProfile};

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct RegisterUser {
    pub user_id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub referrer_id: Option<UserId>,
}

/// Register on first contact; repeated calls return the existing user.
pub async fn register_user(State(state): State<AppState>, Json(body): Json<RegisterUser>) -> ApiResult<Json<User>> {
    let user = state
        .billing
        .checkout
        .ensure_user(body.user_id, &body.username, body.referrer_id)
        .await?;
    Ok(Json(user))
}

/// Spend, keys with their active flag, and referral earnings.
pub async fn get_profile(State(state): State<AppState>, Path(user_id): Path<UserId>) -> ApiResult<Json<UserProfile>> {
    Ok(Json(state.billing.checkout.profile(user_id).await?))
}

pub async fn list_plans(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Vec<Plan>>> {
    Ok(Json(state.billing.checkout.list_plans(&name).await?))
}
