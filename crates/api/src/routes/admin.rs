//! Operator routes

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tunnelshop_billing::{Credential, Host, LedgerStats, ManualCheck, NewHost, NewPlan, Plan, UserId};

use crate::{error::ApiResult, state::AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(stats))
        .route("/payments/{id}/retry", post(retry_payment))
        .route("/credentials/{id}", delete(revoke_credential))
        .route("/users/{id}/ban", post(ban_user).delete(unban_user))
        .route("/hosts", post(create_host))
        .route("/hosts/{name}/deactivate", post(deactivate_host))
        .route("/plans", post(create_plan))
        .route("/plans/{id}", put(replace_plan).delete(retire_plan))
}

/// User, key and revenue totals.
pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<LedgerStats>> {
    Ok(Json(state.billing.checkout.stats().await?))
}

/// Host as shown to operators; the panel password never leaves the server.
#[derive(Debug, Serialize)]
pub struct HostView {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub inbound_id: i32,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<Host> for HostView {
    fn from(host: Host) -> Self {
        Self {
            id: host.id,
            name: host.name,
            base_url: host.base_url,
            inbound_id: host.inbound_id,
            is_active: host.is_active,
            created_at: host.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReplacePlan {
    pub name: String,
    pub price_minor: i64,
}

pub async fn retry_payment(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<ManualCheck>> {
    tracing::info!(payment_id = %id, "Operator retry requested");
    Ok(Json(state.billing.checkout.retry_failed(&id).await?))
}

pub async fn revoke_credential(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<Credential>> {
    Ok(Json(state.billing.checkout.revoke_credential(id).await?))
}

pub async fn ban_user(State(state): State<AppState>, Path(id): Path<UserId>) -> ApiResult<StatusCode> {
    state.billing.checkout.set_banned(id, true).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn unban_user(State(state): State<AppState>, Path(id): Path<UserId>) -> ApiResult<StatusCode> {
    state.billing.checkout.set_banned(id, false).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_host(State(state): State<AppState>, Json(host): Json<NewHost>) -> ApiResult<Json<HostView>> {
    Ok(Json(state.billing.checkout.create_host(&host).await?.into()))
}

pub async fn deactivate_host(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    state.billing.checkout.deactivate_host(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_plan(State(state): State<AppState>, Json(plan): Json<NewPlan>) -> ApiResult<Json<Plan>> {
    Ok(Json(state.billing.checkout.create_plan(&plan).await?))
}

/// Retire the plan and issue a successor; invoices already issued keep
/// their price.
pub async fn replace_plan(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<ReplacePlan>,
) -> ApiResult<Json<Plan>> {
    Ok(Json(
        state
            .billing
            .checkout
            .replace_plan(id, &body.name, body.price_minor)
            .await?,
    ))
}

pub async fn retire_plan(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<StatusCode> {
    state.billing.checkout.retire_plan(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
