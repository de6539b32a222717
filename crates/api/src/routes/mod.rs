//! HTTP routes

pub mod actions;
pub mod admin;
pub mod credentials;
pub mod payments;
pub mod users;
pub mod webhooks;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_internal_token, state::AppState};

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let internal = Router::new()
        .route("/users", post(users::register_user))
        .route("/users/{id}", get(users::get_profile))
        .route("/hosts/{name}/plans", get(users::list_plans))
        .route("/checkout", post(payments::create_checkout))
        .route("/trial", post(payments::start_trial))
        .route("/payments/{id}/check", post(payments::check_payment))
        .route("/credentials/{id}/uri", get(credentials::connection_uri))
        .route("/actions", post(actions::dispatch_action))
        .nest("/admin", admin::router())
        .route_layer(middleware::from_fn_with_state(state.clone(), require_internal_token));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/yookassa", post(webhooks::yookassa))
        .route("/webhooks/cryptobot", post(webhooks::cryptobot))
        .merge(internal)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
