//! Front-end callback dispatch
//!
//! Accepts either the encoded button form (`"buy:3:cryptobot"`) or the
//! tagged JSON form of the action.

use axum::{extract::State, Json};
use serde::Deserialize;
use tunnelshop_billing::{ActionReply, CallbackAction, UserId};

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ActionInput {
    Encoded(String),
    Typed(CallbackAction),
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub user_id: UserId,
    pub action: ActionInput,
}

pub async fn dispatch_action(
    State(state): State<AppState>,
    Json(request): Json<ActionRequest>,
) -> ApiResult<Json<ActionReply>> {
    let action = match request.action {
        ActionInput::Encoded(raw) => raw.parse::<CallbackAction>()?,
        ActionInput::Typed(action) => action,
    };
    Ok(Json(state.billing.checkout.dispatch(request.user_id, action).await?))
}
