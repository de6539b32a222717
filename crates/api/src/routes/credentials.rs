use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tunnelshop_billing::UserId;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct UriQuery {
    /// When set, the credential must belong to this user.
    pub user_id: Option<UserId>,
}

#[derive(Debug, Serialize)]
pub struct UriResponse {
    pub uri: String,
}

pub async fn connection_uri(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<UriQuery>,
) -> ApiResult<Json<UriResponse>> {
    let uri = state.billing.checkout.credential_uri(id, query.user_id).await?;
    Ok(Json(UriResponse { uri }))
}
