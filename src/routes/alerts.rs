//! `POST /alerts/{id}/resolve`: mark an alert handled so debounce no longer
//! holds back predictive alerts of the same category.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::json;
use uuid::Uuid;

use crate::AppState;

use super::{ApiError, UserId};

pub fn router() -> Router<AppState> {
    Router::new().route("/alerts/{id}/resolve", post(resolve))
}

async fn resolve(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    if !state.stores.alerts.resolve(&user_id, id).await? {
        return Err(ApiError::new(StatusCode::NOT_FOUND, format!("alert {id} not found")));
    }
    Ok(Json(json!({ "success": true })))
}
