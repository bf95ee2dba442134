//! `GET /devices/{device_id}/presence`: when the device last reported.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::AppState;

use super::UserId;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/devices/{device_id}/presence", get(handler))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceResponse {
    device_id: String,
    /// `null` when the device has never been heard from.
    last_seen: Option<DateTime<Utc>>,
}

async fn handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    // ---
    let last_seen = state.presence.last_seen(&user_id, &device_id);
    Json(PresenceResponse {
        device_id,
        last_seen,
    })
}
