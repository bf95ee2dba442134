//! HTTP gateway (EMBP).
//!
//! Each sibling file owns its handlers and exports a `router()`; this module
//! merges them, attaches the shared [`AppState`] and provides the pieces
//! every handler needs: the caller identity extractor and error responses.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use tracing::error;

use crate::{commands::CommandError, store::StoreError, AppState};

mod alerts;
mod commands;
mod events;
mod forecast;
mod health;
mod ingest;
mod presence;

/// Header carrying the authenticated caller.
pub const USER_HEADER: &str = "x-user-id";

// ---

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(ingest::router())
        .merge(commands::router())
        .merge(forecast::router())
        .merge(alerts::router())
        .merge(presence::router())
        .merge(events::router())
        .merge(health::router())
        .with_state(state)
}

// ---

/// Caller identity, set by the authenticating proxy in front of the service.
#[derive(Debug, Clone)]
pub struct UserId(pub String);

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // ---
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| UserId(v.to_string()))
            .ok_or_else(|| {
                ApiError::new(
                    StatusCode::UNAUTHORIZED,
                    format!("missing {USER_HEADER} header"),
                )
            })
    }
}

/// JSON error response: `{"error": "<message>"}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        // ---
        error!(error = %e, "store failure");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal storage error")
    }
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        // ---
        let status = match &e {
            CommandError::NotFound(_) => StatusCode::NOT_FOUND,
            CommandError::InvalidStatus(_) => StatusCode::BAD_REQUEST,
            CommandError::AlreadyTerminal { .. } | CommandError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            CommandError::Store(_) => {
                error!(error = %e, "command store failure");
                return ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal storage error");
            }
        };
        ApiError::new(status, e.to_string())
    }
}
