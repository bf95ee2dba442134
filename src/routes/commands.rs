//! Device command routes.
//!
//! - `GET  /devices/{device_id}/commands` – device poll (claims pending commands)
//! - `POST /devices/{device_id}/commands` – manual or assistant issue
//! - `POST /commands/{id}/ack` – device reports executed/failed
//! - `POST /commands/{id}/cancel` – withdraw a pending command

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::{
    commands::AckStatus,
    models::{CommandSource, DeviceCommand, NewCommand},
    AppState,
};

use super::{ApiError, UserId};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/devices/{device_id}/commands", get(poll).post(issue))
        .route("/commands/{id}/ack", post(ack))
        .route("/commands/{id}/cancel", post(cancel))
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    limit: Option<usize>,
}

/// What a device needs to execute a command.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PolledCommand {
    id: Uuid,
    actuator: String,
    state: String,
    duration_seconds: Option<u32>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<DeviceCommand> for PolledCommand {
    fn from(command: DeviceCommand) -> Self {
        PolledCommand {
            id: command.id,
            actuator: command.actuator,
            state: command.state,
            duration_seconds: command.duration_seconds,
            issued_at: command.issued_at,
            expires_at: command.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PollResponse {
    device_id: String,
    commands: Vec<PolledCommand>,
}

async fn poll(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(device_id): Path<String>,
    Query(params): Query<PollQuery>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    let now = Utc::now();
    state.presence.touch(&user_id, &device_id, now);

    let delivered = state
        .commands
        .poll(&user_id, &device_id, params.limit, now)
        .await?;

    Ok(Json(PollResponse {
        device_id,
        commands: delivered.into_iter().map(PolledCommand::from).collect(),
    }))
}

#[derive(Debug, Deserialize)]
struct AckBody {
    status: String,
    message: Option<String>,
}

async fn ack(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<Uuid>,
    Json(body): Json<AckBody>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    let status: AckStatus = body.status.parse()?;
    state
        .commands
        .acknowledge(&user_id, id, status, body.message.as_deref(), Utc::now())
        .await?;

    Ok(Json(json!({ "success": true })))
}

async fn cancel(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    let command = state.commands.cancel(&user_id, id, Utc::now()).await?;
    Ok(Json(command))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueBody {
    actuator: String,
    state: String,
    duration_seconds: Option<u32>,
    /// `manual` (default) or `assistant`.
    source: Option<String>,
}

async fn issue(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(device_id): Path<String>,
    Json(body): Json<IssueBody>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    let source = match body.source.as_deref() {
        None => CommandSource::Manual,
        Some(raw) => match raw.parse::<CommandSource>().map_err(ApiError::bad_request)? {
            CommandSource::Automation => {
                return Err(ApiError::bad_request(
                    "automation commands are issued by rules only",
                ))
            }
            source => source,
        },
    };
    if body.actuator.trim().is_empty() || body.state.trim().is_empty() {
        return Err(ApiError::bad_request("actuator and state are required"));
    }

    let command = state
        .commands
        .issue(
            NewCommand {
                user_id,
                device_id,
                actuator: body.actuator,
                state: body.state,
                duration_seconds: body.duration_seconds,
                source,
                rule_id: None,
            },
            Utc::now(),
        )
        .await?;

    info!(command_id = %command.id, source = source.as_str(), "command issued over API");
    Ok((StatusCode::CREATED, Json(command)))
}
