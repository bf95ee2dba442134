//! `POST /readings`: sensor batch ingestion.
//!
//! Readings are appended, presence is refreshed, and each (device) slice of
//! the batch is run through the reactive alerter and the rule evaluator
//! concurrently.

use std::collections::BTreeMap;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    models::{Alert, DeviceCommand, Reading, SensorType},
    rules::TriggeredRule,
    AppState,
};

use super::{ApiError, UserId};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/readings", post(handler))
}

#[derive(Debug, Deserialize)]
struct IngestBody {
    readings: Vec<IngestReading>,
}

/// Wire shape of one reading. `userId` is optional; when present it must
/// match the caller.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestReading {
    user_id: Option<String>,
    device_id: String,
    #[serde(rename = "type")]
    sensor_type: SensorType,
    value: f64,
    unit: Option<String>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestResponse {
    accepted: usize,
    alerts: Vec<Alert>,
    triggered_rules: Vec<TriggeredRule>,
    commands: Vec<DeviceCommand>,
}

fn into_readings(user_id: &str, body: IngestBody) -> Result<Vec<Reading>, ApiError> {
    // ---
    body.readings
        .into_iter()
        .map(|r| {
            if let Some(owner) = r.user_id.as_deref() {
                if owner != user_id {
                    return Err(ApiError::new(
                        StatusCode::FORBIDDEN,
                        "reading belongs to another user",
                    ));
                }
            }
            if r.device_id.trim().is_empty() {
                return Err(ApiError::bad_request("deviceId must not be empty"));
            }
            let unit = r
                .unit
                .unwrap_or_else(|| r.sensor_type.default_unit().to_string());
            Ok(Reading {
                user_id: user_id.to_string(),
                device_id: r.device_id,
                sensor_type: r.sensor_type,
                value: r.value,
                unit,
                timestamp: r.timestamp,
            })
        })
        .collect()
}

async fn handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(body): Json<IngestBody>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    let readings = into_readings(&user_id, body)?;
    let now = Utc::now();
    let mut response = IngestResponse {
        accepted: readings.len(),
        ..IngestResponse::default()
    };
    if readings.is_empty() {
        return Ok(Json(response));
    }

    state.stores.readings.append(&readings).await?;
    debug!(user_id = %user_id, count = readings.len(), "readings appended");

    let mut by_device: BTreeMap<String, Vec<Reading>> = BTreeMap::new();
    for reading in readings {
        by_device
            .entry(reading.device_id.clone())
            .or_default()
            .push(reading);
    }

    for (device_id, batch) in by_device {
        state.presence.touch(&user_id, &device_id, now);

        let (alerts, evaluation) = tokio::join!(
            state.reactive.process(&batch, now),
            state.evaluator.evaluate(&user_id, &device_id, &batch, now),
        );
        response.alerts.extend(alerts);
        response.triggered_rules.extend(evaluation.triggered);
        response.commands.extend(evaluation.commands);
    }

    info!(
        user_id = %user_id,
        accepted = response.accepted,
        alerts = response.alerts.len(),
        triggered = response.triggered_rules.len(),
        "ingestion batch processed"
    );
    Ok(Json(response))
}
