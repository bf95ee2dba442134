//! `POST /devices/{device_id}/forecast`: on-demand forecast for one device.
//!
//! Query options narrow the run by minimum confidence and risk category.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::debug;

use crate::{
    forecast::ForecastOptions,
    models::RiskCategory,
    AppState,
};

use super::{ApiError, UserId};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/devices/{device_id}/forecast", post(handler))
}

/// `?minConfidence=70&categories=irrigation,disease`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForecastQuery {
    min_confidence: Option<u8>,
    categories: Option<String>,
}

impl ForecastQuery {
    fn into_options(self) -> Result<ForecastOptions, ApiError> {
        // ---
        let categories = match self.categories {
            None => None,
            Some(list) => Some(
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| s.parse::<RiskCategory>().map_err(ApiError::bad_request))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        };
        Ok(ForecastOptions {
            min_confidence: self.min_confidence,
            categories,
        })
    }
}

async fn handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(device_id): Path<String>,
    Query(params): Query<ForecastQuery>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    let options = params.into_options()?;
    debug!(device_id = %device_id, ?options, "on-demand forecast");

    let created = state
        .forecaster
        .run(&user_id, &device_id, Utc::now(), &options)
        .await?;
    Ok(Json(created))
}
