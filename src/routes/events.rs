//! `GET /events`: server-sent events for the caller's bus events.
//!
//! The SSE `event` field carries the realtime name (`newAlert`,
//! `proactiveAlerts`, ...) and `data` its JSON payload.

use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    Stream, StreamExt,
};
use tracing::{debug, warn};

use crate::{events::Published, AppState};

use super::UserId;

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/events", get(handler))
}

fn to_sse(published: &Published) -> Option<Event> {
    // ---
    let mut value = serde_json::to_value(&published.event).ok()?;
    let payload = value.get_mut("payload").map(serde_json::Value::take)?;
    Event::default()
        .event(published.event.name())
        .json_data(payload)
        .ok()
}

async fn handler(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // ---
    debug!(user_id = %user_id, "event stream opened");

    let stream = BroadcastStream::new(state.bus.subscribe()).filter_map(move |item| match item {
        Ok(published) if published.user_id == user_id => to_sse(&published).map(Ok),
        Ok(_) => None,
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(skipped, "event stream lagged");
            None
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
