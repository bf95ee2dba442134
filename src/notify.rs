//! Event bus adapters that forward core events to external collaborators.
//!
//! - [`spawn_log_forwarder`] writes every event to the tracing log
//! - [`spawn_webhook_forwarder`] POSTs each event as JSON to a configured URL
//!
//! Both loops survive a lagging receiver and stop when the bus is dropped.

use serde::Serialize;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::events::{BusEvent, EventBus, Published};

// ---

/// Body sent to the webhook.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookBody<'a> {
    user_id: &'a str,
    #[serde(flatten)]
    event: &'a BusEvent,
}

/// Log every published event at `info` level.
pub fn spawn_log_forwarder(bus: &EventBus) -> JoinHandle<()> {
    // ---
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(Published { user_id, event }) => {
                    info!(event = event.name(), user_id = %user_id, "realtime event");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "log forwarder lagged behind the event bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Forward every published event to `url`.
///
/// Delivery is best effort: failures are logged and the next event is sent
/// regardless.
pub fn spawn_webhook_forwarder(bus: &EventBus, url: String) -> JoinHandle<()> {
    // ---
    let mut rx = bus.subscribe();
    let client = reqwest::Client::new();
    tokio::spawn(async move {
        loop {
            let published = match rx.recv().await {
                Ok(published) => published,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "webhook forwarder lagged behind the event bus");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let body = WebhookBody {
                user_id: &published.user_id,
                event: &published.event,
            };
            match client.post(&url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(event = published.event.name(), "webhook delivered");
                }
                Ok(response) => {
                    warn!(
                        event = published.event.name(),
                        status = %response.status(),
                        "webhook rejected event"
                    );
                }
                Err(e) => {
                    warn!(event = published.event.name(), error = %e, "webhook delivery failed");
                }
            }
        }
    })
}
