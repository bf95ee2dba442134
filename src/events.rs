//! In-process event bus.
//!
//! The core publishes [`BusEvent`]s keyed by user and never talks to a
//! transport directly. Adapters in [`crate::notify`] and the SSE route
//! subscribe and forward events wherever they need to go.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{Alert, CommandStatus, Condition, DeviceCommand, SensorType};

// ---

/// Compact view of a command carried inside `automation:triggered`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSummary {
    pub id: Uuid,
    pub actuator: String,
    pub state: String,
    pub duration_seconds: Option<u32>,
    pub expires_at: DateTime<Utc>,
}

impl From<&DeviceCommand> for CommandSummary {
    fn from(command: &DeviceCommand) -> Self {
        CommandSummary {
            id: command.id,
            actuator: command.actuator.clone(),
            state: command.state.clone(),
            duration_seconds: command.duration_seconds,
            expires_at: command.expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationTriggered {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub metric: SensorType,
    pub condition_value: Condition,
    pub device_id: String,
    pub command: CommandSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandUpdate {
    pub id: Uuid,
    pub device_id: String,
    pub actuator: String,
    pub state: String,
    pub status: CommandStatus,
    pub result_message: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&DeviceCommand> for CommandUpdate {
    fn from(command: &DeviceCommand) -> Self {
        CommandUpdate {
            id: command.id,
            device_id: command.device_id.clone(),
            actuator: command.actuator.clone(),
            state: command.state.clone(),
            status: command.status,
            result_message: command.result_message.clone(),
            completed_at: command.completed_at,
        }
    }
}

/// Everything the core announces to the outside world.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum BusEvent {
    #[serde(rename = "automation:triggered")]
    AutomationTriggered(AutomationTriggered),

    #[serde(rename = "deviceCommandUpdate")]
    DeviceCommandUpdate(CommandUpdate),

    #[serde(rename = "newAlert")]
    NewAlert(Alert),

    #[serde(rename = "proactiveAlerts")]
    ProactiveAlerts(Vec<Alert>),
}

impl BusEvent {
    /// Realtime event name.
    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::AutomationTriggered(_) => "automation:triggered",
            BusEvent::DeviceCommandUpdate(_) => "deviceCommandUpdate",
            BusEvent::NewAlert(_) => "newAlert",
            BusEvent::ProactiveAlerts(_) => "proactiveAlerts",
        }
    }
}

/// An event together with the user it belongs to.
#[derive(Debug, Clone)]
pub struct Published {
    pub user_id: String,
    pub event: BusEvent,
}

// ---

/// Broadcast fan-out of [`Published`] events. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Published>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event for `user_id`. Having no subscribers is not an error.
    pub fn publish(&self, user_id: &str, event: BusEvent) {
        // ---
        let name = event.name();
        let published = Published {
            user_id: user_id.to_string(),
            event,
        };
        match self.tx.send(published) {
            Ok(receivers) => tracing::trace!(event = name, user_id, receivers, "event published"),
            Err(_) => tracing::trace!(event = name, user_id, "event dropped, no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        // ---
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish("user-1", BusEvent::ProactiveAlerts(Vec::new()));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.user_id, "user-1");
        assert_eq!(got.event.name(), "proactiveAlerts");
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        // ---
        let bus = EventBus::new(1);
        bus.publish("user-1", BusEvent::ProactiveAlerts(Vec::new()));
    }

    #[test]
    fn test_wire_shape_uses_event_names() {
        // ---
        let json = serde_json::to_value(BusEvent::ProactiveAlerts(Vec::new())).unwrap();
        assert_eq!(json["event"], "proactiveAlerts");
        assert!(json["payload"].as_array().unwrap().is_empty());
    }
}
