//! In-memory backend.
//!
//! One mutex guards all state, so every trait method is a single critical
//! section and the conditional writes are atomic by construction. Used by
//! the test suites and by `STORE_BACKEND=memory` single-node deployments.
//!
//! Nothing is ever evicted: readings and alerts grow for the life of the
//! process and every window query scans them linearly. Long-running or
//! high-volume deployments belong on the postgres backend.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{
    AlertInsert, AlertStore, CommandStore, DedupeScope, ReadingStore, RuleStore, StoreError,
};
use crate::models::{Alert, AutomationRule, CommandStatus, DeviceCommand, Reading, SensorType};

// ---

#[derive(Default)]
struct Inner {
    readings: Vec<Reading>,
    rules: HashMap<Uuid, AutomationRule>,
    commands: HashMap<Uuid, DeviceCommand>,
    alerts: Vec<Alert>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave a half-written record
        // behind, so the data is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace a rule. Rule authoring happens outside the core; this
    /// seeds the backend.
    pub fn put_rule(&self, rule: AutomationRule) {
        self.lock().rules.insert(rule.id, rule);
    }

    pub fn rule(&self, id: Uuid) -> Option<AutomationRule> {
        self.lock().rules.get(&id).cloned()
    }

    /// Snapshot of every stored alert, oldest first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.lock().alerts.clone()
    }

    /// Snapshot of every stored command.
    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.lock().commands.values().cloned().collect()
    }
}

// ---

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn append(&self, readings: &[Reading]) -> Result<(), StoreError> {
        self.lock().readings.extend_from_slice(readings);
        Ok(())
    }

    async fn readings_since(
        &self,
        user_id: &str,
        device_id: &str,
        sensor: SensorType,
        since: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError> {
        // ---
        let mut found: Vec<Reading> = self
            .lock()
            .readings
            .iter()
            .filter(|r| {
                r.user_id == user_id
                    && r.device_id == device_id
                    && r.sensor_type == sensor
                    && r.timestamp >= since
            })
            .cloned()
            .collect();
        found.sort_by_key(|r| r.timestamp);
        Ok(found)
    }

    async fn window(
        &self,
        user_id: &str,
        device_id: &str,
        since: DateTime<Utc>,
        cap: usize,
    ) -> Result<Vec<Reading>, StoreError> {
        // ---
        let mut found: Vec<Reading> = self
            .lock()
            .readings
            .iter()
            .filter(|r| r.user_id == user_id && r.device_id == device_id && r.timestamp >= since)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.timestamp);
        if found.len() > cap {
            found.drain(..found.len() - cap);
        }
        Ok(found)
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn candidate_rules(
        &self,
        user_id: &str,
        device_id: &str,
        metric: SensorType,
    ) -> Result<Vec<AutomationRule>, StoreError> {
        // ---
        let mut rules: Vec<AutomationRule> = self
            .lock()
            .rules
            .values()
            .filter(|rule| {
                rule.enabled
                    && rule.user_id == user_id
                    && rule.metric == metric
                    && rule.applies_to(device_id)
            })
            .cloned()
            .collect();
        rules.sort_by_key(|rule| rule.id);
        Ok(rules)
    }

    async fn claim_trigger(
        &self,
        rule_id: Uuid,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // ---
        let mut inner = self.lock();
        let Some(rule) = inner.rules.get_mut(&rule_id) else {
            return Ok(false);
        };
        let free = rule.last_triggered_at.map_or(true, |last| now - last >= cooldown);
        if free {
            rule.last_triggered_at = Some(now);
        }
        Ok(free)
    }
}

#[async_trait]
impl CommandStore for MemoryStore {
    async fn insert(&self, command: &DeviceCommand) -> Result<(), StoreError> {
        self.lock().commands.insert(command.id, command.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeviceCommand>, StoreError> {
        Ok(self.lock().commands.get(&id).cloned())
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<DeviceCommand>, StoreError> {
        // ---
        let mut expired = Vec::new();
        for command in self.lock().commands.values_mut() {
            if command.is_overdue(now) {
                command.status = CommandStatus::Expired;
                command.completed_at = Some(now);
                command.result_message = Some(super::EXPIRED_MESSAGE.to_string());
                expired.push(command.clone());
            }
        }
        expired.sort_by_key(|c| c.issued_at);
        Ok(expired)
    }

    async fn claim_pending(
        &self,
        user_id: &str,
        device_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeviceCommand>, StoreError> {
        // ---
        let mut inner = self.lock();
        let mut ids: Vec<(DateTime<Utc>, Uuid)> = inner
            .commands
            .values()
            .filter(|c| {
                c.status == CommandStatus::Pending
                    && c.user_id == user_id
                    && c.device_id == device_id
                    && c.expires_at > now
            })
            .map(|c| (c.issued_at, c.id))
            .collect();
        ids.sort();
        ids.truncate(limit);

        let mut claimed = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            if let Some(command) = inner.commands.get_mut(&id) {
                command.status = CommandStatus::Delivered;
                command.delivered_at = Some(now);
                claimed.push(command.clone());
            }
        }
        Ok(claimed)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: CommandStatus,
        to: CommandStatus,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<DeviceCommand>, StoreError> {
        // ---
        let mut inner = self.lock();
        let Some(command) = inner.commands.get_mut(&id) else {
            return Ok(None);
        };
        if command.status != from || !from.can_transition_to(to) {
            return Ok(None);
        }
        command.status = to;
        if to.is_terminal() {
            command.completed_at = Some(now);
            command.result_message = message.map(str::to_string);
        }
        Ok(Some(command.clone()))
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert_deduped(
        &self,
        alert: &Alert,
        scope: DedupeScope,
    ) -> Result<AlertInsert, StoreError> {
        // ---
        let mut inner = self.lock();
        let existing = inner
            .alerts
            .iter()
            .rev()
            .find(|a| {
                a.user_id == alert.user_id
                    && a.device_id == alert.device_id
                    && a.origin == alert.origin
                    && a.dedupe_key() == alert.dedupe_key()
                    && a.created_at >= scope.since
                    && !(scope.unresolved_only && a.is_resolved)
            })
            .map(|a| a.id);

        if let Some(id) = existing {
            return Ok(AlertInsert::Suppressed { existing: Some(id) });
        }
        inner.alerts.push(alert.clone());
        Ok(AlertInsert::Created)
    }

    async fn resolve(&self, user_id: &str, id: Uuid) -> Result<bool, StoreError> {
        // ---
        let mut inner = self.lock();
        match inner
            .alerts
            .iter_mut()
            .find(|a| a.id == id && a.user_id == user_id)
        {
            Some(alert) => {
                alert.is_resolved = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{CommandSource, NewCommand};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    fn pending(device: &str, issued_at: DateTime<Utc>) -> DeviceCommand {
        // ---
        DeviceCommand::pending(
            NewCommand {
                user_id: "user-1".to_string(),
                device_id: device.to_string(),
                actuator: "pump".to_string(),
                state: "on".to_string(),
                duration_seconds: Some(30),
                source: CommandSource::Manual,
                rule_id: None,
            },
            issued_at,
            Duration::minutes(10),
        )
    }

    #[tokio::test]
    async fn test_claim_pending_is_ordered_and_limited() {
        // ---
        let store = MemoryStore::new();
        let first = pending("tent-a", t0());
        let second = pending("tent-a", t0() + Duration::seconds(1));
        let third = pending("tent-a", t0() + Duration::seconds(2));
        let other_device = pending("tent-b", t0());
        for c in [&third, &first, &other_device, &second] {
            store.insert(c).await.unwrap();
        }

        let now = t0() + Duration::minutes(1);
        let claimed = store.claim_pending("user-1", "tent-a", 2, now).await.unwrap();
        let ids: Vec<Uuid> = claimed.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert!(claimed.iter().all(|c| c.status == CommandStatus::Delivered));
        assert!(claimed.iter().all(|c| c.delivered_at == Some(now)));

        let rest = store.claim_pending("user-1", "tent-a", 10, now).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, third.id);
    }

    #[tokio::test]
    async fn test_transition_requires_expected_state() {
        // ---
        let store = MemoryStore::new();
        let command = pending("tent-a", t0());
        store.insert(&command).await.unwrap();

        let now = t0() + Duration::minutes(1);
        let skipped = store
            .transition(command.id, CommandStatus::Delivered, CommandStatus::Executed, None, now)
            .await
            .unwrap();
        assert!(skipped.is_none());

        let cancelled = store
            .transition(
                command.id,
                CommandStatus::Pending,
                CommandStatus::Cancelled,
                Some("user"),
                now,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.status, CommandStatus::Cancelled);
        assert_eq!(cancelled.completed_at, Some(now));
        assert_eq!(cancelled.result_message.as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn test_readings_window_keeps_most_recent() {
        // ---
        let store = MemoryStore::new();
        let readings: Vec<Reading> = (0..10)
            .map(|i| Reading {
                user_id: "user-1".to_string(),
                device_id: "tent-a".to_string(),
                sensor_type: SensorType::Humidity,
                value: f64::from(i),
                unit: "%".to_string(),
                timestamp: t0() + Duration::minutes(i64::from(i)),
            })
            .collect();
        store.append(&readings).await.unwrap();

        let window = store.window("user-1", "tent-a", t0(), 4).await.unwrap();
        let values: Vec<f64> = window.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![6.0, 7.0, 8.0, 9.0]);

        let since = store
            .readings_since("user-1", "tent-a", SensorType::Humidity, t0() + Duration::minutes(8))
            .await
            .unwrap();
        assert_eq!(since.len(), 2);
    }
}
