//! Reactive threshold alerts.
//!
//! Each reading is compared against the static safe range of its channel.
//! Anything outside produces an alert unless one with the same
//! (user, type, device) was raised inside the debounce window.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    events::{BusEvent, EventBus},
    models::{Alert, AlertOrigin, Reading, SafeRange, SensorType, Violation},
    severity::{clamp_confidence, Severity},
    store::{AlertInsert, AlertStore, DedupeScope},
};

/// Deviation past the boundary, relative to the boundary, that makes a
/// violation critical.
pub const CRITICAL_DEVIATION: f64 = 0.20;

pub const MIN_CONFIDENCE: f64 = 40.0;
pub const MAX_CONFIDENCE: f64 = 95.0;

// ---

/// Severity of a violation under the >20 %-beyond-boundary rule.
pub fn violation_severity(range: &SafeRange, violation: &Violation) -> Severity {
    // ---
    // A zero boundary has no meaningful relative deviation; fall back to the span.
    let reference = if violation.boundary.abs() > f64::EPSILON {
        violation.boundary.abs()
    } else {
        range.span().abs()
    };
    if reference > 0.0 && violation.distance / reference > CRITICAL_DEVIATION {
        Severity::Critical
    } else {
        Severity::Warning
    }
}

/// Confidence from the distance past the boundary relative to the safe span,
/// clamped to `[40, 95]`.
pub fn violation_confidence(range: &SafeRange, violation: &Violation) -> u8 {
    // ---
    let span = range.span();
    let normalized = if span > 0.0 {
        violation.distance / span
    } else {
        1.0
    };
    let raw = (MIN_CONFIDENCE + normalized * 100.0).clamp(MIN_CONFIDENCE, MAX_CONFIDENCE);
    clamp_confidence(Some(raw))
}

/// Alert type for a violation, e.g. `high_temperature`.
pub fn alert_type(sensor: SensorType, violation: &Violation) -> String {
    format!("{}_{}", violation.direction.as_str(), sensor.label())
}

/// Build the alert a reading would raise, or `None` if it is in range.
pub fn alert_for(reading: &Reading, now: DateTime<Utc>) -> Option<Alert> {
    // ---
    let range = reading.sensor_type.safe_range();
    let violation = range.violation(reading.value)?;
    let severity = violation_severity(&range, &violation);

    Some(Alert {
        id: Uuid::new_v4(),
        user_id: reading.user_id.clone(),
        device_id: reading.device_id.clone(),
        alert_type: alert_type(reading.sensor_type, &violation),
        severity,
        legacy_severity: severity.legacy(),
        confidence: violation_confidence(&range, &violation),
        origin: AlertOrigin::Reactive,
        risk_category: None,
        prediction: None,
        message: format!(
            "{} is {} at {:.1}{} (safe range {}–{})",
            reading.sensor_type,
            violation.direction.as_str(),
            reading.value,
            reading.unit,
            range.min,
            range.max
        ),
        value: reading.value,
        threshold: violation.boundary,
        is_resolved: false,
        created_at: now,
    })
}

// ---

/// Per-reading threshold checker with debounce.
#[derive(Clone)]
pub struct ReactiveAlerter {
    alerts: Arc<dyn AlertStore>,
    bus: EventBus,
    debounce: Duration,
}

impl ReactiveAlerter {
    pub fn new(alerts: Arc<dyn AlertStore>, bus: EventBus, debounce: Duration) -> Self {
        Self {
            alerts,
            bus,
            debounce,
        }
    }

    /// Check a batch of readings and persist the alerts that survive debounce.
    ///
    /// A store failure on one reading is logged and the rest of the batch is
    /// still checked.
    pub async fn process(&self, readings: &[Reading], now: DateTime<Utc>) -> Vec<Alert> {
        // ---
        let scope = DedupeScope {
            since: now - self.debounce,
            unresolved_only: false,
        };
        let mut created = Vec::new();

        for reading in readings {
            let Some(alert) = alert_for(reading, now) else {
                continue;
            };

            match self.alerts.insert_deduped(&alert, scope).await {
                Ok(AlertInsert::Created) => {
                    debug!(
                        alert_type = %alert.alert_type,
                        device_id = %alert.device_id,
                        severity = %alert.severity,
                        "reactive alert created"
                    );
                    self.bus.publish(&alert.user_id, BusEvent::NewAlert(alert.clone()));
                    created.push(alert);
                }
                Ok(AlertInsert::Suppressed { .. }) => {
                    debug!(
                        alert_type = %alert.alert_type,
                        device_id = %alert.device_id,
                        "reactive alert debounced"
                    );
                }
                Err(e) => {
                    warn!(
                        alert_type = %alert.alert_type,
                        device_id = %alert.device_id,
                        error = %e,
                        "failed to store reactive alert"
                    );
                }
            }
        }
        created
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{severity::LegacySeverity, store::MemoryStore};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn reading(sensor: SensorType, value: f64) -> Reading {
        // ---
        Reading {
            user_id: "user-1".to_string(),
            device_id: "tent-a".to_string(),
            sensor_type: sensor,
            value,
            unit: sensor.default_unit().to_string(),
            timestamp: t0(),
        }
    }

    fn alerter(store: &Arc<MemoryStore>) -> ReactiveAlerter {
        ReactiveAlerter::new(store.clone(), EventBus::new(16), Duration::minutes(30))
    }

    #[test]
    fn test_in_range_reading_raises_nothing() {
        // ---
        assert!(alert_for(&reading(SensorType::Temperature, 24.0), t0()).is_none());
        assert!(alert_for(&reading(SensorType::Temperature, 30.0), t0()).is_none());
        assert!(alert_for(&reading(SensorType::Temperature, 18.0), t0()).is_none());
    }

    #[test]
    fn test_twenty_percent_rule() {
        // ---
        // Max temperature is 30: 36 is exactly 20 % beyond, 36.1 is more
        let warning = alert_for(&reading(SensorType::Temperature, 36.0), t0()).unwrap();
        assert_eq!(warning.severity, Severity::Warning);
        assert_eq!(warning.legacy_severity, LegacySeverity::Medium);
        assert_eq!(warning.alert_type, "high_temperature");
        assert_eq!(warning.threshold, 30.0);

        let critical = alert_for(&reading(SensorType::Temperature, 36.1), t0()).unwrap();
        assert_eq!(critical.severity, Severity::Critical);
        assert_eq!(critical.legacy_severity, LegacySeverity::High);

        // Min soil moisture is 30: 23 is 23 % below
        let dry = alert_for(&reading(SensorType::SoilMoisture, 23.0), t0()).unwrap();
        assert_eq!(dry.severity, Severity::Critical);
        assert_eq!(dry.alert_type, "low_soil_moisture");
    }

    #[test]
    fn test_confidence_is_clamped() {
        // ---
        let barely = alert_for(&reading(SensorType::Humidity, 80.1), t0()).unwrap();
        assert!(barely.confidence >= 40 && barely.confidence < 45);

        let extreme = alert_for(&reading(SensorType::Co2, 9_000.0), t0()).unwrap();
        assert_eq!(extreme.confidence, 95);
    }

    #[tokio::test]
    async fn test_debounce_suppresses_repeat() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let alerter = alerter(&store);

        let first = alerter
            .process(&[reading(SensorType::Temperature, 40.0)], t0())
            .await;
        assert_eq!(first.len(), 1);

        let again = alerter
            .process(&[reading(SensorType::Temperature, 41.0)], t0() + Duration::minutes(10))
            .await;
        assert!(again.is_empty());

        // A different type on the same device is not debounced
        let cold = alerter
            .process(&[reading(SensorType::Temperature, 10.0)], t0() + Duration::minutes(10))
            .await;
        assert_eq!(cold.len(), 1);

        // Once the window has passed the alert fires again
        let later = alerter
            .process(&[reading(SensorType::Temperature, 40.0)], t0() + Duration::minutes(31))
            .await;
        assert_eq!(later.len(), 1);
        assert_eq!(store.alerts().len(), 3);
    }

    #[tokio::test]
    async fn test_batch_with_duplicates_creates_one_alert() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let alerter = ReactiveAlerter::new(store.clone(), bus, Duration::minutes(30));

        let batch = vec![
            reading(SensorType::Humidity, 90.0),
            reading(SensorType::Humidity, 91.0),
            reading(SensorType::Humidity, 55.0),
        ];
        let created = alerter.process(&batch, t0()).await;
        assert_eq!(created.len(), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event.name(), "newAlert");
    }
}
