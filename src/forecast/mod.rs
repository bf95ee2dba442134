//! Proactive risk forecasting (EMBP gateway).
//!
//! A forecast run loads the device's recent readings, fits one [`Trend`] per
//! channel, scores each risk category and persists the candidates that pass
//! the caller's filters and the predictive debounce.
//!
//! - `trend.rs`: least-squares fit
//! - `risk.rs`: category scorers and confidence

use std::{collections::HashMap, sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    events::{BusEvent, EventBus},
    models::{Alert, AlertOrigin, Prediction, Reading, RiskCategory, SensorType},
    presence::Presence,
    severity::severity_from_score,
    store::{AlertInsert, AlertStore, DedupeScope, ReadingStore, StoreError},
};

mod risk;
mod trend;

pub use risk::{assess, RiskCandidate};
pub use trend::{fit, Trend};

// ---

/// Tunables loaded from [`crate::Config`].
#[derive(Debug, Clone, Copy)]
pub struct ForecastSettings {
    pub lookback_minutes: u32,
    pub sample_cap: usize,
    pub debounce: Duration,
}

/// Per-run filters supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct ForecastOptions {
    pub min_confidence: Option<u8>,
    /// `None` allows every category.
    pub categories: Option<Vec<RiskCategory>>,
}

impl ForecastOptions {
    fn admits(&self, candidate: &RiskCandidate) -> bool {
        // ---
        let confident = self
            .min_confidence
            .map_or(true, |min| candidate.confidence >= min);
        let allowed = self
            .categories
            .as_ref()
            .map_or(true, |list| list.contains(&candidate.category));
        confident && allowed
    }
}

/// Group a window by channel and fit a trend for each.
///
/// Channels with too few usable samples are left out.
pub fn extract_trends(
    window_start: DateTime<Utc>,
    window: &[Reading],
) -> HashMap<SensorType, Trend> {
    // ---
    let mut by_sensor: HashMap<SensorType, Vec<Reading>> = HashMap::new();
    for reading in window {
        by_sensor
            .entry(reading.sensor_type)
            .or_default()
            .push(reading.clone());
    }

    by_sensor
        .into_iter()
        .filter_map(|(sensor, mut samples)| {
            samples.sort_by_key(|r| r.timestamp);
            fit(window_start, &samples).map(|trend| (sensor, trend))
        })
        .collect()
}

fn candidate_alert(
    candidate: RiskCandidate,
    user_id: &str,
    device_id: &str,
    now: DateTime<Utc>,
) -> Alert {
    // ---
    let severity = severity_from_score(candidate.score);
    Alert {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        device_id: device_id.to_string(),
        alert_type: format!("predictive_{}", candidate.category),
        severity,
        legacy_severity: severity.legacy(),
        confidence: candidate.confidence,
        origin: AlertOrigin::Predictive,
        risk_category: Some(candidate.category),
        prediction: Some(Prediction {
            window_minutes: candidate.window_minutes,
            score: (candidate.score * 10.0).round() / 10.0,
            based_on: candidate.based_on,
        }),
        message: candidate.message,
        value: candidate.value,
        threshold: candidate.threshold,
        is_resolved: false,
        created_at: now,
    }
}

// ---

#[derive(Clone)]
pub struct Forecaster {
    readings: Arc<dyn ReadingStore>,
    alerts: Arc<dyn AlertStore>,
    bus: EventBus,
    settings: ForecastSettings,
}

impl Forecaster {
    pub fn new(
        readings: Arc<dyn ReadingStore>,
        alerts: Arc<dyn AlertStore>,
        bus: EventBus,
        settings: ForecastSettings,
    ) -> Self {
        Self {
            readings,
            alerts,
            bus,
            settings,
        }
    }

    pub fn settings(&self) -> ForecastSettings {
        self.settings
    }

    /// Forecast one device and persist the new predictive alerts.
    ///
    /// Only the window load is fatal; a failure storing one category is
    /// logged and the remaining categories are still stored.
    pub async fn run(
        &self,
        user_id: &str,
        device_id: &str,
        now: DateTime<Utc>,
        options: &ForecastOptions,
    ) -> Result<Vec<Alert>, StoreError> {
        // ---
        let lookback = self.settings.lookback_minutes;
        let window_start = now - Duration::minutes(i64::from(lookback));
        let window = self
            .readings
            .window(user_id, device_id, window_start, self.settings.sample_cap)
            .await?;

        let trends = extract_trends(window_start, &window);
        debug!(
            device_id,
            samples = window.len(),
            channels = trends.len(),
            "forecast window loaded"
        );

        let scope = DedupeScope {
            since: now - self.settings.debounce,
            unresolved_only: true,
        };
        let mut created = Vec::new();

        for candidate in assess(&trends, lookback) {
            if !options.admits(&candidate) {
                debug!(
                    category = %candidate.category,
                    confidence = candidate.confidence,
                    "forecast candidate filtered"
                );
                continue;
            }

            let alert = candidate_alert(candidate, user_id, device_id, now);
            match self.alerts.insert_deduped(&alert, scope).await {
                Ok(AlertInsert::Created) => {
                    info!(
                        device_id,
                        category = alert.dedupe_key(),
                        severity = %alert.severity,
                        confidence = alert.confidence,
                        "predictive alert created"
                    );
                    created.push(alert);
                }
                Ok(AlertInsert::Suppressed { .. }) => {
                    debug!(
                        device_id,
                        category = alert.dedupe_key(),
                        "predictive alert already open"
                    );
                }
                Err(e) => {
                    warn!(
                        device_id,
                        category = alert.dedupe_key(),
                        error = %e,
                        "failed to store predictive alert"
                    );
                }
            }
        }

        if !created.is_empty() {
            self.bus
                .publish(user_id, BusEvent::ProactiveAlerts(created.clone()));
        }
        Ok(created)
    }
}

/// Periodically forecast every device seen within the lookback window.
pub fn spawn_scheduler(
    forecaster: Forecaster,
    presence: Presence,
    every: StdDuration,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let options = ForecastOptions::default();

        loop {
            ticker.tick().await;
            let now = Utc::now();
            let lookback = Duration::minutes(i64::from(forecaster.settings().lookback_minutes));
            let pruned = presence.prune_before(now - lookback);
            let devices = presence.active_since(now - lookback);
            debug!(devices = devices.len(), pruned, "scheduled forecast sweep");

            for key in devices {
                if let Err(e) = forecaster
                    .run(&key.user_id, &key.device_id, now, &options)
                    .await
                {
                    warn!(device_id = %key.device_id, error = %e, "scheduled forecast failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{severity::Severity, store::MemoryStore};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 15, 0, 0).unwrap()
    }

    fn sample(sensor: SensorType, value: f64, minutes_ago: i64) -> Reading {
        // ---
        Reading {
            user_id: "user-1".to_string(),
            device_id: "tent-a".to_string(),
            sensor_type: sensor,
            value,
            unit: sensor.default_unit().to_string(),
            timestamp: now() - Duration::minutes(minutes_ago),
        }
    }

    /// Linear series from `from` to `to` across the last `span` minutes.
    fn ramp(sensor: SensorType, from: f64, to: f64, span: i64, step: i64) -> Vec<Reading> {
        // ---
        (0..=span / step)
            .map(|i| {
                let minutes = i * step;
                let value = from + (to - from) * minutes as f64 / span as f64;
                sample(sensor, value, span - minutes)
            })
            .collect()
    }

    fn forecaster(store: &Arc<MemoryStore>) -> Forecaster {
        // ---
        Forecaster::new(
            store.clone(),
            store.clone(),
            EventBus::new(32),
            ForecastSettings {
                lookback_minutes: 180,
                sample_cap: 500,
                debounce: Duration::minutes(120),
            },
        )
    }

    #[test]
    fn test_extract_trends_skips_sparse_channels() {
        // ---
        let mut window = ramp(SensorType::Temperature, 20.0, 23.0, 30, 10);
        window.push(sample(SensorType::Humidity, 60.0, 5));
        window.push(sample(SensorType::Humidity, 61.0, 1));

        let start = now() - Duration::minutes(180);
        let trends = extract_trends(start, &window);
        assert!(trends.contains_key(&SensorType::Temperature));
        assert!(!trends.contains_key(&SensorType::Humidity));
    }

    #[tokio::test]
    async fn test_irrigation_alert_created_once() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store
            .append(&ramp(SensorType::SoilMoisture, 60.0, 25.0, 180, 15))
            .await
            .unwrap();
        let forecaster = forecaster(&store);

        let first = forecaster
            .run("user-1", "tent-a", now(), &ForecastOptions::default())
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        let alert = &first[0];
        assert_eq!(alert.risk_category, Some(RiskCategory::Irrigation));
        assert_eq!(alert.origin, AlertOrigin::Predictive);
        assert!(alert.severity >= Severity::Warning);
        assert_eq!(alert.prediction.as_ref().unwrap().window_minutes, 240);

        let second = forecaster
            .run("user-1", "tent-a", now() + Duration::minutes(5), &ForecastOptions::default())
            .await
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(store.alerts().len(), 1);
    }

    #[tokio::test]
    async fn test_resolved_alert_allows_new_forecast() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store
            .append(&ramp(SensorType::SoilMoisture, 60.0, 25.0, 180, 15))
            .await
            .unwrap();
        let forecaster = forecaster(&store);

        let first = forecaster
            .run("user-1", "tent-a", now(), &ForecastOptions::default())
            .await
            .unwrap();
        assert!(store.resolve("user-1", first[0].id).await.unwrap());

        let again = forecaster
            .run("user-1", "tent-a", now() + Duration::minutes(1), &ForecastOptions::default())
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn test_disease_alert_from_rising_humidity() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let mut window = ramp(SensorType::Humidity, 70.0, 80.0, 120, 10);
        window.extend(ramp(SensorType::Temperature, 22.0, 22.0, 120, 10));
        store.append(&window).await.unwrap();

        let bus = EventBus::new(32);
        let mut rx = bus.subscribe();
        let settings = forecaster(&store).settings();
        let forecaster = Forecaster::new(store.clone(), store.clone(), bus, settings);

        let created = forecaster
            .run("user-1", "tent-a", now(), &ForecastOptions::default())
            .await
            .unwrap();
        let disease: Vec<&Alert> = created
            .iter()
            .filter(|a| a.risk_category == Some(RiskCategory::Disease))
            .collect();
        assert_eq!(disease.len(), 1);
        assert_eq!(
            disease[0].prediction.as_ref().unwrap().based_on,
            vec![SensorType::Temperature, SensorType::Humidity]
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event.name(), "proactiveAlerts");
    }

    #[tokio::test]
    async fn test_options_filter_candidates() {
        // ---
        let store = Arc::new(MemoryStore::new());
        store
            .append(&ramp(SensorType::SoilMoisture, 60.0, 25.0, 180, 15))
            .await
            .unwrap();
        let forecaster = forecaster(&store);

        let only_disease = ForecastOptions {
            min_confidence: None,
            categories: Some(vec![RiskCategory::Disease]),
        };
        let none = forecaster.run("user-1", "tent-a", now(), &only_disease).await.unwrap();
        assert!(none.is_empty());

        let demanding = ForecastOptions {
            min_confidence: Some(101),
            categories: None,
        };
        let none = forecaster.run("user-1", "tent-a", now(), &demanding).await.unwrap();
        assert!(none.is_empty());
        assert!(store.alerts().is_empty());
    }
}
