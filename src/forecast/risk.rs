//! Category risk scoring over fitted trends.
//!
//! Each scorer is a pure function from the trends it needs to an optional
//! [`RiskCandidate`]. Scores live in `0..=100`.

use std::collections::HashMap;

use crate::{
    forecast::trend::Trend,
    models::{RiskCategory, SafeRange, SensorType},
    severity::clamp_confidence,
};

/// How far ahead soil moisture is projected.
pub const IRRIGATION_HORIZON_MINUTES: u32 = 240;
/// Drying rate (units per hour) that, with a projected breach, raises risk.
pub const IRRIGATION_MIN_DRY_RATE: f64 = 1.5;

pub const WEATHER_HORIZON_MINUTES: u32 = 180;
pub const DISEASE_HORIZON_MINUTES: u32 = 180;

/// Weather and disease candidates below this score are dropped.
pub const MIN_CATEGORY_SCORE: f64 = 35.0;

/// Projected humidity above which disease pressure accrues.
pub const DISEASE_HUMIDITY_EXCESS: f64 = 82.0;
/// Projected humidity a disease candidate must reach.
pub const DISEASE_HUMIDITY_GATE: f64 = 80.0;
/// VPD (kPa) below which the air is treated as close to saturation.
pub const LOW_VPD_KPA: f64 = 0.4;

/// Lowest confidence reported when a category has any trend behind it.
pub const CONFIDENCE_FLOOR: u8 = 60;
/// Sampling cadence the density term expects, in minutes.
pub const EXPECTED_SAMPLE_INTERVAL_MINUTES: f64 = 5.0;

// ---

/// A scored, not yet persisted, predictive finding.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskCandidate {
    pub category: RiskCategory,
    pub score: f64,
    pub confidence: u8,
    pub window_minutes: u32,
    pub based_on: Vec<SensorType>,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
}

/// Saturation vapor pressure in kPa (Tetens).
pub fn saturation_vapor_pressure(temperature_c: f64) -> f64 {
    0.6108 * (17.27 * temperature_c / (temperature_c + 237.3)).exp()
}

/// Vapor-pressure deficit in kPa for a temperature and relative humidity.
pub fn vpd(temperature_c: f64, relative_humidity: f64) -> f64 {
    let rh = relative_humidity.clamp(0.0, 100.0);
    (saturation_vapor_pressure(temperature_c) * (1.0 - rh / 100.0)).max(0.0)
}

/// Confidence from sample density, fit quality and trend strength,
/// averaged over the trends that fed a category.
///
/// Never below [`CONFIDENCE_FLOOR`] when at least one trend is present.
pub fn confidence(trends: &[(SensorType, &Trend)], lookback_minutes: u32) -> u8 {
    // ---
    if trends.is_empty() {
        return 0;
    }
    let expected = (f64::from(lookback_minutes) / EXPECTED_SAMPLE_INTERVAL_MINUTES).max(1.0);

    let total: f64 = trends
        .iter()
        .map(|(sensor, trend)| {
            let density = (trend.sample_count as f64 / expected).min(1.0);
            // A move of 5 % of the safe span per hour counts as a full-strength trend
            let reference = sensor.safe_range().span() * 0.05;
            let strength = if reference > 0.0 {
                (trend.slope_per_hour.abs() / reference).min(1.0)
            } else {
                0.0
            };
            100.0 * (0.30 * density + 0.45 * trend.r_squared + 0.25 * strength)
        })
        .sum();

    clamp_confidence(Some(total / trends.len() as f64)).max(CONFIDENCE_FLOOR)
}

// ---

/// Soil drying toward (or already below) the safe minimum.
pub fn irrigation(
    trends: &HashMap<SensorType, Trend>,
    lookback_minutes: u32,
) -> Option<RiskCandidate> {
    // ---
    let soil = trends.get(&SensorType::SoilMoisture)?;
    let range = SensorType::SoilMoisture.safe_range();
    let horizon = f64::from(IRRIGATION_HORIZON_MINUTES);

    let current = soil.latest_value;
    let projected = soil.project(horizon).max(0.0);
    let dry_rate = (-soil.slope_per_hour).max(0.0);

    let below_now = current < range.min;
    let heading_below = projected < range.min && dry_rate >= IRRIGATION_MIN_DRY_RATE;
    if !below_now && !heading_below {
        return None;
    }

    let current_deficit = (range.min - current).max(0.0);
    let projected_deficit = (range.min - projected).max(0.0);
    let rate_penalty = (dry_rate * 2.5).min(30.0);
    let score = (current_deficit * 3.0 + projected_deficit * 1.2 + rate_penalty).clamp(0.0, 100.0);

    Some(RiskCandidate {
        category: RiskCategory::Irrigation,
        score,
        confidence: confidence(&[(SensorType::SoilMoisture, soil)], lookback_minutes),
        window_minutes: IRRIGATION_HORIZON_MINUTES,
        based_on: vec![SensorType::SoilMoisture],
        value: current,
        threshold: range.min,
        message: format!(
            "Soil moisture at {:.1}% is projected to reach {:.1}% within {} minutes (falling {:.1}%/h); irrigation recommended",
            current, projected, IRRIGATION_HORIZON_MINUTES, dry_rate
        ),
    })
}

/// Temperature and/or light heading out of their safe ranges.
pub fn weather_stress(
    trends: &HashMap<SensorType, Trend>,
    lookback_minutes: u32,
) -> Option<RiskCandidate> {
    // ---
    let horizon = f64::from(WEATHER_HORIZON_MINUTES);
    let channels: Vec<(SensorType, &Trend)> = [SensorType::Temperature, SensorType::Light]
        .into_iter()
        .filter_map(|sensor| trends.get(&sensor).map(|t| (sensor, t)))
        .collect();
    let &(dominant, dominant_trend) = channels.first()?;

    let mut penalty = 0.0;
    let mut breached = Vec::new();
    for &(sensor, trend) in &channels {
        let range = sensor.safe_range();
        if let Some(violation) = range.violation(trend.project(horizon)) {
            let span = range.span();
            let magnitude = 1.0 + (trend.slope_per_hour.abs() / span).min(1.0);
            penalty += violation.distance / span * 100.0 * magnitude;
            breached.push(sensor);
        }
    }

    let score = penalty.clamp(0.0, 100.0);
    if breached.is_empty() || score < MIN_CATEGORY_SCORE {
        return None;
    }

    let dominant_range: SafeRange = dominant.safe_range();
    let dominant_projection = dominant_trend.project(horizon);
    let threshold = dominant_range
        .violation(dominant_projection)
        .map_or_else(|| dominant_range.nearest_boundary(dominant_projection), |v| v.boundary);

    Some(RiskCandidate {
        category: RiskCategory::WeatherStress,
        score,
        confidence: confidence(&channels, lookback_minutes),
        window_minutes: WEATHER_HORIZON_MINUTES,
        based_on: channels.iter().map(|(sensor, _)| *sensor).collect(),
        value: dominant_trend.latest_value,
        threshold,
        message: format!(
            "{} projected to leave its safe range within {} minutes ({} → {:.1})",
            breached
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" and "),
            WEATHER_HORIZON_MINUTES,
            dominant,
            dominant_projection
        ),
    })
}

/// Humid, near-saturated canopy conditions that favour fungal disease.
pub fn disease(
    trends: &HashMap<SensorType, Trend>,
    lookback_minutes: u32,
) -> Option<RiskCandidate> {
    // ---
    let temperature = trends.get(&SensorType::Temperature)?;
    let humidity = trends.get(&SensorType::Humidity)?;
    let horizon = f64::from(DISEASE_HORIZON_MINUTES);

    let projected_temperature = temperature.project(horizon);
    let projected_humidity = humidity.project(horizon).clamp(0.0, 100.0);
    let current_vpd = vpd(temperature.latest_value, humidity.latest_value);
    let projected_vpd = vpd(projected_temperature, projected_humidity);

    let humidity_excess = (projected_humidity - DISEASE_HUMIDITY_EXCESS).max(0.0) * 4.0;
    let saturation = if projected_vpd < LOW_VPD_KPA {
        (LOW_VPD_KPA - projected_vpd) / LOW_VPD_KPA * 40.0
    } else {
        0.0
    };
    let rising = (humidity.slope_per_hour.max(0.0) * 5.0).min(20.0);
    let score = (humidity_excess + saturation + rising).clamp(0.0, 100.0);

    if score < MIN_CATEGORY_SCORE || projected_humidity < DISEASE_HUMIDITY_GATE {
        return None;
    }

    let used = [
        (SensorType::Temperature, temperature),
        (SensorType::Humidity, humidity),
    ];
    Some(RiskCandidate {
        category: RiskCategory::Disease,
        score,
        confidence: confidence(&used, lookback_minutes),
        window_minutes: DISEASE_HORIZON_MINUTES,
        based_on: vec![SensorType::Temperature, SensorType::Humidity],
        value: humidity.latest_value,
        threshold: DISEASE_HUMIDITY_GATE,
        message: format!(
            "Humidity projected at {:.0}% with VPD falling from {:.2} to {:.2} kPa; disease pressure rising",
            projected_humidity, current_vpd, projected_vpd
        ),
    })
}

/// Run every scorer.
pub fn assess(trends: &HashMap<SensorType, Trend>, lookback_minutes: u32) -> Vec<RiskCandidate> {
    [
        irrigation(trends, lookback_minutes),
        weather_stress(trends, lookback_minutes),
        disease(trends, lookback_minutes),
    ]
    .into_iter()
    .flatten()
    .collect()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::severity::{severity_from_score, Severity};
    use chrono::{TimeZone, Utc};

    fn trend(latest: f64, per_hour: f64, samples: usize, r_squared: f64) -> Trend {
        // ---
        Trend {
            slope_per_minute: per_hour / 60.0,
            slope_per_hour: per_hour,
            latest_value: latest,
            latest_timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            sample_count: samples,
            r_squared,
        }
    }

    fn trends(entries: &[(SensorType, Trend)]) -> HashMap<SensorType, Trend> {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_vpd_values() {
        // ---
        // ~3.17 kPa saturation at 25 °C
        assert!((saturation_vapor_pressure(25.0) - 3.167).abs() < 0.01);
        assert!((vpd(25.0, 60.0) - 1.267).abs() < 0.01);
        assert_eq!(vpd(25.0, 100.0), 0.0);
        assert_eq!(vpd(25.0, 120.0), 0.0);
    }

    #[test]
    fn test_confidence_floor_and_ceiling() {
        // ---
        let weak = trend(50.0, 0.0, 3, 0.0);
        assert_eq!(confidence(&[(SensorType::Humidity, &weak)], 180), CONFIDENCE_FLOOR);

        let strong = trend(50.0, 10.0, 36, 1.0);
        assert_eq!(confidence(&[(SensorType::Humidity, &strong)], 180), 100);

        assert_eq!(confidence(&[], 180), 0);
    }

    #[test]
    fn test_irrigation_triggers_on_fast_drying() {
        // ---
        // 60 % → 25 % over three hours
        let soil = trend(25.0, -35.0 / 3.0, 13, 1.0);
        let candidate = irrigation(&trends(&[(SensorType::SoilMoisture, soil)]), 180).unwrap();
        assert_eq!(candidate.category, RiskCategory::Irrigation);
        assert_eq!(candidate.threshold, 30.0);
        assert!(severity_from_score(candidate.score) >= Severity::Warning);
        assert!(candidate.confidence >= CONFIDENCE_FLOOR);
    }

    #[test]
    fn test_irrigation_needs_rate_when_not_yet_dry() {
        // ---
        // Projects below 30 but only drying 1 %/h
        let slow = trend(33.0, -1.0, 20, 0.9);
        assert!(irrigation(&trends(&[(SensorType::SoilMoisture, slow)]), 180).is_none());

        // Already below the minimum triggers regardless of rate
        let dry = trend(28.0, 0.0, 20, 0.0);
        assert!(irrigation(&trends(&[(SensorType::SoilMoisture, dry)]), 180).is_some());

        // Healthy and stable
        let fine = trend(50.0, -0.5, 20, 0.9);
        assert!(irrigation(&trends(&[(SensorType::SoilMoisture, fine)]), 180).is_none());

        assert!(irrigation(&HashMap::new(), 180).is_none());
    }

    #[test]
    fn test_weather_stress_scoring() {
        // ---
        // 29 °C rising 1 °C/h lands at 32: too mild to report
        let mild = trend(29.0, 1.0, 30, 0.95);
        assert!(weather_stress(&trends(&[(SensorType::Temperature, mild)]), 180).is_none());

        // 30 °C rising 2 °C/h lands at 36
        let hot = trend(30.0, 2.0, 30, 0.95);
        let candidate = weather_stress(&trends(&[(SensorType::Temperature, hot)]), 180).unwrap();
        assert_eq!(candidate.category, RiskCategory::WeatherStress);
        assert!(candidate.score >= MIN_CATEGORY_SCORE);
        assert_eq!(candidate.threshold, 30.0);
        assert_eq!(candidate.value, 30.0);

        // Light alone can carry the category; temperature stays dominant when present
        let dark = trend(2_500.0, -10_000.0, 30, 0.9);
        let calm = trend(24.0, 0.0, 30, 0.0);
        let candidate = weather_stress(
            &trends(&[(SensorType::Light, dark), (SensorType::Temperature, calm)]),
            180,
        )
        .unwrap();
        assert_eq!(candidate.value, 24.0);
        assert_eq!(
            candidate.based_on,
            vec![SensorType::Temperature, SensorType::Light]
        );
    }

    #[test]
    fn test_disease_requires_both_channels_and_gate() {
        // ---
        let temperature = trend(22.0, 0.0, 24, 0.0);
        let wet = trend(80.0, 5.0, 24, 0.98);

        assert!(disease(&trends(&[(SensorType::Humidity, wet)]), 180).is_none());

        let candidate = disease(
            &trends(&[(SensorType::Temperature, temperature), (SensorType::Humidity, wet)]),
            180,
        )
        .unwrap();
        assert_eq!(candidate.category, RiskCategory::Disease);
        assert!(candidate.score >= MIN_CATEGORY_SCORE);

        // Humid but drying out: projected humidity stays under the gate
        let drying = trend(81.0, -2.0, 24, 0.98);
        assert!(disease(
            &trends(&[(SensorType::Temperature, temperature), (SensorType::Humidity, drying)]),
            180,
        )
        .is_none());
    }
}
