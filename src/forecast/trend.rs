//! Least-squares trend extraction over a window of readings.

use chrono::{DateTime, Utc};

use crate::models::Reading;

/// Fewest finite samples a trend is fitted on.
pub const MIN_TREND_POINTS: usize = 3;

/// Linear fit of one channel over the lookback window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trend {
    pub slope_per_minute: f64,
    pub slope_per_hour: f64,
    pub latest_value: f64,
    pub latest_timestamp: DateTime<Utc>,
    pub sample_count: usize,
    pub r_squared: f64,
}

impl Trend {
    /// Extrapolate the latest value `minutes` ahead.
    pub fn project(&self, minutes: f64) -> f64 {
        self.latest_value + self.slope_per_minute * minutes
    }
}

/// Ordinary least squares over `(minutes since window_start, value)`.
///
/// Non-finite values are dropped. Returns `None` with fewer than
/// [`MIN_TREND_POINTS`] usable samples or when every sample shares one
/// timestamp. A flat series has no variance to explain and reports
/// `r_squared = 0`.
pub fn fit(window_start: DateTime<Utc>, samples: &[Reading]) -> Option<Trend> {
    // ---
    let points: Vec<(f64, f64, DateTime<Utc>)> = samples
        .iter()
        .filter(|r| r.value.is_finite())
        .map(|r| {
            let minutes = (r.timestamp - window_start).num_milliseconds() as f64 / 60_000.0;
            (minutes, r.value, r.timestamp)
        })
        .collect();

    if points.len() < MIN_TREND_POINTS {
        return None;
    }

    let n = points.len() as f64;
    let (sum_x, sum_y, sum_xx, sum_xy) = points.iter().fold(
        (0.0, 0.0, 0.0, 0.0),
        |(sx, sy, sxx, sxy), &(x, y, _)| (sx + x, sy + y, sxx + x * x, sxy + x * y),
    );

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() <= f64::EPSILON {
        return None;
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / n;
    let mean_y = sum_y / n;

    let (ss_tot, ss_res) = points.iter().fold((0.0, 0.0), |(tot, res), &(x, y, _)| {
        let predicted = intercept + slope * x;
        (tot + (y - mean_y).powi(2), res + (y - predicted).powi(2))
    });
    let r_squared = if ss_tot <= f64::EPSILON {
        0.0
    } else {
        (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
    };

    let &(_, latest_value, latest_timestamp) = points.iter().max_by_key(|p| p.2)?;

    Some(Trend {
        slope_per_minute: slope,
        slope_per_hour: slope * 60.0,
        latest_value,
        latest_timestamp,
        sample_count: points.len(),
        r_squared,
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::SensorType;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 6, 0, 0).unwrap()
    }

    fn series(values: &[(i64, f64)]) -> Vec<Reading> {
        // ---
        values
            .iter()
            .map(|&(minute, value)| Reading {
                user_id: "user-1".to_string(),
                device_id: "tent-a".to_string(),
                sensor_type: SensorType::Temperature,
                value,
                unit: "°C".to_string(),
                timestamp: start() + Duration::minutes(minute),
            })
            .collect()
    }

    #[test]
    fn test_increasing_series_fits_perfectly() {
        // ---
        let samples = series(&[(0, 20.0), (10, 21.0), (20, 22.0), (30, 23.0)]);
        let trend = fit(start(), &samples).unwrap();
        assert!(trend.slope_per_minute > 0.0);
        assert!((trend.slope_per_minute - 0.1).abs() < 1e-9);
        assert!((trend.slope_per_hour - 6.0).abs() < 1e-9);
        assert!(trend.r_squared > 0.9);
        assert_eq!(trend.sample_count, 4);
        assert_eq!(trend.latest_value, 23.0);
        assert_eq!(trend.latest_timestamp, start() + Duration::minutes(30));
        assert!((trend.project(60.0) - 29.0).abs() < 1e-9);
    }

    #[test]
    fn test_too_few_points() {
        // ---
        assert!(fit(start(), &series(&[(0, 20.0), (10, 21.0)])).is_none());
        assert!(fit(start(), &series(&[(0, 20.0), (10, f64::NAN), (20, 22.0)])).is_none());
    }

    #[test]
    fn test_same_timestamp_has_no_trend() {
        // ---
        assert!(fit(start(), &series(&[(5, 20.0), (5, 21.0), (5, 22.0)])).is_none());
    }

    #[test]
    fn test_flat_and_noisy_series() {
        // ---
        let flat = fit(start(), &series(&[(0, 22.0), (10, 22.0), (20, 22.0)])).unwrap();
        assert_eq!(flat.slope_per_minute, 0.0);
        assert_eq!(flat.r_squared, 0.0);

        let noisy = fit(
            start(),
            &series(&[(0, 20.0), (10, 24.0), (20, 19.0), (30, 25.0), (40, 21.0)]),
        )
        .unwrap();
        assert!(noisy.r_squared < 0.5);
    }
}
