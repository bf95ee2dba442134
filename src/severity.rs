//! Severity and confidence vocabulary shared by both alert generators.
//!
//! Alerts carry a canonical three-level [`Severity`] plus a [`LegacySeverity`]
//! mirror for consumers that still speak the older four-level scale.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Confidence reported when a score is missing or not a finite number.
pub const DEFAULT_CONFIDENCE: u8 = 60;

/// Risk score at or above which an alert is critical.
pub const CRITICAL_SCORE: f64 = 75.0;

/// Risk score at or above which an alert is a warning.
pub const WARNING_SCORE: f64 = 45.0;

// ---

/// Canonical severity vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Four-level severity scale kept for older dashboards and exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegacySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    /// The legacy level this severity is mirrored as.
    pub fn legacy(self) -> LegacySeverity {
        LegacySeverity::from(self)
    }
}

impl LegacySeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            LegacySeverity::Low => "low",
            LegacySeverity::Medium => "medium",
            LegacySeverity::High => "high",
            LegacySeverity::Critical => "critical",
        }
    }
}

impl From<Severity> for LegacySeverity {
    fn from(severity: Severity) -> Self {
        // Canonical critical pairs with legacy "high"; legacy "critical" is
        // only ever produced by older writers.
        match severity {
            Severity::Info => LegacySeverity::Low,
            Severity::Warning => LegacySeverity::Medium,
            Severity::Critical => LegacySeverity::High,
        }
    }
}

impl From<LegacySeverity> for Severity {
    fn from(legacy: LegacySeverity) -> Self {
        match legacy {
            LegacySeverity::Low => Severity::Info,
            LegacySeverity::Medium => Severity::Warning,
            LegacySeverity::High | LegacySeverity::Critical => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            // Accept legacy spellings so old rows still load.
            other => other.parse::<LegacySeverity>().map(Severity::from),
        }
    }
}

impl FromStr for LegacySeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(LegacySeverity::Low),
            "medium" => Ok(LegacySeverity::Medium),
            "high" => Ok(LegacySeverity::High),
            "critical" => Ok(LegacySeverity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

// ---

/// Map a 0–100 risk score onto the canonical vocabulary.
pub fn severity_from_score(score: f64) -> Severity {
    // ---
    if score >= CRITICAL_SCORE {
        Severity::Critical
    } else if score >= WARNING_SCORE {
        Severity::Warning
    } else {
        Severity::Info
    }
}

/// Clamp a raw confidence into `0..=100`.
///
/// `None`, `NaN` and infinities all fall back to [`DEFAULT_CONFIDENCE`].
pub fn clamp_confidence(raw: Option<f64>) -> u8 {
    // ---
    match raw {
        Some(value) if value.is_finite() => value.round().clamp(0.0, 100.0) as u8,
        _ => DEFAULT_CONFIDENCE,
    }
}
