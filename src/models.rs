//! Data models for readings, automation rules, device commands and alerts.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::severity::{LegacySeverity, Severity};

// ---

/// Sensor channels reported by grow devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SensorType {
    Temperature,
    Humidity,
    Co2,
    Light,
    SoilMoisture,
}

impl SensorType {
    pub const ALL: [SensorType; 5] = [
        SensorType::Temperature,
        SensorType::Humidity,
        SensorType::Co2,
        SensorType::Light,
        SensorType::SoilMoisture,
    ];

    /// Wire/database name.
    pub fn as_str(self) -> &'static str {
        match self {
            SensorType::Temperature => "temperature",
            SensorType::Humidity => "humidity",
            SensorType::Co2 => "co2",
            SensorType::Light => "light",
            SensorType::SoilMoisture => "soilMoisture",
        }
    }

    /// Snake-case label used inside alert types (`low_soil_moisture`).
    pub fn label(self) -> &'static str {
        match self {
            SensorType::SoilMoisture => "soil_moisture",
            other => other.as_str(),
        }
    }

    /// Unit the normalizer delivers this channel in.
    pub fn default_unit(self) -> &'static str {
        match self {
            SensorType::Temperature => "°C",
            SensorType::Humidity | SensorType::SoilMoisture => "%",
            SensorType::Co2 => "ppm",
            SensorType::Light => "lux",
        }
    }

    /// Static safe operating range for this channel.
    pub fn safe_range(self) -> SafeRange {
        match self {
            SensorType::Temperature => SafeRange::new(18.0, 30.0),
            SensorType::Humidity => SafeRange::new(40.0, 80.0),
            SensorType::Co2 => SafeRange::new(400.0, 1500.0),
            SensorType::Light => SafeRange::new(2_000.0, 50_000.0),
            SensorType::SoilMoisture => SafeRange::new(30.0, 70.0),
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperature" => Ok(SensorType::Temperature),
            "humidity" => Ok(SensorType::Humidity),
            "co2" => Ok(SensorType::Co2),
            "light" => Ok(SensorType::Light),
            "soilMoisture" | "soil_moisture" => Ok(SensorType::SoilMoisture),
            other => Err(format!("unknown sensor type '{other}'")),
        }
    }
}

/// Which side of a [`SafeRange`] a value fell out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Low,
    High,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Low => "low",
            Direction::High => "high",
        }
    }
}

/// A value outside its safe range, measured against the boundary it crossed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Violation {
    pub direction: Direction,
    pub boundary: f64,
    /// Absolute distance past the boundary, always positive.
    pub distance: f64,
}

/// Inclusive `[min, max]` band considered healthy for a channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafeRange {
    pub min: f64,
    pub max: f64,
}

impl SafeRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn span(&self) -> f64 {
        self.max - self.min
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Describe how `value` leaves the range, or `None` when it is inside.
    pub fn violation(&self, value: f64) -> Option<Violation> {
        // ---
        if value < self.min {
            Some(Violation {
                direction: Direction::Low,
                boundary: self.min,
                distance: self.min - value,
            })
        } else if value > self.max {
            Some(Violation {
                direction: Direction::High,
                boundary: self.max,
                distance: value - self.max,
            })
        } else {
            None
        }
    }

    /// The boundary closest to `value`.
    pub fn nearest_boundary(&self, value: f64) -> f64 {
        if value >= (self.min + self.max) / 2.0 {
            self.max
        } else {
            self.min
        }
    }
}

// ---

/// One unit-normalized sample. Readings are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    // ---
    pub user_id: String,
    pub device_id: String,
    pub sensor_type: SensorType,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

// ---

/// Automation condition; the operator and its operand travel together.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operator", content = "value", rename_all = "lowercase")]
pub enum Condition {
    Gt(f64),
    Gte(f64),
    Lt(f64),
    Lte(f64),
    Between { min: f64, max: f64 },
    Outside { min: f64, max: f64 },
}

impl Condition {
    /// Evaluate the predicate against a single sample.
    pub fn matches(&self, value: f64) -> bool {
        // ---
        match *self {
            Condition::Gt(limit) => value > limit,
            Condition::Gte(limit) => value >= limit,
            Condition::Lt(limit) => value < limit,
            Condition::Lte(limit) => value <= limit,
            Condition::Between { min, max } => value >= min && value <= max,
            Condition::Outside { min, max } => value < min || value > max,
        }
    }

    pub fn operator(&self) -> &'static str {
        match self {
            Condition::Gt(_) => "gt",
            Condition::Gte(_) => "gte",
            Condition::Lt(_) => "lt",
            Condition::Lte(_) => "lte",
            Condition::Between { .. } => "between",
            Condition::Outside { .. } => "outside",
        }
    }
}

/// What to do when a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAction {
    pub actuator: String,
    pub state: String,
    pub duration_seconds: Option<u32>,
}

/// An automation rule authored by the user. Only `last_triggered_at` is
/// written by this service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    // ---
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub metric: SensorType,
    pub condition: Condition,
    pub duration_minutes: u32,
    pub cooldown_minutes: u32,
    /// `None` applies the rule to every device of the user.
    pub device_id: Option<String>,
    pub action: RuleAction,
    pub enabled: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

impl AutomationRule {
    pub fn applies_to(&self, device_id: &str) -> bool {
        self.device_id.as_deref().map_or(true, |scope| scope == device_id)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::minutes(i64::from(self.cooldown_minutes))
    }

    /// True when no firing happened within the cooldown interval before `now`.
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.last_triggered_at
            .map_or(true, |last| now - last >= self.cooldown())
    }
}

// ---

/// Lifecycle state of a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Delivered,
    Executed,
    Failed,
    Expired,
    Cancelled,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Delivered => "delivered",
            CommandStatus::Executed => "executed",
            CommandStatus::Failed => "failed",
            CommandStatus::Expired => "expired",
            CommandStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Executed
                | CommandStatus::Failed
                | CommandStatus::Expired
                | CommandStatus::Cancelled
        )
    }

    /// Edges of the command state machine.
    pub fn can_transition_to(self, next: CommandStatus) -> bool {
        // ---
        use CommandStatus::*;
        matches!(
            (self, next),
            (Pending, Delivered)
                | (Pending, Expired)
                | (Pending, Cancelled)
                | (Delivered, Executed)
                | (Delivered, Failed)
                | (Delivered, Expired)
        )
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "delivered" => Ok(CommandStatus::Delivered),
            "executed" => Ok(CommandStatus::Executed),
            "failed" => Ok(CommandStatus::Failed),
            "expired" => Ok(CommandStatus::Expired),
            "cancelled" => Ok(CommandStatus::Cancelled),
            other => Err(format!("unknown command status '{other}'")),
        }
    }
}

/// Who asked for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandSource {
    Manual,
    Automation,
    Assistant,
}

impl CommandSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandSource::Manual => "manual",
            CommandSource::Automation => "automation",
            CommandSource::Assistant => "assistant",
        }
    }
}

impl FromStr for CommandSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(CommandSource::Manual),
            "automation" => Ok(CommandSource::Automation),
            "assistant" => Ok(CommandSource::Assistant),
            other => Err(format!("unknown command source '{other}'")),
        }
    }
}

/// Parameters for a command about to be issued.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub user_id: String,
    pub device_id: String,
    pub actuator: String,
    pub state: String,
    pub duration_seconds: Option<u32>,
    pub source: CommandSource,
    pub rule_id: Option<Uuid>,
}

/// An actuator command addressed to one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCommand {
    // ---
    pub id: Uuid,
    pub user_id: String,
    pub device_id: String,
    pub actuator: String,
    pub state: String,
    pub duration_seconds: Option<u32>,
    pub source: CommandSource,
    pub status: CommandStatus,
    pub rule_id: Option<Uuid>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_message: Option<String>,
}

impl DeviceCommand {
    /// Build a pending command that expires `ttl` after `now`.
    pub fn pending(new: NewCommand, now: DateTime<Utc>, ttl: Duration) -> Self {
        // ---
        DeviceCommand {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            device_id: new.device_id,
            actuator: new.actuator,
            state: new.state,
            duration_seconds: new.duration_seconds,
            source: new.source,
            status: CommandStatus::Pending,
            rule_id: new.rule_id,
            issued_at: now,
            expires_at: now + ttl,
            delivered_at: None,
            completed_at: None,
            result_message: None,
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.expires_at <= now
    }
}

// ---

/// Which generator produced an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertOrigin {
    Reactive,
    Predictive,
}

impl AlertOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertOrigin::Reactive => "reactive",
            AlertOrigin::Predictive => "predictive",
        }
    }
}

impl FromStr for AlertOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reactive" => Ok(AlertOrigin::Reactive),
            "predictive" => Ok(AlertOrigin::Predictive),
            other => Err(format!("unknown alert origin '{other}'")),
        }
    }
}

/// Forecast risk families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    Irrigation,
    WeatherStress,
    Disease,
}

impl RiskCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskCategory::Irrigation => "irrigation",
            RiskCategory::WeatherStress => "weather_stress",
            RiskCategory::Disease => "disease",
        }
    }
}

impl fmt::Display for RiskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "irrigation" => Ok(RiskCategory::Irrigation),
            "weather_stress" => Ok(RiskCategory::WeatherStress),
            "disease" => Ok(RiskCategory::Disease),
            other => Err(format!("unknown risk category '{other}'")),
        }
    }
}

/// Forecast details attached to predictive alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub window_minutes: u32,
    pub score: f64,
    pub based_on: Vec<SensorType>,
}

/// A persisted alert, reactive or predictive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    // ---
    pub id: Uuid,
    pub user_id: String,
    pub device_id: String,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: Severity,
    pub legacy_severity: LegacySeverity,
    pub confidence: u8,
    pub origin: AlertOrigin,
    pub risk_category: Option<RiskCategory>,
    pub prediction: Option<Prediction>,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub is_resolved: bool,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    /// Key alerts are deduplicated on, together with user, device and origin.
    ///
    /// Predictive alerts dedupe per risk category, reactive ones per type.
    pub fn dedupe_key(&self) -> &str {
        match self.risk_category {
            Some(category) => category.as_str(),
            None => &self.alert_type,
        }
    }
}
