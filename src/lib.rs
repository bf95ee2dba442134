//! Alerting, automation and risk-forecasting core for controlled-environment
//! agriculture sensors.
//!
//! The crate follows the Explicit Module Boundary Pattern (EMBP): modules are
//! private and everything other crates (the binary, the integration tests)
//! need is re-exported here. Sibling modules import through `crate::<module>`
//! so each file only knows its own gateway.
//!
//! - `store`: persistence traits with PostgreSQL and in-memory backends
//! - `reactive`: threshold alerts with debounce
//! - `rules`: automation rule evaluation
//! - `commands`: device command lifecycle
//! - `forecast`: trend fitting and predictive risk alerts
//! - `events` / `notify`: internal event bus and its external adapters
//! - `routes`: the axum HTTP surface

mod commands;
mod config;
mod events;
mod forecast;
mod models;
mod notify;
mod presence;
mod reactive;
mod routes;
mod rules;
mod schema;
mod severity;
mod state;
mod store;

pub use commands::{AckStatus, CommandError, CommandManager, DEFAULT_POLL_LIMIT, MAX_POLL_LIMIT};
pub use config::{load_from_env, Config, StoreBackend};
pub use events::{BusEvent, EventBus, Published};
pub use forecast::{spawn_scheduler, ForecastOptions, ForecastSettings, Forecaster};
pub use models::{
    Alert, AlertOrigin, AutomationRule, CommandSource, CommandStatus, Condition, DeviceCommand,
    Direction, NewCommand, Prediction, Reading, RiskCategory, RuleAction, SafeRange, SensorType,
};
pub use notify::{spawn_log_forwarder, spawn_webhook_forwarder};
pub use presence::{DeviceKey, Presence};
pub use reactive::ReactiveAlerter;
pub use routes::router;
pub use rules::{Evaluation, RuleEvaluator, TriggeredRule};
pub use schema::create_schema;
pub use severity::{
    clamp_confidence, severity_from_score, LegacySeverity, Severity, DEFAULT_CONFIDENCE,
};
pub use state::AppState;
pub use store::{
    AlertInsert, AlertStore, CommandStore, DedupeScope, MemoryStore, PgStore, ReadingStore,
    RuleStore, StoreError, Stores,
};
