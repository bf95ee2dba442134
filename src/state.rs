//! Shared application state handed to every route.

use std::sync::Arc;

use chrono::Duration;

use crate::{
    commands::CommandManager,
    config::Config,
    events::EventBus,
    forecast::{ForecastSettings, Forecaster},
    presence::Presence,
    reactive::ReactiveAlerter,
    rules::RuleEvaluator,
    store::Stores,
};

/// Services wired over one set of stores and one event bus.
///
/// Cloning is cheap; every service shares the same stores and bus.
#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub bus: EventBus,
    pub presence: Presence,
    pub reactive: ReactiveAlerter,
    pub evaluator: RuleEvaluator,
    pub commands: CommandManager,
    pub forecaster: Forecaster,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(stores: Stores, config: Config) -> Self {
        // ---
        let bus = EventBus::new(config.event_bus_capacity as usize);
        let minutes = |m: u32| Duration::minutes(i64::from(m));

        let commands = CommandManager::new(
            stores.commands.clone(),
            bus.clone(),
            minutes(config.command_ttl_minutes),
        );
        let reactive = ReactiveAlerter::new(
            stores.alerts.clone(),
            bus.clone(),
            minutes(config.alert_debounce_minutes),
        );
        let evaluator = RuleEvaluator::new(
            stores.readings.clone(),
            stores.rules.clone(),
            commands.clone(),
            bus.clone(),
        );
        let forecaster = Forecaster::new(
            stores.readings.clone(),
            stores.alerts.clone(),
            bus.clone(),
            ForecastSettings {
                lookback_minutes: config.forecast_lookback_minutes,
                sample_cap: config.forecast_sample_cap as usize,
                debounce: minutes(config.predictive_debounce_minutes),
            },
        );

        Self {
            stores,
            bus,
            presence: Presence::new(),
            reactive,
            evaluator,
            commands,
            forecaster,
            config: Arc::new(config),
        }
    }
}
