//! Configuration loader for the `cea-sentinel` service.
//!
//! Every runtime tunable is read here once, from the environment (with an
//! optional `.env` file loaded by the caller), into an immutable [`Config`].
//! Nothing else in the crate calls `env::var`.
use std::{env, net::SocketAddr, str::FromStr};

use anyhow::{anyhow, bail, Result};

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional environment variable of any `FromStr` type.
macro_rules! parse_env {
    ($var_name:expr, $ty:ty, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Where readings, rules, commands and alerts live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl StoreBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            StoreBackend::Postgres => "postgres",
            StoreBackend::Memory => "memory",
        }
    }
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => bail!("unknown store backend '{other}' (expected postgres or memory)"),
        }
    }
}

/// Strongly typed application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    pub backend: StoreBackend,

    /// PostgreSQL connection string. Empty for the memory backend.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    pub listen_addr: SocketAddr,

    /// Reactive alert debounce window.
    pub alert_debounce_minutes: u32,

    /// Predictive alert debounce window.
    pub predictive_debounce_minutes: u32,

    /// Lifetime of an unacknowledged command.
    pub command_ttl_minutes: u32,

    pub forecast_lookback_minutes: u32,
    pub forecast_sample_cap: u32,

    /// Scheduler period; `0` disables scheduled forecasting.
    pub forecast_interval_secs: u32,

    /// Optional endpoint receiving every bus event as JSON.
    pub webhook_url: Option<String>,

    pub event_bus_capacity: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            db_url: String::new(),
            db_pool_max: 5,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            alert_debounce_minutes: 30,
            predictive_debounce_minutes: 120,
            command_ttl_minutes: 10,
            forecast_lookback_minutes: 180,
            forecast_sample_cap: 500,
            forecast_interval_secs: 300,
            webhook_url: None,
            event_bus_capacity: 256,
        }
    }
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string (postgres backend only)
///
/// Optional:
/// - `STORE_BACKEND` – `postgres` or `memory` (default: postgres)
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `LISTEN_ADDR` – bind address (default: 0.0.0.0:8080)
/// - `ALERT_DEBOUNCE_MINUTES` (30), `PREDICTIVE_DEBOUNCE_MINUTES` (120)
/// - `COMMAND_TTL_MINUTES` (10)
/// - `FORECAST_LOOKBACK_MINUTES` (180), `FORECAST_SAMPLE_CAP` (500)
/// - `FORECAST_INTERVAL_SECS` (300, 0 disables)
/// - `NOTIFY_WEBHOOK_URL` – webhook receiving bus events
/// - `EVENT_BUS_CAPACITY` (256)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let defaults = Config::default();

    let backend = parse_env!("STORE_BACKEND", StoreBackend, StoreBackend::Postgres);
    let db_url = match backend {
        StoreBackend::Postgres => require_env!("DATABASE_URL"),
        StoreBackend::Memory => env::var("DATABASE_URL").unwrap_or_default(),
    };

    let webhook_url = env::var("NOTIFY_WEBHOOK_URL")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let config = Config {
        backend,
        db_url,
        db_pool_max: parse_env_u32!("DB_POOL_MAX", defaults.db_pool_max),
        listen_addr: parse_env!("LISTEN_ADDR", SocketAddr, defaults.listen_addr),
        alert_debounce_minutes: parse_env_u32!(
            "ALERT_DEBOUNCE_MINUTES",
            defaults.alert_debounce_minutes
        ),
        predictive_debounce_minutes: parse_env_u32!(
            "PREDICTIVE_DEBOUNCE_MINUTES",
            defaults.predictive_debounce_minutes
        ),
        command_ttl_minutes: parse_env_u32!("COMMAND_TTL_MINUTES", defaults.command_ttl_minutes),
        forecast_lookback_minutes: parse_env_u32!(
            "FORECAST_LOOKBACK_MINUTES",
            defaults.forecast_lookback_minutes
        ),
        forecast_sample_cap: parse_env_u32!("FORECAST_SAMPLE_CAP", defaults.forecast_sample_cap),
        forecast_interval_secs: parse_env_u32!(
            "FORECAST_INTERVAL_SECS",
            defaults.forecast_interval_secs
        ),
        webhook_url,
        event_bus_capacity: parse_env_u32!("EVENT_BUS_CAPACITY", defaults.event_bus_capacity),
    };

    if config.command_ttl_minutes == 0 {
        bail!("COMMAND_TTL_MINUTES must be greater than zero");
    }
    if config.forecast_lookback_minutes == 0 {
        bail!("FORECAST_LOOKBACK_MINUTES must be greater than zero");
    }

    Ok(config)
}

/// Replace the password component of a connection URL with `****`.
fn mask_password(url: &str) -> String {
    // ---
    let Some(at_pos) = url.rfind('@') else {
        return url.to_string();
    };
    // Skip the scheme's own ':'
    let user_start = url.find("://").map_or(0, |pos| pos + 3);
    if user_start > at_pos {
        return url.to_string();
    }
    match url[user_start..at_pos].rfind(':') {
        Some(offset) => {
            let colon_pos = user_start + offset;
            format!("{}:****{}", &url[..colon_pos], &url[at_pos..])
        }
        None => url.to_string(),
    }
}

impl Config {
    /// Log the loaded configuration with the database password masked.
    pub fn log_config(&self) {
        // ---
        let db_url = if self.db_url.is_empty() {
            "(unused)".to_string()
        } else {
            mask_password(&self.db_url)
        };

        tracing::info!("Configuration loaded:");
        tracing::info!("  STORE_BACKEND               : {}", self.backend.as_str());
        tracing::info!("  DATABASE_URL                : {}", db_url);
        tracing::info!("  DB_POOL_MAX                 : {}", self.db_pool_max);
        tracing::info!("  LISTEN_ADDR                 : {}", self.listen_addr);
        tracing::info!("  ALERT_DEBOUNCE_MINUTES      : {}", self.alert_debounce_minutes);
        tracing::info!("  PREDICTIVE_DEBOUNCE_MINUTES : {}", self.predictive_debounce_minutes);
        tracing::info!("  COMMAND_TTL_MINUTES         : {}", self.command_ttl_minutes);
        tracing::info!("  FORECAST_LOOKBACK_MINUTES   : {}", self.forecast_lookback_minutes);
        tracing::info!("  FORECAST_SAMPLE_CAP         : {}", self.forecast_sample_cap);
        tracing::info!("  FORECAST_INTERVAL_SECS      : {}", self.forecast_interval_secs);
        tracing::info!(
            "  NOTIFY_WEBHOOK_URL          : {}",
            self.webhook_url.as_deref().unwrap_or("(none)")
        );
        tracing::info!("  EVENT_BUS_CAPACITY          : {}", self.event_bus_capacity);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_backend_parsing() {
        // ---
        assert_eq!("postgres".parse::<StoreBackend>().unwrap(), StoreBackend::Postgres);
        assert_eq!(" Memory ".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert!("redis".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_password_is_masked() {
        // ---
        assert_eq!(
            mask_password("postgres://sentinel:secret@db:5432/cea"),
            "postgres://sentinel:****@db:5432/cea"
        );
        assert_eq!(mask_password("postgres://db/cea"), "postgres://db/cea");
        assert_eq!(mask_password("postgres://sentinel@db/cea"), "postgres://sentinel@db/cea");
    }
}
