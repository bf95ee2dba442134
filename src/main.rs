//! Application entry point for the `cea-sentinel` service.
//!
//! Startup sequence:
//! - Initialize structured logging/tracing
//! - Load configuration from environment variables or `.env`
//! - Open the selected store backend (PostgreSQL pool + schema, or memory)
//! - Start the event bus adapters and the forecast scheduler
//! - Mount the API routes and serve them with axum
//!
//! # Environment Variables
//! See [`cea_sentinel::load_from_env`] for the service settings, plus:
//! - `AXUM_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `AXUM_SPAN_EVENTS` (optional) – span event mode for tracing
//! - `FORCE_COLOR` (optional) – force ANSI colors on or off
use std::{env, sync::Arc, time::Duration};

use anyhow::Result;
use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use cea_sentinel::{
    create_schema, load_from_env, router, spawn_log_forwarder, spawn_scheduler,
    spawn_webhook_forwarder, AppState, MemoryStore, StoreBackend, Stores,
};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = load_from_env()?;
    cfg.log_config();

    let stores = match cfg.backend {
        StoreBackend::Postgres => {
            tracing::info!("Connecting to database");
            let pool = PgPoolOptions::new()
                .max_connections(cfg.db_pool_max)
                .connect(&cfg.db_url)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;
            tracing::info!("Successfully connected to database");

            create_schema(&pool).await?;
            Stores::postgres(pool)
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; data is lost on restart");
            Stores::memory(Arc::new(MemoryStore::new()))
        }
    };

    let addr = cfg.listen_addr;
    let state = AppState::new(stores, cfg);

    spawn_log_forwarder(&state.bus);
    if let Some(url) = state.config.webhook_url.clone() {
        tracing::info!(%url, "Forwarding events to webhook");
        spawn_webhook_forwarder(&state.bus, url);
    }

    match state.config.forecast_interval_secs {
        0 => tracing::info!("Scheduled forecasting disabled"),
        secs => {
            tracing::info!(every_secs = secs, "Scheduled forecasting enabled");
            spawn_scheduler(
                state.forecaster.clone(),
                state.presence.clone(),
                Duration::from_secs(u64::from(secs)),
            );
        }
    }

    // Build app from routes gateway (EMBP)
    let app: Router = router(state);

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// - Log target, file, and line number output enabled
/// - Colors from `FORCE_COLOR` (`1|true|yes` on, `0|false|no` off), otherwise
///   TTY detection
/// - Span events from `AXUM_SPAN_EVENTS`: `full`, `enter_exit`, or CLOSE only
/// - Filter from `RUST_LOG` when set, otherwise `AXUM_LOG_LEVEL` with sqlx
///   query logging held at `warn`
///
/// Call once, before any tracing macro runs.
fn init_tracing() {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
