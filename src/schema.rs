//! Database schema management for `cea-sentinel`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates the `readings`, `automation_rules`, `device_commands` and `alerts`
/// tables plus the indexes behind the hot queries (sustained-window scans,
/// pending-command claims, alert dedupe lookups). Safe to call on every
/// startup; no-op if objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Append-only samples written by the ingestion route
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS readings (
            id           BIGSERIAL PRIMARY KEY,
            user_id      TEXT             NOT NULL,
            device_id    TEXT             NOT NULL,
            sensor_type  TEXT             NOT NULL,
            value        DOUBLE PRECISION NOT NULL,
            unit         TEXT             NOT NULL,
            recorded_at  TIMESTAMPTZ      NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Authored elsewhere; this service only writes last_triggered_at
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS automation_rules (
            id                      UUID PRIMARY KEY,
            user_id                 TEXT             NOT NULL,
            name                    TEXT             NOT NULL,
            metric                  TEXT             NOT NULL,
            operator                TEXT             NOT NULL,
            value                   DOUBLE PRECISION,
            min_value               DOUBLE PRECISION,
            max_value               DOUBLE PRECISION,
            duration_minutes        INTEGER          NOT NULL DEFAULT 0,
            cooldown_minutes        INTEGER          NOT NULL DEFAULT 0,
            device_id               TEXT,
            actuator                TEXT             NOT NULL,
            state                   TEXT             NOT NULL,
            action_duration_seconds INTEGER,
            enabled                 BOOLEAN          NOT NULL DEFAULT TRUE,
            last_triggered_at       TIMESTAMPTZ
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS device_commands (
            id               UUID PRIMARY KEY,
            user_id          TEXT        NOT NULL,
            device_id        TEXT        NOT NULL,
            actuator         TEXT        NOT NULL,
            state            TEXT        NOT NULL,
            duration_seconds INTEGER,
            source           TEXT        NOT NULL,
            status           TEXT        NOT NULL,
            rule_id          UUID,
            issued_at        TIMESTAMPTZ NOT NULL,
            expires_at       TIMESTAMPTZ NOT NULL,
            delivered_at     TIMESTAMPTZ,
            completed_at     TIMESTAMPTZ,
            result_message   TEXT
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id                        UUID PRIMARY KEY,
            user_id                   TEXT             NOT NULL,
            device_id                 TEXT             NOT NULL,
            alert_type                TEXT             NOT NULL,
            severity                  TEXT             NOT NULL,
            legacy_severity           TEXT             NOT NULL,
            confidence                SMALLINT         NOT NULL,
            origin                    TEXT             NOT NULL,
            risk_category             TEXT,
            dedupe_key                TEXT             NOT NULL,
            prediction_window_minutes INTEGER,
            prediction_score          DOUBLE PRECISION,
            prediction_based_on       TEXT[],
            message                   TEXT             NOT NULL,
            value                     DOUBLE PRECISION NOT NULL,
            threshold                 DOUBLE PRECISION NOT NULL,
            is_resolved               BOOLEAN          NOT NULL DEFAULT FALSE,
            created_at                TIMESTAMPTZ      NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Indexes for common queries
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_readings_device_time
            ON readings (user_id, device_id, sensor_type, recorded_at);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_rules_user_metric
            ON automation_rules (user_id, metric) WHERE enabled;
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_commands_open
            ON device_commands (user_id, device_id, issued_at)
            WHERE status IN ('pending', 'delivered');
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_alerts_dedupe
            ON alerts (user_id, device_id, origin, dedupe_key, created_at DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
