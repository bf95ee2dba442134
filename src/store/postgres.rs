//! PostgreSQL backend built on a `sqlx` pool.
//!
//! Enum-valued columns are stored as TEXT and parsed back through the
//! models' `FromStr` impls; a value that fails to parse surfaces as
//! [`StoreError::Corrupt`] rather than a panic.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{
    AlertInsert, AlertStore, CommandStore, DedupeScope, ReadingStore, RuleStore, StoreError,
    EXPIRED_MESSAGE,
};
use crate::models::{
    Alert, AutomationRule, CommandStatus, Condition, DeviceCommand, Prediction, Reading,
    RuleAction, SensorType,
};

// ---

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse<T>(entity: &'static str, raw: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse::<T>().map_err(|e| StoreError::corrupt(entity, e))
}

fn to_u32(entity: &'static str, column: &str, raw: i32) -> Result<u32, StoreError> {
    u32::try_from(raw).map_err(|_| StoreError::corrupt(entity, format!("negative {column}: {raw}")))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

// ---

#[derive(FromRow)]
struct ReadingRow {
    user_id: String,
    device_id: String,
    sensor_type: String,
    value: f64,
    unit: String,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = StoreError;

    fn try_from(row: ReadingRow) -> Result<Self, Self::Error> {
        Ok(Reading {
            user_id: row.user_id,
            device_id: row.device_id,
            sensor_type: parse("reading", &row.sensor_type)?,
            value: row.value,
            unit: row.unit,
            timestamp: row.recorded_at,
        })
    }
}

#[derive(FromRow)]
struct RuleRow {
    id: Uuid,
    user_id: String,
    name: String,
    metric: String,
    operator: String,
    value: Option<f64>,
    min_value: Option<f64>,
    max_value: Option<f64>,
    duration_minutes: i32,
    cooldown_minutes: i32,
    device_id: Option<String>,
    actuator: String,
    state: String,
    action_duration_seconds: Option<i32>,
    enabled: bool,
    last_triggered_at: Option<DateTime<Utc>>,
}

impl RuleRow {
    fn condition(&self) -> Result<Condition, StoreError> {
        // ---
        let scalar = || {
            self.value.ok_or_else(|| {
                StoreError::corrupt("rule", format!("{} without value", self.operator))
            })
        };
        let range = || match (self.min_value, self.max_value) {
            (Some(min), Some(max)) => Ok((min, max)),
            _ => Err(StoreError::corrupt(
                "rule",
                format!("{} without min/max", self.operator),
            )),
        };

        match self.operator.as_str() {
            "gt" => Ok(Condition::Gt(scalar()?)),
            "gte" => Ok(Condition::Gte(scalar()?)),
            "lt" => Ok(Condition::Lt(scalar()?)),
            "lte" => Ok(Condition::Lte(scalar()?)),
            "between" => range().map(|(min, max)| Condition::Between { min, max }),
            "outside" => range().map(|(min, max)| Condition::Outside { min, max }),
            other => Err(StoreError::corrupt("rule", format!("unknown operator '{other}'"))),
        }
    }
}

impl TryFrom<RuleRow> for AutomationRule {
    type Error = StoreError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        let condition = row.condition()?;
        Ok(AutomationRule {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            metric: parse("rule", &row.metric)?,
            condition,
            duration_minutes: to_u32("rule", "duration_minutes", row.duration_minutes)?,
            cooldown_minutes: to_u32("rule", "cooldown_minutes", row.cooldown_minutes)?,
            device_id: row.device_id,
            action: RuleAction {
                actuator: row.actuator,
                state: row.state,
                duration_seconds: row
                    .action_duration_seconds
                    .map(|s| to_u32("rule", "action_duration_seconds", s))
                    .transpose()?,
            },
            enabled: row.enabled,
            last_triggered_at: row.last_triggered_at,
        })
    }
}

#[derive(FromRow)]
struct CommandRow {
    id: Uuid,
    user_id: String,
    device_id: String,
    actuator: String,
    state: String,
    duration_seconds: Option<i32>,
    source: String,
    status: String,
    rule_id: Option<Uuid>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    result_message: Option<String>,
}

impl TryFrom<CommandRow> for DeviceCommand {
    type Error = StoreError;

    fn try_from(row: CommandRow) -> Result<Self, Self::Error> {
        Ok(DeviceCommand {
            id: row.id,
            user_id: row.user_id,
            device_id: row.device_id,
            actuator: row.actuator,
            state: row.state,
            duration_seconds: row
                .duration_seconds
                .map(|s| to_u32("command", "duration_seconds", s))
                .transpose()?,
            source: parse("command", &row.source)?,
            status: parse("command", &row.status)?,
            rule_id: row.rule_id,
            issued_at: row.issued_at,
            expires_at: row.expires_at,
            delivered_at: row.delivered_at,
            completed_at: row.completed_at,
            result_message: row.result_message,
        })
    }
}

fn commands_from(rows: Vec<CommandRow>) -> Result<Vec<DeviceCommand>, StoreError> {
    let mut commands = rows
        .into_iter()
        .map(DeviceCommand::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    // RETURNING does not preserve the subquery order
    commands.sort_by_key(|c| c.issued_at);
    Ok(commands)
}

const COMMAND_COLUMNS: &str = "id, user_id, device_id, actuator, state, duration_seconds, \
     source, status, rule_id, issued_at, expires_at, delivered_at, completed_at, result_message";

// ---

#[async_trait]
impl ReadingStore for PgStore {
    async fn append(&self, readings: &[Reading]) -> Result<(), StoreError> {
        // ---
        let mut tx = self.pool.begin().await?;
        for reading in readings {
            sqlx::query(
                r#"
                INSERT INTO readings (user_id, device_id, sensor_type, value, unit, recorded_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&reading.user_id)
            .bind(&reading.device_id)
            .bind(reading.sensor_type.as_str())
            .bind(reading.value)
            .bind(&reading.unit)
            .bind(reading.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn readings_since(
        &self,
        user_id: &str,
        device_id: &str,
        sensor: SensorType,
        since: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError> {
        // ---
        let rows: Vec<ReadingRow> = sqlx::query_as(
            r#"
            SELECT user_id, device_id, sensor_type, value, unit, recorded_at
            FROM readings
            WHERE user_id = $1 AND device_id = $2 AND sensor_type = $3 AND recorded_at >= $4
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .bind(sensor.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Reading::try_from).collect()
    }

    async fn window(
        &self,
        user_id: &str,
        device_id: &str,
        since: DateTime<Utc>,
        cap: usize,
    ) -> Result<Vec<Reading>, StoreError> {
        // ---
        let rows: Vec<ReadingRow> = sqlx::query_as(
            r#"
            SELECT * FROM (
                SELECT user_id, device_id, sensor_type, value, unit, recorded_at
                FROM readings
                WHERE user_id = $1 AND device_id = $2 AND recorded_at >= $3
                ORDER BY recorded_at DESC
                LIMIT $4
            ) recent
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .bind(since)
        .bind(i64::try_from(cap).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Reading::try_from).collect()
    }
}

#[async_trait]
impl RuleStore for PgStore {
    async fn candidate_rules(
        &self,
        user_id: &str,
        device_id: &str,
        metric: SensorType,
    ) -> Result<Vec<AutomationRule>, StoreError> {
        // ---
        let rows: Vec<RuleRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, name, metric, operator, value, min_value, max_value,
                   duration_minutes, cooldown_minutes, device_id, actuator, state,
                   action_duration_seconds, enabled, last_triggered_at
            FROM automation_rules
            WHERE user_id = $1
              AND metric = $2
              AND enabled
              AND (device_id IS NULL OR device_id = $3)
            ORDER BY id
            "#,
        )
        .bind(user_id)
        .bind(metric.as_str())
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AutomationRule::try_from).collect()
    }

    async fn claim_trigger(
        &self,
        rule_id: Uuid,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // ---
        // The cooldown comparison and the write are one statement, so two
        // concurrent evaluations cannot both win.
        let result = sqlx::query(
            r#"
            UPDATE automation_rules
            SET last_triggered_at = $2
            WHERE id = $1
              AND (last_triggered_at IS NULL OR last_triggered_at <= $3)
            "#,
        )
        .bind(rule_id)
        .bind(now)
        .bind(now - cooldown)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl CommandStore for PgStore {
    async fn insert(&self, command: &DeviceCommand) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO device_commands (
                id, user_id, device_id, actuator, state, duration_seconds,
                source, status, rule_id, issued_at, expires_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(command.id)
        .bind(&command.user_id)
        .bind(&command.device_id)
        .bind(&command.actuator)
        .bind(&command.state)
        .bind(command.duration_seconds.map(to_i32))
        .bind(command.source.as_str())
        .bind(command.status.as_str())
        .bind(command.rule_id)
        .bind(command.issued_at)
        .bind(command.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeviceCommand>, StoreError> {
        // ---
        let row: Option<CommandRow> = sqlx::query_as(&format!(
            "SELECT {COMMAND_COLUMNS} FROM device_commands WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeviceCommand::try_from).transpose()
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<DeviceCommand>, StoreError> {
        // ---
        let rows: Vec<CommandRow> = sqlx::query_as(&format!(
            r#"
            UPDATE device_commands
            SET status = 'expired', completed_at = $1, result_message = $2
            WHERE status IN ('pending', 'delivered') AND expires_at <= $1
            RETURNING {COMMAND_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(EXPIRED_MESSAGE)
        .fetch_all(&self.pool)
        .await?;

        commands_from(rows)
    }

    async fn claim_pending(
        &self,
        user_id: &str,
        device_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeviceCommand>, StoreError> {
        // ---
        // Single statement claim; SKIP LOCKED lets a concurrent poller take
        // the next rows instead of delivering the same ones.
        let rows: Vec<CommandRow> = sqlx::query_as(&format!(
            r#"
            UPDATE device_commands
            SET status = 'delivered', delivered_at = $4
            WHERE id IN (
                SELECT id FROM device_commands
                WHERE user_id = $1 AND device_id = $2
                  AND status = 'pending' AND expires_at > $4
                ORDER BY issued_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'pending'
            RETURNING {COMMAND_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(device_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        commands_from(rows)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: CommandStatus,
        to: CommandStatus,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<DeviceCommand>, StoreError> {
        // ---
        if !from.can_transition_to(to) {
            return Ok(None);
        }

        let completed_at = to.is_terminal().then_some(now);
        let row: Option<CommandRow> = sqlx::query_as(&format!(
            r#"
            UPDATE device_commands
            SET status = $3,
                completed_at = COALESCE($4, completed_at),
                result_message = CASE WHEN $4 IS NULL THEN result_message ELSE $5 END
            WHERE id = $1 AND status = $2
            RETURNING {COMMAND_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(completed_at)
        .bind(message)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DeviceCommand::try_from).transpose()
    }
}

// ---

#[derive(FromRow)]
struct AlertIdRow {
    id: Uuid,
}

#[async_trait]
impl AlertStore for PgStore {
    async fn insert_deduped(
        &self,
        alert: &Alert,
        scope: DedupeScope,
    ) -> Result<AlertInsert, StoreError> {
        // ---
        let key = alert.dedupe_key();
        let mut tx = self.pool.begin().await?;

        // Serialize writers of the same dedupe key for the rest of the
        // transaction; released automatically on commit/rollback.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
            .bind(format!(
                "{}|{}|{}|{}",
                alert.user_id,
                alert.device_id,
                alert.origin.as_str(),
                key
            ))
            .execute(&mut *tx)
            .await?;

        let existing: Option<AlertIdRow> = sqlx::query_as(
            r#"
            SELECT id FROM alerts
            WHERE user_id = $1 AND device_id = $2 AND origin = $3 AND dedupe_key = $4
              AND created_at >= $5
              AND (NOT $6 OR NOT is_resolved)
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(&alert.user_id)
        .bind(&alert.device_id)
        .bind(alert.origin.as_str())
        .bind(key)
        .bind(scope.since)
        .bind(scope.unresolved_only)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = existing {
            tx.rollback().await?;
            return Ok(AlertInsert::Suppressed {
                existing: Some(row.id),
            });
        }

        let prediction = alert.prediction.as_ref();
        let inserted = sqlx::query(
            r#"
            INSERT INTO alerts (
                id, user_id, device_id, alert_type, severity, legacy_severity,
                confidence, origin, risk_category, dedupe_key,
                prediction_window_minutes, prediction_score, prediction_based_on,
                message, value, threshold, is_resolved, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(alert.id)
        .bind(&alert.user_id)
        .bind(&alert.device_id)
        .bind(&alert.alert_type)
        .bind(alert.severity.as_str())
        .bind(alert.legacy_severity.as_str())
        .bind(i16::from(alert.confidence))
        .bind(alert.origin.as_str())
        .bind(alert.risk_category.map(|c| c.as_str()))
        .bind(key)
        .bind(prediction.map(|p| to_i32(p.window_minutes)))
        .bind(prediction.map(|p| p.score))
        .bind(prediction.map(based_on_names))
        .bind(&alert.message)
        .bind(alert.value)
        .bind(alert.threshold)
        .bind(alert.is_resolved)
        .bind(alert.created_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await?;
                Ok(AlertInsert::Created)
            }
            // A racing writer that bypassed the lock already holds the row
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                tracing::debug!(
                    alert_id = %alert.id,
                    "alert insert hit unique constraint; treating as already alerted"
                );
                Ok(AlertInsert::Suppressed { existing: None })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve(&self, user_id: &str, id: Uuid) -> Result<bool, StoreError> {
        // ---
        let result =
            sqlx::query("UPDATE alerts SET is_resolved = TRUE WHERE id = $1 AND user_id = $2")
                .bind(id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn based_on_names(prediction: &Prediction) -> Vec<String> {
    prediction
        .based_on
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}
