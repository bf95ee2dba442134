//! Storage gateway (EMBP): the traits the core talks to, plus the two
//! backends that implement them.
//!
//! Every write that guards an invariant is a single conditional operation
//! inside the backend:
//! - [`RuleStore::claim_trigger`] compares and sets `last_triggered_at`
//! - [`CommandStore::claim_pending`] moves pending commands to delivered
//! - [`AlertStore::insert_deduped`] checks the debounce window and inserts
//!
//! Callers never read-then-write for these.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Alert, AutomationRule, CommandStatus, DeviceCommand, Reading, SensorType};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// `result_message` stamped on commands the expiry sweep terminates.
pub const EXPIRED_MESSAGE: &str = "expired before completion";

// ---

/// Failure reported by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt {entity} record: {detail}")]
    Corrupt {
        entity: &'static str,
        detail: String,
    },
}

impl StoreError {
    pub(crate) fn corrupt(entity: &'static str, detail: impl Into<String>) -> Self {
        StoreError::Corrupt {
            entity,
            detail: detail.into(),
        }
    }
}

/// Window an alert is deduplicated against.
#[derive(Debug, Clone, Copy)]
pub struct DedupeScope {
    /// Only alerts created at or after this instant count.
    pub since: DateTime<Utc>,
    /// Ignore alerts that were already resolved.
    pub unresolved_only: bool,
}

/// Result of an [`AlertStore::insert_deduped`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertInsert {
    Created,
    /// A matching alert already exists inside the window.
    Suppressed { existing: Option<Uuid> },
}

// ---

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Append a batch of readings.
    async fn append(&self, readings: &[Reading]) -> Result<(), StoreError>;

    /// All samples of one channel for a device with `timestamp >= since`,
    /// oldest first.
    async fn readings_since(
        &self,
        user_id: &str,
        device_id: &str,
        sensor: SensorType,
        since: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StoreError>;

    /// The most recent `cap` samples (all channels) with `timestamp >= since`,
    /// returned oldest first.
    async fn window(
        &self,
        user_id: &str,
        device_id: &str,
        since: DateTime<Utc>,
        cap: usize,
    ) -> Result<Vec<Reading>, StoreError>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Enabled rules of `user_id` on `metric`, scoped to `device_id` or to
    /// every device.
    async fn candidate_rules(
        &self,
        user_id: &str,
        device_id: &str,
        metric: SensorType,
    ) -> Result<Vec<AutomationRule>, StoreError>;

    /// Atomically set `last_triggered_at = now` if the rule has not fired
    /// within `cooldown` of `now`. Returns whether this caller won the claim.
    async fn claim_trigger(
        &self,
        rule_id: Uuid,
        cooldown: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait CommandStore: Send + Sync {
    async fn insert(&self, command: &DeviceCommand) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<DeviceCommand>, StoreError>;

    /// Expire every pending or delivered command whose `expires_at <= now`.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<DeviceCommand>, StoreError>;

    /// Atomically mark up to `limit` of the oldest pending commands of a
    /// device as delivered and return them, oldest first.
    async fn claim_pending(
        &self,
        user_id: &str,
        device_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeviceCommand>, StoreError>;

    /// Move a command from `from` to `to` if it is still in `from`.
    ///
    /// Terminal targets stamp `completed_at = now` and store `message`.
    /// Returns `None` when the command was not in `from`.
    async fn transition(
        &self,
        id: Uuid,
        from: CommandStatus,
        to: CommandStatus,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<DeviceCommand>, StoreError>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Insert `alert` unless another alert with the same user, device,
    /// origin and [`Alert::dedupe_key`] exists inside `scope`.
    async fn insert_deduped(
        &self,
        alert: &Alert,
        scope: DedupeScope,
    ) -> Result<AlertInsert, StoreError>;

    /// Mark an alert of `user_id` resolved. Returns `false` if no such alert.
    async fn resolve(&self, user_id: &str, id: Uuid) -> Result<bool, StoreError>;
}

// ---

/// Handles to every store the core uses.
#[derive(Clone)]
pub struct Stores {
    pub readings: Arc<dyn ReadingStore>,
    pub rules: Arc<dyn RuleStore>,
    pub commands: Arc<dyn CommandStore>,
    pub alerts: Arc<dyn AlertStore>,
}

impl Stores {
    /// All four stores served by one in-memory backend.
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        // ---
        Stores {
            readings: store.clone(),
            rules: store.clone(),
            commands: store.clone(),
            alerts: store,
        }
    }

    /// All four stores served by one PostgreSQL pool.
    pub fn postgres(pool: PgPool) -> Self {
        // ---
        let store = Arc::new(PgStore::new(pool));
        Stores {
            readings: store.clone(),
            rules: store.clone(),
            commands: store.clone(),
            alerts: store,
        }
    }
}
