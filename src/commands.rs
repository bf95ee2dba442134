//! Command lifecycle: issue, poll-delivery, acknowledgment, cancel, expiry.
//!
//! ```text
//! pending ──poll──▶ delivered ──ack──▶ executed | failed
//!    │                  │
//!    ├──cancel──▶ cancelled
//!    └──────sweep───────┴──────▶ expired
//! ```
//!
//! Expiry is lazy: overdue commands are swept at the start of every poll.

use std::{str::FromStr, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    events::{BusEvent, CommandUpdate, EventBus},
    models::{CommandStatus, DeviceCommand, NewCommand},
    store::{CommandStore, StoreError},
};

pub const DEFAULT_POLL_LIMIT: usize = 10;
pub const MAX_POLL_LIMIT: usize = 50;

// ---

/// Why a device-initiated transition was refused.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command {0} not found")]
    NotFound(Uuid),

    #[error("invalid acknowledgment status '{0}', expected executed or failed")]
    InvalidStatus(String),

    #[error("command {id} is already {status}")]
    AlreadyTerminal { id: Uuid, status: CommandStatus },

    #[error("command {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: CommandStatus,
        to: CommandStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Terminal outcome a device may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Executed,
    Failed,
}

impl From<AckStatus> for CommandStatus {
    fn from(status: AckStatus) -> Self {
        match status {
            AckStatus::Executed => CommandStatus::Executed,
            AckStatus::Failed => CommandStatus::Failed,
        }
    }
}

impl FromStr for AckStatus {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "executed" => Ok(AckStatus::Executed),
            "failed" => Ok(AckStatus::Failed),
            other => Err(CommandError::InvalidStatus(other.to_string())),
        }
    }
}

/// Clamp a requested poll size into `1..=50`, defaulting to 10.
pub fn clamp_poll_limit(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(DEFAULT_POLL_LIMIT)
        .clamp(1, MAX_POLL_LIMIT)
}

// ---

#[derive(Clone)]
pub struct CommandManager {
    store: Arc<dyn CommandStore>,
    bus: EventBus,
    ttl: Duration,
}

impl CommandManager {
    /// `ttl` is how long a command stays deliverable after it is issued.
    pub fn new(store: Arc<dyn CommandStore>, bus: EventBus, ttl: Duration) -> Self {
        Self { store, bus, ttl }
    }

    /// Persist a new pending command.
    pub async fn issue(
        &self,
        new: NewCommand,
        now: DateTime<Utc>,
    ) -> Result<DeviceCommand, StoreError> {
        // ---
        let command = DeviceCommand::pending(new, now, self.ttl);
        self.store.insert(&command).await?;
        info!(
            command_id = %command.id,
            device_id = %command.device_id,
            actuator = %command.actuator,
            state = %command.state,
            source = command.source.as_str(),
            "command issued"
        );
        Ok(command)
    }

    /// Expire every overdue non-terminal command, whichever device owns it.
    pub async fn sweep_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeviceCommand>, StoreError> {
        // ---
        let expired = self.store.expire_overdue(now).await?;
        for command in &expired {
            debug!(command_id = %command.id, device_id = %command.device_id, "command expired");
            self.publish_update(command);
        }
        Ok(expired)
    }

    /// Device pull: sweep expiry, then claim up to `limit` pending commands.
    ///
    /// A failed sweep is logged and the claim still runs; overdue commands
    /// are never claimed because the claim itself checks `expires_at`.
    pub async fn poll(
        &self,
        user_id: &str,
        device_id: &str,
        limit: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<Vec<DeviceCommand>, StoreError> {
        // ---
        if let Err(e) = self.sweep_expired(now).await {
            warn!(error = %e, "expiry sweep failed; retrying on next poll");
        }

        let limit = clamp_poll_limit(limit);
        let delivered = self
            .store
            .claim_pending(user_id, device_id, limit, now)
            .await?;

        if !delivered.is_empty() {
            info!(device_id, count = delivered.len(), "commands delivered");
        }
        Ok(delivered)
    }

    /// Device report of a delivered command's outcome.
    pub async fn acknowledge(
        &self,
        user_id: &str,
        id: Uuid,
        status: AckStatus,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DeviceCommand, CommandError> {
        // ---
        self.finish(user_id, id, CommandStatus::Delivered, status.into(), message, now)
            .await
    }

    /// Withdraw a command that has not been delivered yet.
    pub async fn cancel(
        &self,
        user_id: &str,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<DeviceCommand, CommandError> {
        // ---
        self.finish(
            user_id,
            id,
            CommandStatus::Pending,
            CommandStatus::Cancelled,
            Some("cancelled before delivery"),
            now,
        )
        .await
    }

    async fn finish(
        &self,
        user_id: &str,
        id: Uuid,
        from: CommandStatus,
        to: CommandStatus,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DeviceCommand, CommandError> {
        // ---
        let current = self.owned(user_id, id).await?;
        check_transition(&current, from, to)?;

        match self.store.transition(id, from, to, message, now).await? {
            Some(updated) => {
                info!(command_id = %id, status = %updated.status, "command updated");
                self.publish_update(&updated);
                Ok(updated)
            }
            None => {
                // Lost a race with another writer (sweep, duplicate ack)
                let latest = self.owned(user_id, id).await?;
                check_transition(&latest, from, to)?;
                Err(CommandError::InvalidTransition {
                    id,
                    from: latest.status,
                    to,
                })
            }
        }
    }

    async fn owned(&self, user_id: &str, id: Uuid) -> Result<DeviceCommand, CommandError> {
        match self.store.get(id).await? {
            Some(command) if command.user_id == user_id => Ok(command),
            // Another user's command is indistinguishable from a missing one
            _ => Err(CommandError::NotFound(id)),
        }
    }

    fn publish_update(&self, command: &DeviceCommand) {
        self.bus.publish(
            &command.user_id,
            BusEvent::DeviceCommandUpdate(CommandUpdate::from(command)),
        );
    }
}

fn check_transition(
    command: &DeviceCommand,
    from: CommandStatus,
    to: CommandStatus,
) -> Result<(), CommandError> {
    // ---
    if command.status.is_terminal() {
        return Err(CommandError::AlreadyTerminal {
            id: command.id,
            status: command.status,
        });
    }
    if command.status != from {
        return Err(CommandError::InvalidTransition {
            id: command.id,
            from: command.status,
            to,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{models::CommandSource, store::MemoryStore};
    use chrono::TimeZone;
    use tokio_test::assert_ok;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()
    }

    fn manager(store: &Arc<MemoryStore>) -> CommandManager {
        CommandManager::new(store.clone(), EventBus::new(32), Duration::minutes(10))
    }

    fn new_command(device: &str) -> NewCommand {
        // ---
        NewCommand {
            user_id: "user-1".to_string(),
            device_id: device.to_string(),
            actuator: "irrigation_valve".to_string(),
            state: "open".to_string(),
            duration_seconds: Some(120),
            source: CommandSource::Manual,
            rule_id: None,
        }
    }

    #[test]
    fn test_poll_limit_clamp() {
        // ---
        assert_eq!(clamp_poll_limit(None), 10);
        assert_eq!(clamp_poll_limit(Some(0)), 1);
        assert_eq!(clamp_poll_limit(Some(25)), 25);
        assert_eq!(clamp_poll_limit(Some(500)), 50);
    }

    #[test]
    fn test_ack_status_parse() {
        // ---
        assert_eq!("executed".parse::<AckStatus>().unwrap(), AckStatus::Executed);
        assert_eq!("failed".parse::<AckStatus>().unwrap(), AckStatus::Failed);
        assert!(matches!(
            "expired".parse::<AckStatus>(),
            Err(CommandError::InvalidStatus(s)) if s == "expired"
        ));
    }

    #[tokio::test]
    async fn test_poll_delivers_exactly_once() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&store);
        let command = assert_ok!(manager.issue(new_command("tent-a"), t0()).await);
        assert_eq!(command.status, CommandStatus::Pending);
        assert_eq!(command.expires_at, t0() + Duration::minutes(10));

        let now = t0() + Duration::minutes(1);
        let first = assert_ok!(manager.poll("user-1", "tent-a", None, now).await);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, command.id);
        assert_eq!(first[0].status, CommandStatus::Delivered);
        assert_eq!(first[0].delivered_at, Some(now));

        let second = assert_ok!(manager.poll("user-1", "tent-a", None, now).await);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_polls_never_share_commands() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&store);
        for _ in 0..6 {
            assert_ok!(manager.issue(new_command("tent-a"), t0()).await);
        }

        let now = t0() + Duration::seconds(30);
        let (a, b) = tokio::join!(
            manager.poll("user-1", "tent-a", Some(4), now),
            manager.poll("user-1", "tent-a", Some(4), now),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.len() + b.len(), 6);
        assert!(a.iter().all(|x| b.iter().all(|y| x.id != y.id)));
    }

    #[tokio::test]
    async fn test_expiry_sweep_runs_on_any_device_poll() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&store);
        let first = assert_ok!(manager.issue(new_command("tent-a"), t0()).await);
        let second = assert_ok!(manager.issue(new_command("tent-a"), t0()).await);

        // One of them is delivered, the other stays pending
        let delivered = assert_ok!(manager.poll("user-1", "tent-a", Some(1), t0()).await);
        assert_eq!(delivered.len(), 1);

        // A different device polls after both have passed expires_at
        let late = t0() + Duration::minutes(11);
        assert_ok!(manager.poll("user-1", "tent-b", None, late).await);

        for id in [first.id, second.id] {
            let command = store.commands().into_iter().find(|c| c.id == id).unwrap();
            assert_eq!(command.status, CommandStatus::Expired);
            assert_eq!(command.completed_at, Some(late));
        }
    }

    #[tokio::test]
    async fn test_acknowledge_lifecycle() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new(32);
        let mut rx = bus.subscribe();
        let manager = CommandManager::new(store.clone(), bus, Duration::minutes(10));

        let command = assert_ok!(manager.issue(new_command("tent-a"), t0()).await);

        // Not delivered yet
        let early = manager
            .acknowledge("user-1", command.id, AckStatus::Executed, None, t0())
            .await;
        assert!(matches!(early, Err(CommandError::InvalidTransition { .. })));

        assert_ok!(manager.poll("user-1", "tent-a", None, t0()).await);

        // Wrong owner looks like a missing command
        let foreign = manager
            .acknowledge("user-2", command.id, AckStatus::Executed, None, t0())
            .await;
        assert!(matches!(foreign, Err(CommandError::NotFound(_))));

        let done = manager
            .acknowledge("user-1", command.id, AckStatus::Failed, Some("valve stuck"), t0())
            .await
            .unwrap();
        assert_eq!(done.status, CommandStatus::Failed);
        assert_eq!(done.result_message.as_deref(), Some("valve stuck"));
        assert_eq!(done.completed_at, Some(t0()));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event.name(), "deviceCommandUpdate");

        let again = manager
            .acknowledge("user-1", command.id, AckStatus::Executed, None, t0())
            .await;
        assert!(matches!(
            again,
            Err(CommandError::AlreadyTerminal { status: CommandStatus::Failed, .. })
        ));

        let unknown = manager
            .acknowledge("user-1", Uuid::new_v4(), AckStatus::Executed, None, t0())
            .await;
        assert!(matches!(unknown, Err(CommandError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_only_from_pending() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&store);
        let queued = assert_ok!(manager.issue(new_command("tent-a"), t0()).await);

        let cancelled = assert_ok!(manager.cancel("user-1", queued.id, t0()).await);
        assert_eq!(cancelled.status, CommandStatus::Cancelled);

        // Cancelled commands are never delivered
        let polled = assert_ok!(manager.poll("user-1", "tent-a", None, t0()).await);
        assert!(polled.is_empty());

        let delivered = assert_ok!(manager.issue(new_command("tent-a"), t0()).await);
        assert_ok!(manager.poll("user-1", "tent-a", None, t0()).await);
        let refused = manager.cancel("user-1", delivered.id, t0()).await;
        assert!(matches!(refused, Err(CommandError::InvalidTransition { .. })));
    }

    /// Command store whose expiry sweep always fails.
    struct BrokenSweep {
        inner: Arc<MemoryStore>,
    }

    #[async_trait::async_trait]
    impl CommandStore for BrokenSweep {
        async fn insert(&self, command: &DeviceCommand) -> Result<(), StoreError> {
            self.inner.insert(command).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<DeviceCommand>, StoreError> {
            self.inner.get(id).await
        }

        async fn expire_overdue(
            &self,
            _now: DateTime<Utc>,
        ) -> Result<Vec<DeviceCommand>, StoreError> {
            Err(StoreError::corrupt("command", "simulated outage"))
        }

        async fn claim_pending(
            &self,
            user_id: &str,
            device_id: &str,
            limit: usize,
            now: DateTime<Utc>,
        ) -> Result<Vec<DeviceCommand>, StoreError> {
            self.inner.claim_pending(user_id, device_id, limit, now).await
        }

        async fn transition(
            &self,
            id: Uuid,
            from: CommandStatus,
            to: CommandStatus,
            message: Option<&str>,
            now: DateTime<Utc>,
        ) -> Result<Option<DeviceCommand>, StoreError> {
            self.inner.transition(id, from, to, message, now).await
        }
    }

    #[tokio::test]
    async fn test_failed_sweep_does_not_block_polling() {
        // ---
        let store = Arc::new(MemoryStore::new());
        let broken = Arc::new(BrokenSweep {
            inner: store.clone(),
        });
        let manager = CommandManager::new(broken, EventBus::new(32), Duration::minutes(10));

        let stale = assert_ok!(manager.issue(new_command("tent-a"), t0()).await);
        let fresh = assert_ok!(
            manager
                .issue(new_command("tent-a"), t0() + Duration::minutes(5))
                .await
        );

        // The stale command is overdue but the sweep cannot expire it
        let late = t0() + Duration::minutes(11);
        let delivered = assert_ok!(manager.poll("user-1", "tent-a", None, late).await);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].id, fresh.id);
        assert!(delivered.iter().all(|c| c.id != stale.id));

        let stale = store.commands().into_iter().find(|c| c.id == stale.id).unwrap();
        assert_eq!(stale.status, CommandStatus::Pending);
    }
}
