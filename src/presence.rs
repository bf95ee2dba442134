//! Device presence: when each (user, device) pair was last heard from.
//!
//! Ingestion and polling call [`Presence::touch`]; the forecast scheduler
//! asks [`Presence::active_since`] which devices are worth forecasting and
//! drops entries older than its lookback with [`Presence::prune_before`], so
//! a device silent for longer than that reports no last-seen time.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use chrono::{DateTime, Utc};

// ---

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    pub user_id: String,
    pub device_id: String,
}

impl DeviceKey {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}

/// Shared last-seen table. Cloning shares the table.
#[derive(Clone, Default)]
pub struct Presence {
    seen: Arc<RwLock<HashMap<DeviceKey, DateTime<Utc>>>>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity at `at`. Older timestamps never move last-seen back.
    pub fn touch(&self, user_id: &str, device_id: &str, at: DateTime<Utc>) {
        // ---
        let mut seen = self.seen.write().unwrap_or_else(PoisonError::into_inner);
        seen.entry(DeviceKey::new(user_id, device_id))
            .and_modify(|last| *last = (*last).max(at))
            .or_insert(at);
    }

    pub fn last_seen(&self, user_id: &str, device_id: &str) -> Option<DateTime<Utc>> {
        let seen = self.seen.read().unwrap_or_else(PoisonError::into_inner);
        seen.get(&DeviceKey::new(user_id, device_id)).copied()
    }

    /// Devices seen at or after `cutoff`, sorted for stable iteration.
    pub fn active_since(&self, cutoff: DateTime<Utc>) -> Vec<DeviceKey> {
        // ---
        let seen = self.seen.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<DeviceKey> = seen
            .iter()
            .filter(|(_, last)| **last >= cutoff)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Forget devices last seen before `cutoff`. Returns how many were dropped.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        // ---
        let mut seen = self.seen.write().unwrap_or_else(PoisonError::into_inner);
        let before = seen.len();
        seen.retain(|_, last| *last >= cutoff);
        before - seen.len()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_touch_keeps_latest() {
        // ---
        let presence = Presence::new();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();

        assert_eq!(presence.last_seen("user-1", "tent-a"), None);
        presence.touch("user-1", "tent-a", t0);
        presence.touch("user-1", "tent-a", t0 - Duration::minutes(5));
        assert_eq!(presence.last_seen("user-1", "tent-a"), Some(t0));

        presence.touch("user-1", "tent-a", t0 + Duration::minutes(1));
        assert_eq!(
            presence.last_seen("user-1", "tent-a"),
            Some(t0 + Duration::minutes(1))
        );
    }

    #[test]
    fn test_active_since_filters_stale_devices() {
        // ---
        let presence = Presence::new();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        presence.touch("user-1", "tent-a", t0);
        presence.touch("user-1", "tent-b", t0 - Duration::hours(6));
        presence.touch("user-2", "tent-a", t0 - Duration::minutes(10));

        let active = presence.active_since(t0 - Duration::hours(1));
        assert_eq!(
            active,
            vec![
                DeviceKey::new("user-1", "tent-a"),
                DeviceKey::new("user-2", "tent-a"),
            ]
        );
    }

    #[test]
    fn test_prune_drops_only_stale_devices() {
        // ---
        let presence = Presence::new();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        let cutoff = t0 - Duration::hours(3);
        presence.touch("user-1", "tent-a", t0);
        presence.touch("user-1", "tent-b", cutoff - Duration::seconds(1));
        presence.touch("user-2", "tent-a", cutoff);

        assert_eq!(presence.prune_before(cutoff), 1);
        assert_eq!(presence.last_seen("user-1", "tent-b"), None);
        assert_eq!(presence.last_seen("user-2", "tent-a"), Some(cutoff));
        assert_eq!(presence.active_since(cutoff).len(), 2);

        assert_eq!(presence.prune_before(cutoff), 0);
    }
}
