//! Automation rule evaluation.
//!
//! For every reading in a batch the evaluator looks up the user's enabled
//! rules on that metric and fires those whose condition holds, subject to
//! two gates:
//! - **sustained duration**: every sample in the trailing `duration_minutes`
//!   window must satisfy the condition (an empty window fails)
//! - **cooldown**: the rule must not have fired within `cooldown_minutes`,
//!   enforced by an atomic claim in the rule store
//!
//! A rule fires at most once per batch. Errors are isolated per rule.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    commands::CommandManager,
    events::{AutomationTriggered, BusEvent, CommandSummary, EventBus},
    models::{
        AutomationRule, CommandSource, Condition, DeviceCommand, NewCommand, Reading, SensorType,
    },
    store::{ReadingStore, RuleStore, StoreError},
};

// ---

/// A rule that fired during an evaluation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggeredRule {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub metric: SensorType,
    pub value: f64,
    pub command_id: Uuid,
}

/// Outcome of one [`RuleEvaluator::evaluate`] call.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub triggered: Vec<TriggeredRule>,
    pub commands: Vec<DeviceCommand>,
}

/// Sustained-duration gate over an already fetched window.
///
/// `duration_minutes == 0` always passes. Otherwise the window must be
/// non-empty and every sample must satisfy `condition`.
pub fn sustained(condition: &Condition, duration_minutes: u32, window: &[Reading]) -> bool {
    // ---
    if duration_minutes == 0 {
        return true;
    }
    !window.is_empty() && window.iter().all(|r| condition.matches(r.value))
}

// ---

#[derive(Clone)]
pub struct RuleEvaluator {
    readings: Arc<dyn ReadingStore>,
    rules: Arc<dyn RuleStore>,
    commands: CommandManager,
    bus: EventBus,
}

impl RuleEvaluator {
    pub fn new(
        readings: Arc<dyn ReadingStore>,
        rules: Arc<dyn RuleStore>,
        commands: CommandManager,
        bus: EventBus,
    ) -> Self {
        Self {
            readings,
            rules,
            commands,
            bus,
        }
    }

    /// Evaluate a batch of readings from one device.
    ///
    /// Readings belonging to another user or device are ignored.
    pub async fn evaluate(
        &self,
        user_id: &str,
        device_id: &str,
        batch: &[Reading],
        now: DateTime<Utc>,
    ) -> Evaluation {
        // ---
        let mut outcome = Evaluation::default();
        let mut fired: HashSet<Uuid> = HashSet::new();
        let mut candidates: HashMap<SensorType, Vec<AutomationRule>> = HashMap::new();

        for reading in batch
            .iter()
            .filter(|r| r.user_id == user_id && r.device_id == device_id)
        {
            let metric = reading.sensor_type;
            if !candidates.contains_key(&metric) {
                match self.rules.candidate_rules(user_id, device_id, metric).await {
                    Ok(rules) => {
                        candidates.insert(metric, rules);
                    }
                    Err(e) => {
                        // Retried on the next reading of this metric
                        warn!(device_id, %metric, error = %e, "failed to load rules");
                        continue;
                    }
                }
            }
            let Some(rules) = candidates.get(&metric) else {
                continue;
            };

            for rule in rules {
                if fired.contains(&rule.id) || !rule.condition.matches(reading.value) {
                    continue;
                }
                match self.try_fire(rule, device_id, now).await {
                    Ok(Some(command)) => {
                        fired.insert(rule.id);
                        outcome.triggered.push(TriggeredRule {
                            rule_id: rule.id,
                            rule_name: rule.name.clone(),
                            metric,
                            value: reading.value,
                            command_id: command.id,
                        });
                        outcome.commands.push(command);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            rule_id = %rule.id,
                            device_id,
                            error = %e,
                            "rule evaluation failed; continuing with remaining rules"
                        );
                    }
                }
            }
        }
        outcome
    }

    /// Run the gates for one matching rule and issue its command.
    async fn try_fire(
        &self,
        rule: &AutomationRule,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DeviceCommand>, StoreError> {
        // ---
        if !rule.cooldown_elapsed(now) {
            debug!(rule_id = %rule.id, "rule cooling down");
            return Ok(None);
        }

        if rule.duration_minutes > 0 {
            let since = now - Duration::minutes(i64::from(rule.duration_minutes));
            let window = self
                .readings
                .readings_since(&rule.user_id, device_id, rule.metric, since)
                .await?;
            if !sustained(&rule.condition, rule.duration_minutes, &window) {
                debug!(rule_id = %rule.id, samples = window.len(), "condition not sustained");
                return Ok(None);
            }
        }

        if !self.rules.claim_trigger(rule.id, rule.cooldown(), now).await? {
            debug!(rule_id = %rule.id, "cooldown claimed by a concurrent evaluation");
            return Ok(None);
        }

        let command = self
            .commands
            .issue(
                NewCommand {
                    user_id: rule.user_id.clone(),
                    device_id: device_id.to_string(),
                    actuator: rule.action.actuator.clone(),
                    state: rule.action.state.clone(),
                    duration_seconds: rule.action.duration_seconds,
                    source: CommandSource::Automation,
                    rule_id: Some(rule.id),
                },
                now,
            )
            .await?;

        info!(rule_id = %rule.id, rule = %rule.name, device_id, "automation triggered");
        self.bus.publish(
            &rule.user_id,
            BusEvent::AutomationTriggered(AutomationTriggered {
                rule_id: rule.id,
                rule_name: rule.name.clone(),
                metric: rule.metric,
                condition_value: rule.condition,
                device_id: device_id.to_string(),
                command: CommandSummary::from(&command),
            }),
        );
        Ok(Some(command))
    }
}
