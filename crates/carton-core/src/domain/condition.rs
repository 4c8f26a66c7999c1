//! Condition vocabulary and the reconcile status state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::digest::Fingerprint;

/// Default depth of the condition transition history.
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Reconciling,
    ReconcileSucceeded,
    ReconcileFailed,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionType::Reconciling => "Reconciling",
            ConditionType::ReconcileSucceeded => "ReconcileSucceeded",
            ConditionType::ReconcileFailed => "ReconcileFailed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// A typed, timestamped status fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            condition_type,
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
        }
    }

    fn same_fact(&self, other: &Condition) -> bool {
        self.condition_type == other.condition_type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Coarse state of a reconciled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Reconciling,
    Succeeded,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Controller-owned status of an InstallRequest or App.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileStatus {
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Fingerprint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_fingerprint: Option<Fingerprint>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_version: Option<String>,
    #[serde(default)]
    pub friendly_description: String,
    #[serde(default)]
    pub useful_error_message: String,
    /// Oldest first; bounded.
    #[serde(default)]
    pub history: Vec<Condition>,
}

impl ReconcileStatus {
    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    pub fn is_true(&self, condition_type: ConditionType) -> bool {
        self.condition(condition_type)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    pub fn phase(&self) -> Phase {
        if self.is_true(ConditionType::Reconciling) {
            Phase::Reconciling
        } else if self.is_true(ConditionType::ReconcileFailed) {
            Phase::Failed
        } else if self.is_true(ConditionType::ReconcileSucceeded) {
            Phase::Succeeded
        } else {
            Phase::Idle
        }
    }

    /// Record the start of a pipeline run.
    ///
    /// The previous terminal condition stays in place until the run ends.
    pub fn begin(
        &mut self,
        now: DateTime<Utc>,
        generation: u64,
        fingerprint: Fingerprint,
        resolved_version: Option<String>,
        history_limit: usize,
    ) {
        self.observed_generation = generation;
        self.fingerprint = Some(fingerprint);
        if resolved_version.is_some() {
            self.resolved_version = resolved_version;
        }
        self.next_retry_at = None;
        self.friendly_description = "Reconciling".to_string();
        self.set(
            Condition::new(ConditionType::Reconciling, ConditionStatus::True, "", "", now),
            history_limit,
        );
    }

    /// Record a successful run: exactly one terminal condition, retries reset.
    pub fn succeed(&mut self, now: DateTime<Utc>, history_limit: usize) {
        self.clear(ConditionType::Reconciling);
        self.clear(ConditionType::ReconcileFailed);
        self.set(
            Condition::new(
                ConditionType::ReconcileSucceeded,
                ConditionStatus::True,
                "",
                "",
                now,
            ),
            history_limit,
        );
        self.retry_count = 0;
        self.next_retry_at = None;
        self.last_successful_fingerprint = self.fingerprint.clone();
        self.friendly_description = "Reconcile succeeded".to_string();
        self.useful_error_message.clear();
    }

    /// Record a failed run that will be retried at `next_retry_at`.
    pub fn fail(
        &mut self,
        now: DateTime<Utc>,
        reason: &str,
        message: &str,
        next_retry_at: Option<DateTime<Utc>>,
        history_limit: usize,
    ) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.next_retry_at = next_retry_at;
        self.mark_failed(now, reason, message, history_limit);
    }

    /// Record an error that no retry can fix. Written once, never re-armed.
    pub fn fail_permanently(
        &mut self,
        now: DateTime<Utc>,
        generation: u64,
        reason: &str,
        message: &str,
        history_limit: usize,
    ) {
        self.observed_generation = generation;
        self.next_retry_at = None;
        self.mark_failed(now, reason, message, history_limit);
    }

    /// Whether the failure condition already states exactly this error.
    pub fn already_reports(&self, reason: &str, message: &str) -> bool {
        self.condition(ConditionType::ReconcileFailed)
            .is_some_and(|c| c.status == ConditionStatus::True && c.reason == reason && c.message == message)
    }

    pub fn mark_paused(&mut self, generation: u64) {
        self.observed_generation = generation;
        self.next_retry_at = None;
        self.friendly_description = "Paused".to_string();
    }

    pub fn reset_retries(&mut self) {
        self.retry_count = 0;
        self.next_retry_at = None;
    }

    fn mark_failed(&mut self, now: DateTime<Utc>, reason: &str, message: &str, history_limit: usize) {
        self.clear(ConditionType::Reconciling);
        self.clear(ConditionType::ReconcileSucceeded);
        self.set(
            Condition::new(
                ConditionType::ReconcileFailed,
                ConditionStatus::True,
                reason,
                message,
                now,
            ),
            history_limit,
        );
        self.friendly_description = format!("Reconcile failed: {reason}");
        self.useful_error_message = message.to_string();
    }

    fn clear(&mut self, condition_type: ConditionType) {
        self.conditions.retain(|c| c.condition_type != condition_type);
    }

    /// Upsert a condition; a changed fact keeps its new transition time and
    /// is appended to the history. A repeated failure with the same text
    /// still refreshes its transition time so retries leave a trace.
    fn set(&mut self, condition: Condition, history_limit: usize) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) => *existing = condition.clone(),
            None => self.conditions.push(condition.clone()),
        }

        let repeated = self
            .history
            .last()
            .is_some_and(|last| last.same_fact(&condition));
        if repeated {
            if let Some(last) = self.history.last_mut() {
                last.last_transition_time = condition.last_transition_time;
            }
        } else {
            self.history.push(condition);
        }
        if self.history.len() > history_limit {
            let excess = self.history.len() - history_limit;
            self.history.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LIMIT: usize = DEFAULT_HISTORY_LIMIT;

    fn fp(tag: &str) -> Fingerprint {
        Fingerprint::of(&json!({ "tag": tag })).unwrap()
    }

    #[test]
    fn test_begin_keeps_previous_terminal_condition() {
        let mut status = ReconcileStatus::default();
        status.begin(Utc::now(), 1, fp("a"), None, LIMIT);
        status.succeed(Utc::now(), LIMIT);
        status.begin(Utc::now(), 2, fp("b"), None, LIMIT);

        assert_eq!(status.phase(), Phase::Reconciling);
        assert!(status.is_true(ConditionType::ReconcileSucceeded));
        assert_eq!(status.observed_generation, 2);
    }

    #[test]
    fn test_exactly_one_terminal_condition() {
        let mut status = ReconcileStatus::default();
        status.begin(Utc::now(), 1, fp("a"), None, LIMIT);
        status.fail(Utc::now(), "StageFailure", "fetch stage 0 failed", None, LIMIT);
        assert!(status.is_true(ConditionType::ReconcileFailed));
        assert!(status.condition(ConditionType::ReconcileSucceeded).is_none());
        assert!(status.condition(ConditionType::Reconciling).is_none());

        status.begin(Utc::now(), 1, fp("a"), None, LIMIT);
        status.succeed(Utc::now(), LIMIT);
        assert!(status.is_true(ConditionType::ReconcileSucceeded));
        assert!(status.condition(ConditionType::ReconcileFailed).is_none());
        assert_eq!(status.retry_count, 0);
        assert_eq!(status.last_successful_fingerprint, Some(fp("a")));
    }

    #[test]
    fn test_history_keeps_failure_before_success() {
        let mut status = ReconcileStatus::default();
        status.begin(Utc::now(), 1, fp("a"), None, LIMIT);
        status.fail(Utc::now(), "StageFailure", "boom", None, LIMIT);
        status.begin(Utc::now(), 1, fp("a"), None, LIMIT);
        status.succeed(Utc::now(), LIMIT);

        let kinds: Vec<ConditionType> = status.history.iter().map(|c| c.condition_type).collect();
        assert_eq!(
            kinds,
            vec![
                ConditionType::Reconciling,
                ConditionType::ReconcileFailed,
                ConditionType::Reconciling,
                ConditionType::ReconcileSucceeded,
            ]
        );
        assert_eq!(status.friendly_description, "Reconcile succeeded");
        assert!(status.useful_error_message.is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut status = ReconcileStatus::default();
        for i in 0..10 {
            status.fail(Utc::now(), "StageFailure", &format!("attempt {i}"), None, 4);
        }
        assert_eq!(status.history.len(), 4);
        assert_eq!(status.history[3].message, "attempt 9");
        assert_eq!(status.retry_count, 10);
    }

    #[test]
    fn test_permanent_failure_does_not_count_retries() {
        let mut status = ReconcileStatus::default();
        status.fail_permanently(Utc::now(), 3, "NoMatchingVersion", "none", LIMIT);
        assert_eq!(status.retry_count, 0);
        assert!(status.next_retry_at.is_none());
        assert!(status.already_reports("NoMatchingVersion", "none"));
        assert_eq!(status.friendly_description, "Reconcile failed: NoMatchingVersion");
        assert_eq!(status.phase(), Phase::Failed);
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let mut status = ReconcileStatus::default();
        status.begin(Utc::now(), 1, fp("a"), Some("1.2.0".into()), LIMIT);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["observedGeneration"], 1);
        assert_eq!(json["resolvedVersion"], "1.2.0");
        assert_eq!(json["conditions"][0]["type"], "Reconciling");
        assert_eq!(json["conditions"][0]["status"], "True");
    }
}
