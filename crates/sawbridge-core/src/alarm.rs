//! Active alarm registry.
//!
//! An alarm is raised the first time the field device reports a condition
//! and removed only when the condition clears. Acknowledgment flips a flag
//! on the entry; it never removes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Severity of an alarm condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmSeverity {
    /// Informational
    Info,
    /// Degraded but operable
    Warning,
    /// Operation-affecting fault
    Error,
    /// Safety-relevant fault
    Critical,
}

/// A persistent alarm condition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alarm {
    /// Unique condition key
    pub code: String,
    /// Human-readable description
    pub message: String,
    /// Condition severity
    pub severity: AlarmSeverity,
    /// When the condition was first observed active
    pub raised_at: DateTime<Utc>,
    /// Whether an operator has acknowledged the condition
    pub acknowledged: bool,
}

/// Registry of currently-active alarms, keyed by code.
///
/// Exclusively owned by the command executor; other components only see
/// snapshots produced by [`AlarmRegistry::active`].
#[derive(Debug, Default)]
pub struct AlarmRegistry {
    active: HashMap<String, Alarm>,
}

impl AlarmRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise an alarm if it is not already active.
    ///
    /// Returns `true` if the alarm was newly raised; re-reports of an
    /// already-active condition are ignored (the original raise time and
    /// acknowledgment state are kept).
    pub fn raise(
        &mut self,
        code: impl Into<String>,
        message: impl Into<String>,
        severity: AlarmSeverity,
        now: DateTime<Utc>,
    ) -> bool {
        let code = code.into();
        if self.active.contains_key(&code) {
            return false;
        }

        tracing::warn!(code = %code, ?severity, "Alarm raised");
        self.active.insert(
            code.clone(),
            Alarm {
                code,
                message: message.into(),
                severity,
                raised_at: now,
                acknowledged: false,
            },
        );
        true
    }

    /// Remove an alarm because its underlying condition cleared.
    ///
    /// Returns `true` if the alarm was present.
    pub fn clear(&mut self, code: &str) -> bool {
        let removed = self.active.remove(code).is_some();
        if removed {
            tracing::info!(code, "Alarm cleared");
        }
        removed
    }

    /// Acknowledge an active alarm.
    ///
    /// Returns `false` if no alarm with the given code is active. The alarm
    /// stays in the registry until its condition clears.
    pub fn acknowledge(&mut self, code: &str) -> bool {
        match self.active.get_mut(code) {
            Some(alarm) => {
                alarm.acknowledged = true;
                tracing::info!(code, "Alarm acknowledged");
                true
            }
            None => false,
        }
    }

    /// Whether any alarm is active, acknowledged or not.
    #[must_use]
    pub fn has_active(&self) -> bool {
        !self.active.is_empty()
    }

    /// Whether a specific alarm code is active.
    #[must_use]
    pub fn is_active(&self, code: &str) -> bool {
        self.active.contains_key(code)
    }

    /// Snapshot of all active alarms, oldest first.
    #[must_use]
    pub fn active(&self) -> Vec<Alarm> {
        let mut alarms: Vec<Alarm> = self.active.values().cloned().collect();
        alarms.sort_by(|a, b| a.raised_at.cmp(&b.raised_at).then(a.code.cmp(&b.code)));
        alarms
    }

    /// Number of active alarms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no alarm is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
