//! Machine snapshot: the latest known value of every monitored tag.
//!
//! The snapshot has a single writer (the field-bus session's change pump);
//! everyone else receives read-only clones, so a reader can never observe a
//! half-applied update.

use crate::tags::TagValue;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Connection health of both sides of the bridge.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionHealth {
    /// Field-bus session currently connected
    pub fieldbus_connected: bool,
    /// Message-bus link currently connected
    pub bus_connected: bool,
    /// Last successful poll or change notification from the field device
    pub last_field_update: Option<DateTime<Utc>>,
}

impl ConnectionHealth {
    /// Seconds elapsed since the last successful field update, if any.
    #[must_use]
    pub fn seconds_since_field_update(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_field_update
            .map(|t| (now - t).num_seconds().max(0))
    }
}

/// The latest consistent view of all monitored tag values.
#[derive(Debug, Clone, Default)]
pub struct MachineSnapshot {
    values: HashMap<String, TagValue>,
    /// Connection health block derived alongside the tag values
    pub health: ConnectionHealth,
    /// Timestamp of the most recent value update
    pub updated_at: Option<DateTime<Utc>>,
}

impl MachineSnapshot {
    /// Empty snapshot with no values and both links down.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new value for a tag. Called only by the snapshot owner.
    pub fn set(&mut self, name: impl Into<String>, value: TagValue, timestamp: DateTime<Utc>) {
        self.values.insert(name.into(), value);
        self.updated_at = Some(timestamp);
        self.health.last_field_update = Some(timestamp);
    }

    /// Current value of a tag, if known.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&TagValue> {
        self.values.get(name)
    }

    /// Boolean tag value, `false` when unknown or not a boolean.
    #[must_use]
    pub fn bool_tag(&self, name: &str) -> bool {
        self.bool_tag_or(name, false)
    }

    /// Boolean tag value with an explicit default for unknown tags.
    #[must_use]
    pub fn bool_tag_or(&self, name: &str, default: bool) -> bool {
        self.values
            .get(name)
            .and_then(TagValue::as_bool)
            .unwrap_or(default)
    }

    /// Numeric tag value, `0.0` when unknown or non-numeric.
    #[must_use]
    pub fn float_tag(&self, name: &str) -> f64 {
        self.values
            .get(name)
            .and_then(TagValue::as_f64)
            .unwrap_or(0.0)
    }

    /// Integer tag value, `0` when unknown or not an integer.
    #[must_use]
    pub fn int_tag(&self, name: &str) -> i64 {
        self.values
            .get(name)
            .and_then(TagValue::as_i64)
            .unwrap_or(0)
    }

    /// Number of tags with a known value.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no tag value is known yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
