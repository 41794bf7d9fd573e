//! MQTT topic scheme for the bridge.
//!
//! Topic structure: `sawbridge/v1/{machine}/{channel}`
//!
//! This allows:
//! - Per-machine isolation (one bridge per physical machine)
//! - Channel-based filtering (`status`, `alarm`, `control`, ...)
//! - Per-tag mirror topics under `tag/{name}`

use serde::{Deserialize, Serialize};

/// Protocol version for the topic scheme.
pub const PROTOCOL_VERSION: &str = "v1";

/// Topic scheme configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Machine identifier
    pub machine: String,
    /// Topic prefix (default: "sawbridge")
    pub prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            machine: "sawmill".to_string(),
            prefix: "sawbridge".to_string(),
        }
    }
}

impl TopicScheme {
    /// Create a scheme for the given machine.
    #[must_use]
    pub fn new(machine: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
            prefix: "sawbridge".to_string(),
        }
    }

    fn base(&self) -> String {
        format!("{}/{}/{}", self.prefix, PROTOCOL_VERSION, self.machine)
    }

    /// Topic for periodic status messages (also carries the last will).
    #[must_use]
    pub fn status(&self) -> String {
        format!("{}/status", self.base())
    }

    /// Topic for the active-alarm array.
    #[must_use]
    pub fn alarm(&self) -> String {
        format!("{}/alarm", self.base())
    }

    /// Topic for inbound machine commands.
    #[must_use]
    pub fn control(&self) -> String {
        format!("{}/control", self.base())
    }

    /// Topic for configuration-change acknowledgments.
    #[must_use]
    pub fn config(&self) -> String {
        format!("{}/config", self.base())
    }

    /// Topic for command results.
    #[must_use]
    pub fn result(&self) -> String {
        format!("{}/result", self.base())
    }

    /// Per-tag mirror topic for a published tag.
    #[must_use]
    pub fn tag(&self, name: &str) -> String {
        format!("{}/tag/{name}", self.base())
    }

    /// Wildcard subscription covering every channel of this machine.
    #[must_use]
    pub fn machine_wildcard(&self) -> String {
        format!("{}/#", self.base())
    }

    /// Parse a topic back into its channel.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<TopicKind> {
        let expected_prefix = format!("{}/", self.base());
        let remainder = topic.strip_prefix(&expected_prefix)?;

        match remainder {
            "status" => Some(TopicKind::Status),
            "alarm" => Some(TopicKind::Alarm),
            "control" => Some(TopicKind::Control),
            "config" => Some(TopicKind::Config),
            "result" => Some(TopicKind::Result),
            other => {
                let name = other.strip_prefix("tag/")?;
                if name.is_empty() || name.contains('/') {
                    None
                } else {
                    Some(TopicKind::Tag(name.to_string()))
                }
            }
        }
    }
}

/// Channels in the topic scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicKind {
    /// Periodic machine status
    Status,
    /// Active-alarm array
    Alarm,
    /// Inbound commands
    Control,
    /// Configuration-change acknowledgments
    Config,
    /// Command results
    Result,
    /// Per-tag mirror, carrying the tag name
    Tag(String),
}
