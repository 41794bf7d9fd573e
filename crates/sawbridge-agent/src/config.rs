//! Bridge configuration.

use anyhow::{Context, Result};
use sawbridge_core::{Tag, TagDataType};
use std::time::Duration;

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Machine identifier, used in topic paths and the client id
    pub machine_id: String,

    /// Field-bus configuration
    pub fieldbus: FieldbusConfig,

    /// Message-bus configuration
    pub bus: BusConfig,

    /// Reconnection and buffering configuration
    pub reconnect: ReconnectConfig,

    /// Telemetry window length
    pub telemetry_window: Duration,

    /// Upper bound accepted by the speed setpoint command
    pub max_cutting_speed: f64,

    /// Tag table for the machine
    pub tags: Vec<Tag>,
}

/// Field-bus configuration.
#[derive(Debug, Clone)]
pub struct FieldbusConfig {
    /// Device endpoint URL (`sim://` selects the in-memory simulator)
    pub endpoint: String,

    /// Sampling interval requested for change subscriptions
    pub sampling_interval: Duration,

    /// Deadline for every on-demand protocol operation
    pub op_timeout: Duration,

    /// Interval between subscription health checks
    pub health_check_interval: Duration,

    /// Tags that must exist on the device for connect to succeed
    pub critical_tags: Vec<String>,
}

/// Message-bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// MQTT broker URL
    pub broker: String,

    /// MQTT keep-alive interval
    pub keep_alive: Duration,

    /// Deadline for a single publish hand-off
    pub publish_timeout: Duration,
}

/// Reconnection and buffering configuration.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Attempts per explicit connect call
    pub max_retries: u32,

    /// Delay before the second attempt
    pub initial_backoff: Duration,

    /// Upper bound on the doubling backoff
    pub max_backoff: Duration,

    /// Outbound buffer capacity while disconnected
    pub buffer_size: usize,

    /// Buffered messages older than this are dropped at replay
    pub staleness: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            machine_id: "sawmill".to_string(),
            fieldbus: FieldbusConfig {
                endpoint: "opc.tcp://localhost:4840".to_string(),
                sampling_interval: Duration::from_millis(500),
                op_timeout: Duration::from_secs(5),
                health_check_interval: Duration::from_secs(30 * 60),
                critical_tags: vec![
                    "is_active".to_string(),
                    "cutting_speed".to_string(),
                    "power_consumption".to_string(),
                    "pieces_count".to_string(),
                ],
            },
            bus: BusConfig {
                broker: "tcp://localhost:1883".to_string(),
                keep_alive: Duration::from_secs(30),
                publish_timeout: Duration::from_secs(5),
            },
            reconnect: ReconnectConfig {
                max_retries: 5,
                initial_backoff: Duration::from_secs(5),
                max_backoff: Duration::from_secs(60),
                buffer_size: 1000,
                staleness: Duration::from_secs(300),
            },
            telemetry_window: Duration::from_secs(3600),
            max_cutting_speed: 10.0,
            tags: default_tags(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SAWBRIDGE_MACHINE_ID`: Machine identifier
    /// - `SAWBRIDGE_FIELDBUS_ENDPOINT`: Field device endpoint URL
    /// - `SAWBRIDGE_MQTT_BROKER`: MQTT broker URL
    /// - `SAWBRIDGE_SAMPLING_INTERVAL_MS`: Subscription sampling interval
    /// - `SAWBRIDGE_TELEMETRY_WINDOW_SECS`: Sliding-window length
    /// - `SAWBRIDGE_MAX_CUTTING_SPEED`: Speed setpoint upper bound
    /// - `SAWBRIDGE_MAX_RETRIES`: Connection attempts per connect call
    /// - `SAWBRIDGE_TAGS`: Tag table as a JSON array
    ///
    /// # Errors
    ///
    /// Returns error if a set variable fails to parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(machine_id) = std::env::var("SAWBRIDGE_MACHINE_ID") {
            config.machine_id = machine_id;
        }

        if let Ok(endpoint) = std::env::var("SAWBRIDGE_FIELDBUS_ENDPOINT") {
            config.fieldbus.endpoint = endpoint;
        }

        if let Ok(broker) = std::env::var("SAWBRIDGE_MQTT_BROKER") {
            config.bus.broker = broker;
        }

        if let Ok(interval) = std::env::var("SAWBRIDGE_SAMPLING_INTERVAL_MS") {
            let millis: u64 = interval
                .parse()
                .context("Invalid SAWBRIDGE_SAMPLING_INTERVAL_MS")?;
            config.fieldbus.sampling_interval = Duration::from_millis(millis);
        }

        if let Ok(window) = std::env::var("SAWBRIDGE_TELEMETRY_WINDOW_SECS") {
            let secs: u64 = window
                .parse()
                .context("Invalid SAWBRIDGE_TELEMETRY_WINDOW_SECS")?;
            config.telemetry_window = Duration::from_secs(secs);
        }

        if let Ok(speed) = std::env::var("SAWBRIDGE_MAX_CUTTING_SPEED") {
            config.max_cutting_speed = speed
                .parse()
                .context("Invalid SAWBRIDGE_MAX_CUTTING_SPEED")?;
        }

        if let Ok(retries) = std::env::var("SAWBRIDGE_MAX_RETRIES") {
            config.reconnect.max_retries =
                retries.parse().context("Invalid SAWBRIDGE_MAX_RETRIES")?;
        }

        // Parse the tag table from a JSON env var.
        if let Ok(tags_json) = std::env::var("SAWBRIDGE_TAGS") {
            config.tags =
                serde_json::from_str(&tags_json).context("Invalid SAWBRIDGE_TAGS JSON")?;
        }

        Ok(config)
    }
}

/// Built-in tag table for the standard sawmill address space.
#[must_use]
pub fn default_tags() -> Vec<Tag> {
    fn monitored(name: &str, node: &str, data_type: TagDataType) -> Tag {
        Tag {
            name: name.to_string(),
            address: format!("ns=2;s=SawMill/{node}"),
            data_type,
            monitored: true,
            published: false,
            unit: None,
        }
    }

    let mut tags = vec![
        monitored("is_active", "IsActive", TagDataType::Boolean),
        monitored("is_working", "IsWorking", TagDataType::Boolean),
        monitored("is_stopped", "IsStopped", TagDataType::Boolean),
        monitored("has_alarm", "HasAlarm", TagDataType::Boolean),
        monitored("has_error", "HasError", TagDataType::Boolean),
        monitored("cutting_speed", "CuttingSpeed", TagDataType::Float),
        monitored("power_consumption", "PowerConsumption", TagDataType::Float),
        monitored("pieces_count", "PiecesCount", TagDataType::Integer),
    ];

    for tag in &mut tags {
        match tag.name.as_str() {
            "cutting_speed" => {
                tag.published = true;
                tag.unit = Some("m/min".to_string());
            }
            "power_consumption" => {
                tag.published = true;
                tag.unit = Some("kW".to_string());
            }
            "pieces_count" => tag.published = true,
            _ => {}
        }
    }

    // Write-only control point; not part of the change subscription.
    tags.push(Tag {
        name: "machine_state".to_string(),
        address: "ns=2;s=SawMill/MachineState".to_string(),
        data_type: TagDataType::Integer,
        monitored: false,
        published: false,
        unit: None,
    });

    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use sawbridge_core::TagTable;

    #[test]
    fn default_tag_table_is_consistent() {
        let table = TagTable::new(default_tags()).unwrap();

        assert_eq!(table.len(), 9);
        assert_eq!(table.monitored().count(), 8);
        assert!(table.get("machine_state").is_some_and(|t| !t.monitored));
        assert_eq!(
            table.get("power_consumption").and_then(|t| t.unit.as_deref()),
            Some("kW")
        );
    }

    #[test]
    fn default_critical_tags_exist_in_default_table() {
        let config = BridgeConfig::default();
        let table = TagTable::new(config.tags.clone()).unwrap();

        for name in &config.fieldbus.critical_tags {
            assert!(table.get(name).is_some(), "missing critical tag {name}");
        }
    }
}
