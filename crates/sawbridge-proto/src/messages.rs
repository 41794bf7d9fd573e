//! JSON wire messages.
//!
//! Outbound payloads use camelCase field names; the inbound control envelope
//! is validated into the typed [`Command`] here so malformed or duck-typed
//! payloads never reach the executor.

use chrono::{DateTime, SecondsFormat, Utc};
use sawbridge_core::{Alarm, AlarmSeverity, Command, CommandResult, MachineSnapshot, TagValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn rfc3339(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Periodic machine status message (bus `status` topic).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    /// Machine active flag
    pub is_active: bool,
    /// Machine working flag
    pub is_working: bool,
    /// Machine stopped flag
    pub is_stopped: bool,
    /// Device alarm flag
    pub has_alarm: bool,
    /// Device error flag
    pub has_error: bool,
    /// Current cutting speed
    pub cutting_speed: f64,
    /// Current power draw, kW
    pub power_consumption: f64,
    /// Cumulative piece counter
    pub pieces_count: i64,
    /// Message timestamp, RFC 3339
    pub timestamp: String,
}

impl StatusMessage {
    /// Build a status message from the current snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: &MachineSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            is_active: snapshot.bool_tag("is_active"),
            is_working: snapshot.bool_tag("is_working"),
            is_stopped: snapshot.bool_tag_or("is_stopped", true),
            has_alarm: snapshot.bool_tag("has_alarm"),
            has_error: snapshot.bool_tag("has_error"),
            cutting_speed: snapshot.float_tag("cutting_speed"),
            power_consumption: snapshot.float_tag("power_consumption"),
            pieces_count: snapshot.int_tag("pieces_count"),
            timestamp: rfc3339(now),
        }
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(|e| WireError::Serialize(e.to_string()))
    }
}

/// Last-will payload registered on the status topic at connect time.
#[must_use]
pub fn offline_status_payload() -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({"status": "offline"})).unwrap_or_default()
}

/// One entry of the outbound alarm array (bus `alarm` topic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmEntry {
    /// Condition key
    pub code: String,
    /// Human-readable description
    pub message: String,
    /// Condition severity
    pub severity: AlarmSeverity,
    /// When the condition was raised, RFC 3339
    pub timestamp: String,
    /// Operator acknowledgment flag
    pub acknowledged: bool,
}

impl From<&Alarm> for AlarmEntry {
    fn from(alarm: &Alarm) -> Self {
        Self {
            code: alarm.code.clone(),
            message: alarm.message.clone(),
            severity: alarm.severity,
            timestamp: rfc3339(alarm.raised_at),
            acknowledged: alarm.acknowledged,
        }
    }
}

/// Serialize the active-alarm array for publishing.
///
/// # Errors
///
/// Returns error if serialization fails.
pub fn alarms_payload(alarms: &[Alarm]) -> Result<Vec<u8>, WireError> {
    let entries: Vec<AlarmEntry> = alarms.iter().map(AlarmEntry::from).collect();
    serde_json::to_vec(&entries).map_err(|e| WireError::Serialize(e.to_string()))
}

/// Per-tag mirror payload (bus `tag/{name}` topics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagUpdateMessage {
    /// New tag value
    pub value: TagValue,
    /// Engineering unit, if declared
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Change timestamp, RFC 3339
    pub timestamp: String,
}

impl TagUpdateMessage {
    /// Build a mirror payload for a tag change.
    #[must_use]
    pub fn new(value: TagValue, unit: Option<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            value,
            unit,
            timestamp: rfc3339(timestamp),
        }
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(|e| WireError::Serialize(e.to_string()))
    }
}

/// Outbound command-result message (bus `result` topic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResultMessage {
    /// Wire name of the command kind
    pub command: String,
    /// Whether the command was applied
    pub success: bool,
    /// Result timestamp, RFC 3339
    pub timestamp: String,
    /// Detail on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Reason on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&CommandResult> for CommandResultMessage {
    fn from(result: &CommandResult) -> Self {
        let (message, error) = if result.success {
            (result.message.clone(), None)
        } else {
            (None, result.message.clone())
        };
        Self {
            command: result.command.clone(),
            success: result.success,
            timestamp: rfc3339(result.timestamp),
            message,
            error,
        }
    }
}

impl CommandResultMessage {
    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(|e| WireError::Serialize(e.to_string()))
    }
}

/// Inbound control envelope (bus `control` topic).
///
/// Wire shape: `{"command": "<kind>", "params": {...}}`.
pub struct ControlMessage;

impl ControlMessage {
    /// Parse and validate an inbound control payload into a typed command.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not a JSON object, lacks the
    /// required `command` field, names an unknown kind, or carries
    /// invalid parameters for the kind.
    pub fn parse(payload: &[u8]) -> Result<Command, ControlError> {
        let value: Value =
            serde_json::from_slice(payload).map_err(|e| ControlError::Json(e.to_string()))?;

        let object = value
            .as_object()
            .ok_or_else(|| ControlError::Json("control payload must be a JSON object".to_string()))?;

        let kind = object
            .get("command")
            .and_then(Value::as_str)
            .ok_or(ControlError::MissingCommand)?;

        let params = object.get("params").cloned().unwrap_or(Value::Null);

        match kind {
            "start" => Ok(Command::Start),
            "stop" => Ok(Command::Stop),
            "emergency_stop" => Ok(Command::EmergencyStop),
            "reset" => Ok(Command::Reset),
            "update_speed" => {
                let target_speed = params
                    .get("target_speed")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| {
                        ControlError::InvalidParams(
                            "update_speed requires numeric 'target_speed'".to_string(),
                        )
                    })?;
                if !target_speed.is_finite() {
                    return Err(ControlError::InvalidParams(
                        "'target_speed' must be finite".to_string(),
                    ));
                }
                Ok(Command::UpdateSpeed { target_speed })
            }
            "acknowledge_alarm" => {
                let alarm_code = params
                    .get("alarm_code")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ControlError::InvalidParams(
                            "acknowledge_alarm requires string 'alarm_code'".to_string(),
                        )
                    })?;
                Ok(Command::AcknowledgeAlarm {
                    alarm_code: alarm_code.to_string(),
                })
            }
            other => Err(ControlError::UnknownCommand(other.to_string())),
        }
    }
}

/// Errors for inbound control payloads.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlError {
    /// Payload is not valid JSON
    #[error("invalid JSON: {0}")]
    Json(String),
    /// Required `command` field is missing or not a string
    #[error("missing 'command' field in control message")]
    MissingCommand,
    /// Command kind is not part of the contract
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// Parameters do not match the command kind
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

/// Errors for outbound message serialization.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use sawbridge_core::MachineState;

    #[test]
    fn status_message_uses_camel_case() {
        let mut snapshot = MachineSnapshot::new();
        let now = Utc::now();
        snapshot.set("is_working", TagValue::Boolean(true), now);
        snapshot.set("cutting_speed", TagValue::Float(3.5), now);
        snapshot.set("pieces_count", TagValue::Integer(17), now);

        let message = StatusMessage::from_snapshot(&snapshot, now);
        let json: Value = serde_json::from_slice(&message.to_json().unwrap()).unwrap();

        assert_eq!(json["isWorking"], Value::Bool(true));
        assert_eq!(json["cuttingSpeed"], serde_json::json!(3.5));
        assert_eq!(json["piecesCount"], serde_json::json!(17));
        assert!(json["timestamp"].is_string());
        // No value received yet for is_stopped: defaults to stopped.
        assert_eq!(json["isStopped"], Value::Bool(true));
    }

    #[test]
    fn offline_payload_shape() {
        let json: Value = serde_json::from_slice(&offline_status_payload()).unwrap();
        assert_eq!(json, serde_json::json!({"status": "offline"}));
    }

    #[test]
    fn alarm_array_payload() {
        let alarms = vec![Alarm {
            code: "ALM001".to_string(),
            message: "blade jam".to_string(),
            severity: AlarmSeverity::Error,
            raised_at: Utc::now(),
            acknowledged: true,
        }];

        let json: Value = serde_json::from_slice(&alarms_payload(&alarms).unwrap()).unwrap();
        assert_eq!(json[0]["code"], "ALM001");
        assert_eq!(json[0]["severity"], "error");
        assert_eq!(json[0]["acknowledged"], Value::Bool(true));
    }

    #[test]
    fn result_message_splits_message_and_error() {
        let now = Utc::now();
        let ok = CommandResultMessage::from(&CommandResult::ok("start", now));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let rejected = CommandResultMessage::from(&CommandResult::rejected(
            "start",
            "active alarms",
            now,
        ));
        assert!(!rejected.success);
        assert_eq!(rejected.error.as_deref(), Some("active alarms"));
        assert!(rejected.message.is_none());

        let json: Value = serde_json::from_slice(&rejected.to_json().unwrap()).unwrap();
        assert!(json.get("message").is_none());
    }

    #[test]
    fn control_parse_known_kinds() {
        assert_eq!(
            ControlMessage::parse(br#"{"command": "start"}"#).unwrap(),
            Command::Start
        );
        assert_eq!(
            ControlMessage::parse(br#"{"command": "emergency_stop", "params": {}}"#).unwrap(),
            Command::EmergencyStop
        );
        assert_eq!(
            ControlMessage::parse(
                br#"{"command": "update_speed", "params": {"target_speed": 12.5}}"#
            )
            .unwrap(),
            Command::UpdateSpeed { target_speed: 12.5 }
        );
        assert_eq!(
            ControlMessage::parse(
                br#"{"command": "acknowledge_alarm", "params": {"alarm_code": "ALM001"}}"#
            )
            .unwrap(),
            Command::AcknowledgeAlarm {
                alarm_code: "ALM001".to_string()
            }
        );
    }

    #[test]
    fn control_parse_rejects_malformed_payloads() {
        assert!(matches!(
            ControlMessage::parse(b"not json"),
            Err(ControlError::Json(_))
        ));
        assert!(matches!(
            ControlMessage::parse(br#"{"params": {}}"#),
            Err(ControlError::MissingCommand)
        ));
        assert!(matches!(
            ControlMessage::parse(br#"{"command": "self_destruct"}"#),
            Err(ControlError::UnknownCommand(_))
        ));
        assert!(matches!(
            ControlMessage::parse(br#"{"command": "update_speed"}"#),
            Err(ControlError::InvalidParams(_))
        ));
        assert!(matches!(
            ControlMessage::parse(br#"{"command": "acknowledge_alarm", "params": {}}"#),
            Err(ControlError::InvalidParams(_))
        ));
    }

    #[test]
    fn machine_state_wire_names() {
        assert_eq!(MachineState::Stopped.as_str(), "stopped");
        assert_eq!(MachineState::Working.as_str(), "working");
    }
}
