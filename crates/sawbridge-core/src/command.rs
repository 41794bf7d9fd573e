//! Machine commands and the operational state machine.
//!
//! Commands arrive as a tagged union, validated at the message-bus boundary;
//! each variant carries only the parameters it needs. Transition rules are
//! pure so they can be checked without touching the field device.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Operational state of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// Machine is stopped
    Stopped,
    /// Machine is working
    Working,
}

impl MachineState {
    /// Wire name of the state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Working => "working",
        }
    }
}

/// A discrete machine command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Begin working; valid only from stopped
    Start,
    /// Stop working; valid only while working
    Stop,
    /// Unconditionally force stopped (safety override, bypasses alarm gate)
    EmergencyStop,
    /// Clear the device error latch; valid only while stopped
    Reset,
    /// Change the cutting speed setpoint
    UpdateSpeed {
        /// Requested speed, in the device's speed unit
        target_speed: f64,
    },
    /// Acknowledge an active alarm (bypasses alarm gate)
    AcknowledgeAlarm {
        /// Code of the alarm to acknowledge
        alarm_code: String,
    },
}

impl Command {
    /// Wire name of the command kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::EmergencyStop => "emergency_stop",
            Self::Reset => "reset",
            Self::UpdateSpeed { .. } => "update_speed",
            Self::AcknowledgeAlarm { .. } => "acknowledge_alarm",
        }
    }

    /// Whether this command may execute while alarms are active.
    ///
    /// Any active alarm, acknowledged or not, blocks every other command.
    #[must_use]
    pub fn bypasses_alarm_gate(&self) -> bool {
        matches!(self, Self::EmergencyStop | Self::AcknowledgeAlarm { .. })
    }
}

/// Validate a command against the current operational state.
///
/// Returns the state after the command, or a rejection reason. This checks
/// transitions only; alarm gating and parameter bounds are the executor's
/// concern.
///
/// # Errors
///
/// Returns a descriptive reason when the transition is illegal from the
/// current state.
pub fn validate_transition(state: MachineState, command: &Command) -> Result<MachineState, String> {
    match command {
        Command::Start => match state {
            MachineState::Stopped => Ok(MachineState::Working),
            MachineState::Working => Err("machine is already working".to_string()),
        },
        Command::Stop => match state {
            MachineState::Working => Ok(MachineState::Stopped),
            MachineState::Stopped => Err("machine is not working".to_string()),
        },
        Command::EmergencyStop => Ok(MachineState::Stopped),
        Command::Reset => match state {
            MachineState::Stopped => Ok(MachineState::Stopped),
            MachineState::Working => Err("reset requires the machine to be stopped".to_string()),
        },
        Command::UpdateSpeed { .. } | Command::AcknowledgeAlarm { .. } => Ok(state),
    }
}

/// Outcome of a command execution, published and returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResult {
    /// Wire name of the executed command kind
    pub command: String,
    /// Whether the command was applied
    pub success: bool,
    /// Optional detail (rejection reason or confirmation)
    pub message: Option<String>,
    /// When the result was produced
    pub timestamp: DateTime<Utc>,
}

impl CommandResult {
    /// Successful result without detail.
    #[must_use]
    pub fn ok(kind: &str, now: DateTime<Utc>) -> Self {
        Self {
            command: kind.to_string(),
            success: true,
            message: None,
            timestamp: now,
        }
    }

    /// Successful result with a detail message.
    #[must_use]
    pub fn ok_with(kind: &str, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            command: kind.to_string(),
            success: true,
            message: Some(message.into()),
            timestamp: now,
        }
    }

    /// Rejected result with a reason.
    #[must_use]
    pub fn rejected(kind: &str, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            command: kind.to_string(),
            success: false,
            message: Some(reason.into()),
            timestamp: now,
        }
    }
}
