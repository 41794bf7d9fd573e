//! Command execution against the field device.
//!
//! The executor owns the alarm registry and the local operational state.
//! Every command passes the alarm gate first (any active alarm blocks it,
//! acknowledged or not, except the safety exemptions), then the pure
//! transition rules, and only then touches the field device. Commands are
//! executed one at a time by the orchestrator's drain task, so ordering is
//! strictly FIFO.

use chrono::Utc;
use sawbridge_core::{
    validate_transition, Alarm, AlarmRegistry, AlarmSeverity, Command, CommandResult,
    MachineSnapshot, MachineState, TagValue,
};
use sawbridge_fieldbus::FieldBusSession;
use std::sync::{Arc, Mutex};

/// Alarm code raised when the device reports its general alarm flag.
pub const MACHINE_ALARM: &str = "MACHINE_ALARM";
/// Alarm code raised when the device reports its error latch.
pub const MACHINE_ERROR: &str = "MACHINE_ERROR";

const MACHINE_STATE_TAG: &str = "machine_state";
const HAS_ERROR_TAG: &str = "has_error";
const CUTTING_SPEED_TAG: &str = "cutting_speed";

/// Executes validated commands against the field device.
pub struct CommandExecutor {
    session: Arc<FieldBusSession>,
    alarms: Mutex<AlarmRegistry>,
    state: Mutex<MachineState>,
    max_cutting_speed: f64,
}

impl CommandExecutor {
    /// Executor starting in the stopped state with no active alarms.
    #[must_use]
    pub fn new(session: Arc<FieldBusSession>, max_cutting_speed: f64) -> Self {
        Self {
            session,
            alarms: Mutex::new(AlarmRegistry::new()),
            state: Mutex::new(MachineState::Stopped),
            max_cutting_speed,
        }
    }

    /// Current local operational state.
    #[must_use]
    pub fn state(&self) -> MachineState {
        *self.state.lock().expect("state lock")
    }

    /// Snapshot of all active alarms, oldest first.
    #[must_use]
    pub fn active_alarms(&self) -> Vec<Alarm> {
        self.alarms.lock().expect("alarms lock").active()
    }

    /// Acknowledge an active alarm directly (collaborator API).
    pub fn acknowledge_alarm(&self, code: &str) -> bool {
        self.alarms.lock().expect("alarms lock").acknowledge(code)
    }

    /// Execute a command, producing a result for the bus.
    ///
    /// Rejections (alarm gate, illegal transition, parameter bounds, field
    /// write failure) are reported as unsuccessful results, never as errors;
    /// the bridge keeps running regardless of command outcomes.
    pub async fn execute(&self, command: &Command) -> CommandResult {
        let kind = command.kind();
        let now = Utc::now();

        if !command.bypasses_alarm_gate() {
            let alarms = self.alarms.lock().expect("alarms lock");
            if alarms.has_active() {
                let codes: Vec<String> =
                    alarms.active().into_iter().map(|a| a.code).collect();
                drop(alarms);
                tracing::warn!(command = kind, alarms = ?codes, "Command blocked by active alarms");
                return CommandResult::rejected(
                    kind,
                    format!("active alarms: {}", codes.join(", ")),
                    now,
                );
            }
        }

        let current = self.state();
        let next = match validate_transition(current, command) {
            Ok(next) => next,
            Err(reason) => {
                tracing::warn!(command = kind, state = current.as_str(), %reason, "Command rejected");
                return CommandResult::rejected(kind, reason, now);
            }
        };

        match command {
            Command::Start => {
                if let Err(e) = self
                    .session
                    .write_tag(MACHINE_STATE_TAG, TagValue::Integer(1))
                    .await
                {
                    return CommandResult::rejected(kind, e.to_string(), now);
                }
                self.set_state(next);
                CommandResult::ok(kind, now)
            }
            Command::Stop => {
                if let Err(e) = self
                    .session
                    .write_tag(MACHINE_STATE_TAG, TagValue::Integer(0))
                    .await
                {
                    return CommandResult::rejected(kind, e.to_string(), now);
                }
                self.set_state(next);
                CommandResult::ok(kind, now)
            }
            Command::EmergencyStop => {
                // The local state goes to stopped even if the write fails;
                // the safety override must never report the machine running.
                let write = self
                    .session
                    .write_tag(MACHINE_STATE_TAG, TagValue::Integer(0))
                    .await;
                self.set_state(MachineState::Stopped);
                match write {
                    Ok(()) => CommandResult::ok(kind, now),
                    Err(e) => {
                        tracing::error!(error = %e, "Emergency stop write failed, state forced locally");
                        CommandResult::rejected(
                            kind,
                            format!("stop write failed, local state forced: {e}"),
                            now,
                        )
                    }
                }
            }
            Command::Reset => {
                if let Err(e) = self
                    .session
                    .write_tag(HAS_ERROR_TAG, TagValue::Boolean(false))
                    .await
                {
                    return CommandResult::rejected(kind, e.to_string(), now);
                }
                CommandResult::ok_with(kind, "error latch cleared", now)
            }
            Command::UpdateSpeed { target_speed } => {
                if *target_speed <= 0.0 || *target_speed > self.max_cutting_speed {
                    return CommandResult::rejected(
                        kind,
                        format!(
                            "target speed {target_speed} outside (0, {}]",
                            self.max_cutting_speed
                        ),
                        now,
                    );
                }
                if let Err(e) = self
                    .session
                    .write_tag(CUTTING_SPEED_TAG, TagValue::Float(*target_speed))
                    .await
                {
                    return CommandResult::rejected(kind, e.to_string(), now);
                }
                CommandResult::ok_with(kind, format!("speed set to {target_speed}"), now)
            }
            Command::AcknowledgeAlarm { alarm_code } => {
                let acknowledged = self
                    .alarms
                    .lock()
                    .expect("alarms lock")
                    .acknowledge(alarm_code);
                if acknowledged {
                    CommandResult::ok_with(kind, format!("acknowledged {alarm_code}"), now)
                } else {
                    CommandResult::rejected(
                        kind,
                        format!("no active alarm with code {alarm_code}"),
                        now,
                    )
                }
            }
        }
    }

    /// Reconcile the alarm registry and local state with a field snapshot.
    ///
    /// Device alarm/error flags raise or clear the corresponding registry
    /// entries; the working/stopped flags overwrite the local operational
    /// state, since the device is authoritative once telemetry flows.
    /// Returns whether the set of active alarms changed.
    pub fn sync_with_snapshot(&self, snapshot: &MachineSnapshot) -> bool {
        let now = Utc::now();
        let mut alarms = self.alarms.lock().expect("alarms lock");
        let mut changed = false;

        if snapshot.bool_tag("has_alarm") {
            changed |= alarms.raise(
                MACHINE_ALARM,
                "machine alarm flag is set",
                AlarmSeverity::Warning,
                now,
            );
        } else {
            changed |= alarms.clear(MACHINE_ALARM);
        }

        if snapshot.bool_tag("has_error") {
            changed |= alarms.raise(
                MACHINE_ERROR,
                "machine error latch is set",
                AlarmSeverity::Critical,
                now,
            );
        } else {
            changed |= alarms.clear(MACHINE_ERROR);
        }
        drop(alarms);

        if snapshot.bool_tag("is_working") {
            self.set_state(MachineState::Working);
        } else if snapshot.bool_tag("is_stopped") {
            self.set_state(MachineState::Stopped);
        }

        changed
    }

    fn set_state(&self, next: MachineState) {
        let mut state = self.state.lock().expect("state lock");
        if *state != next {
            tracing::info!(from = state.as_str(), to = next.as_str(), "Machine state changed");
            *state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sawbridge_core::{Tag, TagDataType, TagTable};
    use sawbridge_fieldbus::{FieldClient, SessionConfig, SimFieldClient};

    fn tag(name: &str, address: &str, data_type: TagDataType) -> Tag {
        Tag {
            name: name.to_string(),
            address: address.to_string(),
            data_type,
            monitored: false,
            published: false,
            unit: None,
        }
    }

    async fn executor_with_sim() -> (CommandExecutor, SimFieldClient) {
        let sim = SimFieldClient::with_values([
            ("ns=2;s=SawMill/MachineState".to_string(), TagValue::Integer(0)),
            ("ns=2;s=SawMill/HasError".to_string(), TagValue::Boolean(false)),
            ("ns=2;s=SawMill/CuttingSpeed".to_string(), TagValue::Float(0.0)),
        ]);
        let tags = TagTable::new(vec![
            tag("machine_state", "ns=2;s=SawMill/MachineState", TagDataType::Integer),
            tag("has_error", "ns=2;s=SawMill/HasError", TagDataType::Boolean),
            tag("cutting_speed", "ns=2;s=SawMill/CuttingSpeed", TagDataType::Float),
        ])
        .unwrap();
        let session = FieldBusSession::new(
            Arc::new(sim.clone()),
            tags,
            SessionConfig {
                critical_tags: vec![],
                ..SessionConfig::default()
            },
        );
        session.connect().await.unwrap();
        (CommandExecutor::new(session, 10.0), sim)
    }

    #[tokio::test]
    async fn start_writes_machine_state_and_transitions() {
        let (executor, sim) = executor_with_sim().await;

        let result = executor.execute(&Command::Start).await;
        assert!(result.success);
        assert_eq!(executor.state(), MachineState::Working);
        assert_eq!(
            sim.get("ns=2;s=SawMill/MachineState"),
            Some(TagValue::Integer(1))
        );

        // Starting again is an illegal transition.
        let again = executor.execute(&Command::Start).await;
        assert!(!again.success);
    }

    #[tokio::test]
    async fn any_active_alarm_blocks_normal_commands() {
        let (executor, _sim) = executor_with_sim().await;

        let mut snapshot = MachineSnapshot::new();
        snapshot.set("has_alarm", TagValue::Boolean(true), Utc::now());
        assert!(executor.sync_with_snapshot(&snapshot));

        let start = executor.execute(&Command::Start).await;
        assert!(!start.success);
        assert!(start.message.as_deref().unwrap().contains("MACHINE_ALARM"));

        // Acknowledging does not lift the gate while the condition persists.
        let ack = executor
            .execute(&Command::AcknowledgeAlarm {
                alarm_code: MACHINE_ALARM.to_string(),
            })
            .await;
        assert!(ack.success);
        let start = executor.execute(&Command::Start).await;
        assert!(!start.success);

        // Emergency stop bypasses the gate.
        let estop = executor.execute(&Command::EmergencyStop).await;
        assert!(estop.success);

        // Condition clears, gate lifts.
        snapshot.set("has_alarm", TagValue::Boolean(false), Utc::now());
        assert!(executor.sync_with_snapshot(&snapshot));
        assert!(executor.execute(&Command::Start).await.success);
    }

    #[tokio::test]
    async fn emergency_stop_forces_local_state_on_write_failure() {
        let (executor, sim) = executor_with_sim().await;
        assert!(executor.execute(&Command::Start).await.success);

        sim.disconnect().await;
        let result = executor.execute(&Command::EmergencyStop).await;
        assert!(!result.success);
        assert_eq!(executor.state(), MachineState::Stopped);
    }

    #[tokio::test]
    async fn reset_clears_error_latch_only_while_stopped() {
        let (executor, sim) = executor_with_sim().await;
        sim.set("ns=2;s=SawMill/HasError", TagValue::Boolean(true));

        assert!(executor.execute(&Command::Reset).await.success);
        assert_eq!(
            sim.get("ns=2;s=SawMill/HasError"),
            Some(TagValue::Boolean(false))
        );

        assert!(executor.execute(&Command::Start).await.success);
        assert!(!executor.execute(&Command::Reset).await.success);
    }

    #[tokio::test]
    async fn update_speed_enforces_bounds() {
        let (executor, sim) = executor_with_sim().await;

        assert!(
            !executor
                .execute(&Command::UpdateSpeed { target_speed: 0.0 })
                .await
                .success
        );
        assert!(
            !executor
                .execute(&Command::UpdateSpeed { target_speed: 10.5 })
                .await
                .success
        );
        assert!(
            executor
                .execute(&Command::UpdateSpeed { target_speed: 7.5 })
                .await
                .success
        );
        assert_eq!(
            sim.get("ns=2;s=SawMill/CuttingSpeed"),
            Some(TagValue::Float(7.5))
        );
    }

    #[tokio::test]
    async fn acknowledge_unknown_alarm_is_rejected() {
        let (executor, _sim) = executor_with_sim().await;

        let result = executor
            .execute(&Command::AcknowledgeAlarm {
                alarm_code: "ALM999".to_string(),
            })
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn snapshot_sync_promotes_error_latch_to_critical_alarm() {
        let (executor, _sim) = executor_with_sim().await;

        let mut snapshot = MachineSnapshot::new();
        snapshot.set("has_error", TagValue::Boolean(true), Utc::now());
        assert!(executor.sync_with_snapshot(&snapshot));

        let alarms = executor.active_alarms();
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].code, MACHINE_ERROR);
        assert_eq!(alarms[0].severity, AlarmSeverity::Critical);

        // Re-sync with the same snapshot reports no change.
        assert!(!executor.sync_with_snapshot(&snapshot));
    }

    #[tokio::test]
    async fn snapshot_sync_mirrors_working_flag_into_state() {
        let (executor, _sim) = executor_with_sim().await;

        let mut snapshot = MachineSnapshot::new();
        snapshot.set("is_working", TagValue::Boolean(true), Utc::now());
        executor.sync_with_snapshot(&snapshot);
        assert_eq!(executor.state(), MachineState::Working);

        snapshot.set("is_working", TagValue::Boolean(false), Utc::now());
        snapshot.set("is_stopped", TagValue::Boolean(true), Utc::now());
        executor.sync_with_snapshot(&snapshot);
        assert_eq!(executor.state(), MachineState::Stopped);
    }
}
