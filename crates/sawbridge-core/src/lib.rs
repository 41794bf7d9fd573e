//! # sawbridge-core
//!
//! Domain model for the sawmill telemetry bridge.
//!
//! This crate provides:
//! - Tag table and typed tag values (the field-device data points)
//! - `MachineSnapshot`: the latest consistent view of all monitored tags
//! - Alarm registry with severity and acknowledgment lifecycle
//! - Typed machine commands and the operational state machine
//! - Sliding-window telemetry aggregation (`ProcessedMetrics`)
//!
//! Everything here is pure: no I/O, no async runtime. Timestamps are passed
//! in by callers so all computations are deterministic and testable.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alarm;
pub mod command;
pub mod metrics;
pub mod snapshot;
pub mod tags;

pub use alarm::{Alarm, AlarmRegistry, AlarmSeverity};
pub use command::{validate_transition, Command, CommandResult, MachineState};
pub use metrics::{ProcessedMetrics, Quantity, TelemetryAggregator};
pub use snapshot::{ConnectionHealth, MachineSnapshot};
pub use tags::{Tag, TagDataType, TagTable, TagTableError, TagValue};
