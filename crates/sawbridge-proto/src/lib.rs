//! # sawbridge-proto
//!
//! Message-bus wire contract for the sawmill telemetry bridge.
//!
//! ## Messages
//!
//! - `StatusMessage`: periodic machine status (camelCase JSON)
//! - Alarm payload: JSON array of active alarm entries
//! - `CommandResultMessage`: outcome of an executed command
//! - `ControlMessage`: inbound command envelope, validated into the typed
//!   [`sawbridge_core::Command`] at the bus boundary
//!
//! ## Topics
//!
//! Topic scheme: `sawbridge/v1/{machine}/{channel}` with channels
//! `status`, `alarm`, `control`, `config`, `result`, and `tag/{name}`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{
    alarms_payload, offline_status_payload, AlarmEntry, CommandResultMessage, ControlError,
    ControlMessage, StatusMessage, TagUpdateMessage, WireError,
};
pub use topics::{TopicKind, TopicScheme};
