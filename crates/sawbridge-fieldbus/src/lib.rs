//! # sawbridge-fieldbus
//!
//! Field-bus session for the sawmill telemetry bridge.
//!
//! The wire protocol (addressing scheme, session handshake) is supplied by
//! an external client library behind the [`FieldClient`] capability trait;
//! this crate owns everything above it: critical-tag validation at connect
//! time, change subscriptions with a single-writer machine snapshot,
//! per-tag observer registration, periodic subscription health checks, and
//! bounded-timeout reads and writes.
//!
//! [`sim::SimFieldClient`] provides an in-memory driver for tests and the
//! demo endpoint.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod session;
pub mod sim;

pub use client::{FieldClient, FieldError, SubscriptionId, TagChange};
pub use session::{FieldBusSession, SessionConfig, SessionError, TagUpdate};
pub use sim::SimFieldClient;
