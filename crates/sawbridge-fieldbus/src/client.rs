//! Capability surface expected from a field-bus protocol library.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sawbridge_core::TagValue;
use std::time::Duration;
use tokio::sync::mpsc;

/// Handle identifying a change subscription on the server side.
pub type SubscriptionId = u64;

/// A value change delivered by a subscription.
#[derive(Debug, Clone)]
pub struct TagChange {
    /// Protocol address of the changed point
    pub address: String,
    /// New value
    pub value: TagValue,
    /// When the change was observed
    pub timestamp: DateTime<Utc>,
}

/// Errors surfaced by a field-bus client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FieldError {
    /// No session is currently open
    #[error("not connected to the field device")]
    NotConnected,
    /// Connect or session-level failure
    #[error("connection error: {0}")]
    Connection(String),
    /// Address does not exist on the device
    #[error("address not found: {0}")]
    AddressNotFound(String),
    /// Protocol-level failure on an otherwise open session
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Operation exceeded its deadline
    #[error("operation timed out")]
    Timeout,
}

/// Minimal capability surface the session needs from a protocol library.
///
/// Implementations are expected to be cheap to share (`Arc`) and safe to
/// call concurrently; `connect` and `disconnect` must be idempotent.
#[async_trait]
pub trait FieldClient: Send + Sync {
    /// Open the session to the device.
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be established.
    async fn connect(&self) -> Result<(), FieldError>;

    /// Close the session. Never fails; a closed session stays closed.
    async fn disconnect(&self);

    /// Read the current value at an address.
    ///
    /// # Errors
    ///
    /// Returns error if the session is down or the address is unknown.
    async fn read(&self, address: &str) -> Result<TagValue, FieldError>;

    /// Write a value to an address.
    ///
    /// # Errors
    ///
    /// Returns error if the session is down, the address is unknown, or the
    /// device rejects the value.
    async fn write(&self, address: &str, value: TagValue) -> Result<(), FieldError>;

    /// Establish a change subscription over a set of addresses.
    ///
    /// Changes (including the initial value of each address) are delivered
    /// through `sink` at the given sampling interval until the subscription
    /// is dropped server-side or `unsubscribe` is called.
    ///
    /// # Errors
    ///
    /// Returns error if the session is down or the subscription is refused.
    async fn subscribe(
        &self,
        addresses: Vec<String>,
        sampling_interval: Duration,
        sink: mpsc::Sender<TagChange>,
    ) -> Result<SubscriptionId, FieldError>;

    /// Whether a subscription is still alive on the server side.
    ///
    /// # Errors
    ///
    /// Returns error if the session is down.
    async fn subscription_alive(&self, id: SubscriptionId) -> Result<bool, FieldError>;

    /// Tear down a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId);
}
