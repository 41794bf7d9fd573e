//! Field-bus session: tag-level operations over a protocol client.
//!
//! The session is the single writer of the [`MachineSnapshot`]: every change
//! notification is applied under one write-lock acquisition, so readers only
//! ever see whole updates. Observers are per-tag channel senders; a closed
//! receiver is pruned without affecting delivery to the others.

use crate::client::{FieldClient, FieldError, SubscriptionId, TagChange};
use chrono::{DateTime, Utc};
use sawbridge_core::{MachineSnapshot, TagDataType, TagTable, TagValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Session tuning knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sampling interval requested for change subscriptions
    pub sampling_interval: Duration,
    /// Deadline for every on-demand protocol operation
    pub op_timeout: Duration,
    /// Tags that must exist on the device for `connect` to succeed
    pub critical_tags: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sampling_interval: Duration::from_millis(500),
            op_timeout: Duration::from_secs(5),
            critical_tags: Vec::new(),
        }
    }
}

/// A tag change as seen by observers and the outbound mirror queue.
#[derive(Debug, Clone)]
pub struct TagUpdate {
    /// Logical tag name
    pub name: String,
    /// New value
    pub value: TagValue,
    /// Engineering unit from the tag table, if declared
    pub unit: Option<String>,
    /// When the change was observed
    pub timestamp: DateTime<Utc>,
}

/// Errors surfaced by session operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// A critical tag is missing from the table or the device
    #[error("critical tag unavailable: {0}")]
    MissingCriticalTag(String),
    /// Tag name is not in the configured table
    #[error("unknown tag: {0}")]
    UnknownTag(String),
    /// Value type does not match the tag's declared type
    #[error("value type does not match tag '{tag}' (expects {expected:?})")]
    TypeMismatch {
        /// Tag name
        tag: String,
        /// Declared type of the tag
        expected: TagDataType,
    },
    /// Underlying protocol failure
    #[error(transparent)]
    Field(#[from] FieldError),
}

/// Session to the field device.
///
/// Owns the machine snapshot and the change subscription; hand out through
/// an `Arc` so the change pump can hold a reference.
pub struct FieldBusSession {
    client: Arc<dyn FieldClient>,
    tags: TagTable,
    config: SessionConfig,
    snapshot: RwLock<MachineSnapshot>,
    connected: AtomicBool,
    subscription: Mutex<Option<SubscriptionId>>,
    observers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<TagUpdate>>>>,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<TagUpdate>>>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<TagUpdate>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl FieldBusSession {
    /// Create a session over the given client and tag table.
    #[must_use]
    pub fn new(client: Arc<dyn FieldClient>, tags: TagTable, config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            client,
            tags,
            config,
            snapshot: RwLock::new(MachineSnapshot::new()),
            connected: AtomicBool::new(false),
            subscription: Mutex::new(None),
            observers: Mutex::new(HashMap::new()),
            outbound_tx: Mutex::new(None),
            outbound_rx: Mutex::new(None),
            pump: Mutex::new(None),
        })
    }

    /// Open the session: connect, validate critical tags, subscribe.
    ///
    /// # Errors
    ///
    /// Fails fast with [`SessionError::MissingCriticalTag`] naming the first
    /// critical tag that is absent from the table or the device; protocol
    /// and timeout failures are returned as [`SessionError::Field`].
    pub async fn connect(self: &Arc<Self>) -> Result<(), SessionError> {
        timeout(self.config.op_timeout, self.client.connect())
            .await
            .map_err(|_| FieldError::Timeout)??;

        for name in &self.config.critical_tags {
            let tag = self
                .tags
                .get(name)
                .ok_or_else(|| SessionError::MissingCriticalTag(name.clone()))?;
            let read = timeout(self.config.op_timeout, self.client.read(&tag.address))
                .await
                .map_err(|_| FieldError::Timeout);
            match read {
                Ok(Ok(_)) => {}
                Ok(Err(FieldError::AddressNotFound(_))) | Err(_) => {
                    return Err(SessionError::MissingCriticalTag(name.clone()));
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }

        // The outbound queue survives reconnects so a drain task holding the
        // receiver keeps working across session losses.
        {
            let mut outbound_tx = self.outbound_tx.lock().expect("outbound lock");
            if outbound_tx.is_none() {
                let (tx, rx) = mpsc::unbounded_channel();
                *outbound_tx = Some(tx);
                *self.outbound_rx.lock().expect("outbound lock") = Some(rx);
            }
        }

        self.establish_subscription().await?;

        self.connected.store(true, Ordering::SeqCst);
        self.snapshot
            .write()
            .expect("snapshot lock")
            .health
            .fieldbus_connected = true;

        tracing::info!(tags = self.tags.len(), "Field-bus session established");
        Ok(())
    }

    /// Close the session and clear subscription state.
    pub async fn disconnect(&self) {
        self.mark_disconnected();
        let _ = timeout(self.config.op_timeout, self.client.disconnect()).await;
        tracing::info!("Field-bus session closed");
    }

    /// Record a connection loss: clears subscription state and surfaces the
    /// outage through the snapshot's health block.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.subscription.lock().expect("subscription lock") = None;
        if let Some(pump) = self.pump.lock().expect("pump lock").take() {
            pump.abort();
        }
        self.snapshot
            .write()
            .expect("snapshot lock")
            .health
            .fieldbus_connected = false;
    }

    /// Whether the session is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Read-only copy of the current machine snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MachineSnapshot {
        self.snapshot.read().expect("snapshot lock").clone()
    }

    /// Mirror the message-bus link state into the snapshot's health block.
    pub fn set_bus_connected(&self, connected: bool) {
        self.snapshot
            .write()
            .expect("snapshot lock")
            .health
            .bus_connected = connected;
    }

    /// On-demand read of a tag, bounded by the operation timeout.
    ///
    /// # Errors
    ///
    /// Returns error for unknown tags, timeouts, and protocol failures;
    /// the caller decides retry policy.
    pub async fn read_tag(&self, name: &str) -> Result<TagValue, SessionError> {
        let tag = self
            .tags
            .get(name)
            .ok_or_else(|| SessionError::UnknownTag(name.to_string()))?;
        let value = timeout(self.config.op_timeout, self.client.read(&tag.address))
            .await
            .map_err(|_| FieldError::Timeout)??;
        Ok(value)
    }

    /// On-demand write of a tag, bounded by the operation timeout.
    ///
    /// # Errors
    ///
    /// Returns error for unknown tags, values of the wrong type, timeouts,
    /// and protocol failures.
    pub async fn write_tag(&self, name: &str, value: TagValue) -> Result<(), SessionError> {
        let tag = self
            .tags
            .get(name)
            .ok_or_else(|| SessionError::UnknownTag(name.to_string()))?;
        if !value.assignable_to(tag.data_type) {
            return Err(SessionError::TypeMismatch {
                tag: name.to_string(),
                expected: tag.data_type,
            });
        }
        timeout(
            self.config.op_timeout,
            self.client.write(&tag.address, value),
        )
        .await
        .map_err(|_| FieldError::Timeout)??;
        Ok(())
    }

    /// Register a per-tag observer; every change of the named tag is sent
    /// to the returned channel. Dropping the receiver unregisters it.
    pub fn observe(&self, name: &str) -> mpsc::UnboundedReceiver<TagUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers
            .lock()
            .expect("observers lock")
            .entry(name.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Take the outbound mirror queue of published-tag changes.
    ///
    /// Available once per session; the orchestrator drains it onto the
    /// message bus. The queue survives reconnects.
    #[must_use]
    pub fn take_outbound(&self) -> Option<mpsc::UnboundedReceiver<TagUpdate>> {
        self.outbound_rx.lock().expect("outbound lock").take()
    }

    /// Verify the change subscription is still alive server-side and
    /// transparently re-create it if not. Observer registrations survive.
    ///
    /// Returns `true` if the subscription was re-created.
    ///
    /// # Errors
    ///
    /// Returns error if re-creation fails; the session stays connected and
    /// the next health check retries.
    pub async fn check_subscription_health(self: &Arc<Self>) -> Result<bool, SessionError> {
        if !self.is_connected() {
            return Ok(false);
        }

        let current = *self.subscription.lock().expect("subscription lock");
        let alive = match current {
            None => false,
            Some(id) => {
                match timeout(self.config.op_timeout, self.client.subscription_alive(id)).await {
                    Ok(Ok(alive)) => alive,
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "Subscription aliveness check failed");
                        false
                    }
                    Err(_) => false,
                }
            }
        };

        if alive {
            return Ok(false);
        }

        tracing::warn!("Change subscription expired, re-creating");
        if let Some(id) = current {
            self.client.unsubscribe(id).await;
        }
        self.establish_subscription().await?;
        Ok(true)
    }

    async fn establish_subscription(self: &Arc<Self>) -> Result<(), SessionError> {
        let addresses: Vec<String> = self.tags.monitored().map(|t| t.address.clone()).collect();
        let (tx, mut rx) = mpsc::channel(256);

        let id = timeout(
            self.config.op_timeout,
            self.client
                .subscribe(addresses, self.config.sampling_interval, tx),
        )
        .await
        .map_err(|_| FieldError::Timeout)??;

        *self.subscription.lock().expect("subscription lock") = Some(id);

        let session = Arc::clone(self);
        let pump = tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                session.apply_change(change);
            }
            // The client dropped the sender: the subscription is gone. If
            // nobody replaced it in the meantime, surface the outage.
            if session.is_connected()
                && session.subscription.lock().expect("subscription lock").as_ref() == Some(&id)
            {
                tracing::warn!("Change delivery stopped, marking session disconnected");
                session.mark_disconnected();
            }
        });

        if let Some(old) = self.pump.lock().expect("pump lock").replace(pump) {
            old.abort();
        }

        Ok(())
    }

    fn apply_change(&self, change: TagChange) {
        let Some(name) = self.tags.name_for_address(&change.address) else {
            tracing::debug!(address = %change.address, "Change for unconfigured address");
            return;
        };
        let Some(tag) = self.tags.get(name) else {
            return;
        };

        let update = TagUpdate {
            name: tag.name.clone(),
            value: change.value,
            unit: tag.unit.clone(),
            timestamp: change.timestamp,
        };

        // Whole update under one write acquisition; readers never observe a
        // half-applied change.
        self.snapshot.write().expect("snapshot lock").set(
            update.name.clone(),
            update.value.clone(),
            update.timestamp,
        );

        let mut observers = self.observers.lock().expect("observers lock");
        if let Some(senders) = observers.get_mut(&update.name) {
            senders.retain(|sender| sender.send(update.clone()).is_ok());
        }
        drop(observers);

        if tag.published {
            let outbound = self.outbound_tx.lock().expect("outbound lock");
            if let Some(tx) = outbound.as_ref() {
                let _ = tx.send(update);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFieldClient;
    use sawbridge_core::Tag;

    fn tag(name: &str, data_type: TagDataType, published: bool) -> Tag {
        Tag {
            name: name.to_string(),
            address: format!("ns=2;s=SawMill/{name}"),
            data_type,
            monitored: true,
            published,
            unit: None,
        }
    }

    fn table() -> TagTable {
        TagTable::new(vec![
            tag("is_active", TagDataType::Boolean, false),
            tag("cutting_speed", TagDataType::Float, true),
            tag("pieces_count", TagDataType::Integer, false),
        ])
        .unwrap()
    }

    fn seeded_sim() -> SimFieldClient {
        SimFieldClient::with_values([
            (
                "ns=2;s=SawMill/is_active".to_string(),
                TagValue::Boolean(false),
            ),
            (
                "ns=2;s=SawMill/cutting_speed".to_string(),
                TagValue::Float(0.0),
            ),
            (
                "ns=2;s=SawMill/pieces_count".to_string(),
                TagValue::Integer(0),
            ),
        ])
    }

    fn config() -> SessionConfig {
        SessionConfig {
            sampling_interval: Duration::from_millis(5),
            op_timeout: Duration::from_secs(1),
            critical_tags: vec!["is_active".to_string(), "cutting_speed".to_string()],
        }
    }

    async fn recv_update(
        rx: &mut mpsc::UnboundedReceiver<TagUpdate>,
    ) -> TagUpdate {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for tag update")
            .expect("observer channel closed")
    }

    #[tokio::test]
    async fn connect_fails_fast_on_missing_critical_tag() {
        let sim = SimFieldClient::new(); // empty address space
        let session = FieldBusSession::new(Arc::new(sim), table(), config());

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::MissingCriticalTag(name) if name == "is_active"));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn changes_update_snapshot_and_observers() {
        let sim = seeded_sim();
        let session = FieldBusSession::new(Arc::new(sim.clone()), table(), config());

        let mut speed_rx = session.observe("cutting_speed");
        session.connect().await.unwrap();

        // Initial value delivery.
        assert_eq!(recv_update(&mut speed_rx).await.value, TagValue::Float(0.0));

        sim.set("ns=2;s=SawMill/cutting_speed", TagValue::Float(7.5));
        assert_eq!(recv_update(&mut speed_rx).await.value, TagValue::Float(7.5));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.float_tag("cutting_speed"), 7.5);
        assert!(snapshot.health.fieldbus_connected);
        assert!(snapshot.updated_at.is_some());
    }

    #[tokio::test]
    async fn published_tags_are_mirrored_to_outbound_queue() {
        let sim = seeded_sim();
        let session = FieldBusSession::new(Arc::new(sim.clone()), table(), config());

        session.connect().await.unwrap();
        let mut outbound = session.take_outbound().expect("outbound queue");

        // cutting_speed is the only published tag; pieces_count changes
        // must not show up here.
        sim.set("ns=2;s=SawMill/pieces_count", TagValue::Integer(5));
        sim.set("ns=2;s=SawMill/cutting_speed", TagValue::Float(3.0));

        loop {
            let update = tokio::time::timeout(Duration::from_secs(2), outbound.recv())
                .await
                .expect("timed out waiting for outbound update")
                .expect("outbound queue closed");
            assert_eq!(update.name, "cutting_speed");
            if update.value == TagValue::Float(3.0) {
                break;
            }
        }
    }

    #[tokio::test]
    async fn closed_observer_does_not_block_others() {
        let sim = seeded_sim();
        let session = FieldBusSession::new(Arc::new(sim.clone()), table(), config());

        let dropped = session.observe("cutting_speed");
        let mut kept = session.observe("cutting_speed");
        drop(dropped);

        session.connect().await.unwrap();
        sim.set("ns=2;s=SawMill/cutting_speed", TagValue::Float(9.0));

        loop {
            if recv_update(&mut kept).await.value == TagValue::Float(9.0) {
                break;
            }
        }
    }

    #[tokio::test]
    async fn write_tag_is_type_checked() {
        let sim = seeded_sim();
        let session = FieldBusSession::new(Arc::new(sim.clone()), table(), config());
        session.connect().await.unwrap();

        let err = session
            .write_tag("cutting_speed", TagValue::Text("fast".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::TypeMismatch { .. }));

        // Integers widen to float tags.
        session
            .write_tag("cutting_speed", TagValue::Integer(4))
            .await
            .unwrap();
        assert_eq!(
            sim.get("ns=2;s=SawMill/cutting_speed"),
            Some(TagValue::Integer(4))
        );

        let err = session
            .write_tag("no_such_tag", TagValue::Integer(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnknownTag(_)));
    }

    #[tokio::test]
    async fn health_check_recreates_expired_subscription() {
        let sim = seeded_sim();
        let session = FieldBusSession::new(Arc::new(sim.clone()), table(), config());

        let mut speed_rx = session.observe("cutting_speed");
        session.connect().await.unwrap();
        assert_eq!(recv_update(&mut speed_rx).await.value, TagValue::Float(0.0));

        assert!(!session.check_subscription_health().await.unwrap());

        sim.expire_subscriptions();
        assert!(session.check_subscription_health().await.unwrap());

        // The re-created subscription still feeds the old observer.
        sim.set("ns=2;s=SawMill/cutting_speed", TagValue::Float(2.0));
        loop {
            if recv_update(&mut speed_rx).await.value == TagValue::Float(2.0) {
                break;
            }
        }
    }
}
