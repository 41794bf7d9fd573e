//! In-memory field device simulator.
//!
//! Implements the full [`FieldClient`] surface against a mutable value map:
//! change subscriptions poll the map at the sampling interval and deliver
//! only actual changes (plus the initial value of each address). Used by the
//! test suite and by the `sim://` demo endpoint.

use crate::client::{FieldClient, FieldError, SubscriptionId, TagChange};
use async_trait::async_trait;
use chrono::Utc;
use sawbridge_core::TagValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct SimState {
    values: Mutex<HashMap<String, TagValue>>,
    connected: AtomicBool,
    fail_connects: AtomicU32,
    connects: AtomicU32,
    next_id: AtomicU64,
    subscriptions: Mutex<HashMap<SubscriptionId, Arc<AtomicBool>>>,
}

/// Simulated field-bus client backed by an in-memory value map.
#[derive(Clone, Default)]
pub struct SimFieldClient {
    state: Arc<SimState>,
}

impl SimFieldClient {
    /// Simulator with an empty address space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulator pre-seeded with address/value pairs.
    #[must_use]
    pub fn with_values(values: impl IntoIterator<Item = (String, TagValue)>) -> Self {
        let client = Self::new();
        *client.state.values.lock().expect("sim values lock") = values.into_iter().collect();
        client
    }

    /// Mutate a value from the device side; subscribers see it on the next
    /// sampling tick.
    pub fn set(&self, address: &str, value: TagValue) {
        self.state
            .values
            .lock()
            .expect("sim values lock")
            .insert(address.to_string(), value);
    }

    /// Current value at an address, ignoring connection state.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<TagValue> {
        self.state
            .values
            .lock()
            .expect("sim values lock")
            .get(address)
            .cloned()
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.state.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Total connect attempts observed, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Drop all subscriptions server-side, simulating an expired session.
    pub fn expire_subscriptions(&self) {
        for flag in self
            .state
            .subscriptions
            .lock()
            .expect("sim subscriptions lock")
            .values()
        {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl FieldClient for SimFieldClient {
    async fn connect(&self) -> Result<(), FieldError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let remaining = self.state.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(FieldError::Connection(
                "injected connect failure".to_string(),
            ));
        }
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        self.expire_subscriptions();
    }

    async fn read(&self, address: &str) -> Result<TagValue, FieldError> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(FieldError::NotConnected);
        }
        self.get(address)
            .ok_or_else(|| FieldError::AddressNotFound(address.to_string()))
    }

    async fn write(&self, address: &str, value: TagValue) -> Result<(), FieldError> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(FieldError::NotConnected);
        }
        let mut values = self.state.values.lock().expect("sim values lock");
        if !values.contains_key(address) {
            return Err(FieldError::AddressNotFound(address.to_string()));
        }
        values.insert(address.to_string(), value);
        Ok(())
    }

    async fn subscribe(
        &self,
        addresses: Vec<String>,
        sampling_interval: Duration,
        sink: mpsc::Sender<TagChange>,
    ) -> Result<SubscriptionId, FieldError> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(FieldError::NotConnected);
        }

        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        self.state
            .subscriptions
            .lock()
            .expect("sim subscriptions lock")
            .insert(id, Arc::clone(&alive));

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sampling_interval);
            let mut last: HashMap<String, TagValue> = HashMap::new();
            loop {
                ticker.tick().await;
                if !alive.load(Ordering::SeqCst) || !state.connected.load(Ordering::SeqCst) {
                    break;
                }
                let changes: Vec<TagChange> = {
                    let values = state.values.lock().expect("sim values lock");
                    addresses
                        .iter()
                        .filter_map(|address| {
                            let value = values.get(address)?;
                            if last.get(address) == Some(value) {
                                return None;
                            }
                            last.insert(address.clone(), value.clone());
                            Some(TagChange {
                                address: address.clone(),
                                value: value.clone(),
                                timestamp: Utc::now(),
                            })
                        })
                        .collect()
                };
                for change in changes {
                    if sink.send(change).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(id)
    }

    async fn subscription_alive(&self, id: SubscriptionId) -> Result<bool, FieldError> {
        if !self.state.connected.load(Ordering::SeqCst) {
            return Err(FieldError::NotConnected);
        }
        Ok(self
            .state
            .subscriptions
            .lock()
            .expect("sim subscriptions lock")
            .get(&id)
            .is_some_and(|flag| flag.load(Ordering::SeqCst)))
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(flag) = self
            .state
            .subscriptions
            .lock()
            .expect("sim subscriptions lock")
            .remove(&id)
        {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_requires_connection_and_known_address() {
        let sim = SimFieldClient::with_values([("a".to_string(), TagValue::Integer(1))]);

        assert!(matches!(sim.read("a").await, Err(FieldError::NotConnected)));

        sim.connect().await.unwrap();
        assert_eq!(sim.read("a").await.unwrap(), TagValue::Integer(1));
        assert!(matches!(
            sim.read("missing").await,
            Err(FieldError::AddressNotFound(_))
        ));
    }

    #[tokio::test]
    async fn subscription_delivers_initial_value_and_changes_only() {
        let sim = SimFieldClient::with_values([("a".to_string(), TagValue::Integer(1))]);
        sim.connect().await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        sim.subscribe(vec!["a".to_string()], Duration::from_millis(5), tx)
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("initial value")
            .unwrap();
        assert_eq!(first.value, TagValue::Integer(1));

        sim.set("a", TagValue::Integer(2));
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("changed value")
            .unwrap();
        assert_eq!(second.value, TagValue::Integer(2));

        // Unchanged value produces no further deliveries.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn expired_subscription_reports_dead() {
        let sim = SimFieldClient::with_values([("a".to_string(), TagValue::Integer(1))]);
        sim.connect().await.unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let id = sim
            .subscribe(vec!["a".to_string()], Duration::from_millis(5), tx)
            .await
            .unwrap();

        assert!(sim.subscription_alive(id).await.unwrap());
        sim.expire_subscriptions();
        assert!(!sim.subscription_alive(id).await.unwrap());
    }

    #[tokio::test]
    async fn injected_connect_failures_are_consumed() {
        let sim = SimFieldClient::new();
        sim.fail_next_connects(2);

        assert!(sim.connect().await.is_err());
        assert!(sim.connect().await.is_err());
        assert!(sim.connect().await.is_ok());
        assert_eq!(sim.connect_attempts(), 3);
    }
}
