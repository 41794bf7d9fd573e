//! Generic reconnect/backoff supervision for a connect/disconnect pair.
//!
//! Used by both sides of the bridge: `connect` drives a bounded number of
//! attempts with exponential backoff, while the background reconnection
//! task retries indefinitely at the capped backoff until connected or
//! stopped. Outbound messages accepted while disconnected land in a
//! bounded drop-oldest buffer and are replayed after reconnection, minus
//! anything older than the staleness cutoff.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

/// Backoff and retry policy.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on the doubling delay
    pub max_delay: Duration,
    /// Attempts per explicit `connect` call
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the given zero-based failed attempt: doubles from the
    /// initial delay, capped at the maximum.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        let delay = self.initial_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// Buffer limits for messages accepted while disconnected.
#[derive(Debug, Clone)]
pub struct BufferPolicy {
    /// Maximum buffered entries; the oldest is dropped on overflow
    pub capacity: usize,
    /// Buffered messages older than this are discarded at replay time
    pub staleness: Duration,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            capacity: 1000,
            staleness: Duration::from_secs(300),
        }
    }
}

struct SupervisorState<M> {
    name: String,
    buffer_policy: BufferPolicy,
    connected: AtomicBool,
    last_connected: Mutex<Option<DateTime<Utc>>>,
    buffer: Mutex<VecDeque<(DateTime<Utc>, M)>>,
}

impl<M> SupervisorState<M> {
    fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
        *self.last_connected.lock().expect("last_connected lock") = Some(Utc::now());
        tracing::info!(link = %self.name, "Connected");
    }

    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::warn!(link = %self.name, "Disconnected");
        }
    }
}

/// Reconnect/backoff wrapper around any connect/disconnect pair.
///
/// Generic over the buffered outbound message type `M`.
pub struct ConnectionSupervisor<M> {
    state: Arc<SupervisorState<M>>,
    policy: BackoffPolicy,
    stop_tx: watch::Sender<bool>,
    reconnect_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl<M: Send + 'static> ConnectionSupervisor<M> {
    /// Create a supervisor for the named link.
    #[must_use]
    pub fn new(name: impl Into<String>, policy: BackoffPolicy, buffer_policy: BufferPolicy) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(SupervisorState {
                name: name.into(),
                buffer_policy,
                connected: AtomicBool::new(false),
                last_connected: Mutex::new(None),
                buffer: Mutex::new(VecDeque::new()),
            }),
            policy,
            stop_tx,
            reconnect_task: AsyncMutex::new(None),
        }
    }

    /// Whether the supervised link is currently connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    /// Timestamp of the last successful connection, if any.
    #[must_use]
    pub fn last_connected_at(&self) -> Option<DateTime<Utc>> {
        *self.state.last_connected.lock().expect("last_connected lock")
    }

    /// Record a successful connection.
    pub fn mark_connected(&self) {
        self.state.mark_connected();
    }

    /// Record a connection loss.
    pub fn mark_disconnected(&self) {
        self.state.mark_disconnected();
    }

    /// Drive connection attempts until success or retry exhaustion.
    ///
    /// Blocks the calling task, logging each failed attempt; returns
    /// whether the link came up. A concurrent `stop_reconnection` aborts
    /// the attempt sequence early.
    pub async fn connect<F, Fut>(&self, connect_fn: F) -> bool
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut stop_rx = self.stop_tx.subscribe();

        for attempt in 0..self.policy.max_retries {
            if *stop_rx.borrow() {
                return false;
            }

            tracing::info!(
                link = %self.state.name,
                attempt = attempt + 1,
                max = self.policy.max_retries,
                "Connection attempt"
            );
            if connect_fn().await {
                self.state.mark_connected();
                return true;
            }
            tracing::warn!(
                link = %self.state.name,
                attempt = attempt + 1,
                "Connection attempt failed"
            );

            if attempt + 1 < self.policy.max_retries {
                let delay = self.policy.delay(attempt);
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = stop_rx.changed() => return false,
                }
            }
        }

        tracing::error!(
            link = %self.state.name,
            attempts = self.policy.max_retries,
            "Failed to connect after retry exhaustion"
        );
        false
    }

    /// Start the background reconnection task if it is not already running.
    ///
    /// The task retries indefinitely at the capped backoff until connected
    /// or stopped, checking the stop signal between attempts.
    pub async fn start_reconnection<F, Fut>(&self, connect_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send,
    {
        let mut task = self.reconnect_task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        if self.state.connected.load(Ordering::SeqCst) {
            return;
        }

        let _ = self.stop_tx.send(false);
        let mut stop_rx = self.stop_tx.subscribe();
        let state = Arc::clone(&self.state);
        let policy = self.policy.clone();

        tracing::info!(link = %state.name, "Starting reconnection task");
        let handle = tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                if *stop_rx.borrow() {
                    tracing::info!(link = %state.name, "Reconnection task stopped");
                    return;
                }
                if connect_fn().await {
                    state.mark_connected();
                    tracing::info!(link = %state.name, "Reconnection succeeded");
                    return;
                }
                let delay = policy.delay(attempt);
                attempt = attempt.saturating_add(1);
                tracing::warn!(
                    link = %state.name,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnection attempt failed"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    _ = stop_rx.changed() => {}
                }
            }
        });
        *task = Some(handle);
    }

    /// Stop the reconnection task and await its prompt termination.
    pub async fn stop_reconnection(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.reconnect_task.lock().await.take() {
            let _ = handle.await;
        }
        let _ = self.stop_tx.send(false);
    }

    /// Buffer an outbound message accepted while disconnected.
    ///
    /// The buffer is a bounded FIFO; on overflow the oldest entry is
    /// dropped.
    pub fn buffer_message(&self, message: M) {
        let mut buffer = self.state.buffer.lock().expect("buffer lock");
        if buffer.len() >= self.state.buffer_policy.capacity {
            buffer.pop_front();
            tracing::warn!(link = %self.state.name, "Outbound buffer full, dropping oldest message");
        }
        buffer.push_back((Utc::now(), message));
    }

    /// Drain the buffer for replay, discarding entries older than the
    /// staleness cutoff.
    #[must_use]
    pub fn take_replayable(&self) -> Vec<M> {
        let now = Utc::now();
        let staleness = chrono::Duration::from_std(self.state.buffer_policy.staleness)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut buffer = self.state.buffer.lock().expect("buffer lock");
        let mut replayable = Vec::with_capacity(buffer.len());
        let mut discarded = 0usize;
        while let Some((queued_at, message)) = buffer.pop_front() {
            if now - queued_at > staleness {
                discarded += 1;
            } else {
                replayable.push(message);
            }
        }
        if discarded > 0 {
            tracing::warn!(link = %self.state.name, discarded, "Discarded stale buffered messages");
        }
        replayable
    }

    /// Number of currently buffered messages.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.state.buffer.lock().expect("buffer lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_policy(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_retries,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_retries: 5,
        };
        assert_eq!(policy.delay(0), Duration::from_secs(5));
        assert_eq!(policy.delay(1), Duration::from_secs(10));
        assert_eq!(policy.delay(2), Duration::from_secs(20));
        assert_eq!(policy.delay(3), Duration::from_secs(40));
        assert_eq!(policy.delay(4), Duration::from_secs(60));
        assert_eq!(policy.delay(10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn connect_retries_until_success() {
        let supervisor: ConnectionSupervisor<String> =
            ConnectionSupervisor::new("test", fast_policy(5), BufferPolicy::default());
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&attempts);
        let connected = supervisor
            .connect(move || {
                let counter = Arc::clone(&counter);
                async move { counter.fetch_add(1, Ordering::SeqCst) >= 2 }
            })
            .await;

        assert!(connected);
        assert!(supervisor.is_connected());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(supervisor.last_connected_at().is_some());
    }

    #[tokio::test]
    async fn connect_gives_up_after_retry_exhaustion() {
        let supervisor: ConnectionSupervisor<String> =
            ConnectionSupervisor::new("test", fast_policy(3), BufferPolicy::default());
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&attempts);
        let connected = supervisor
            .connect(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    false
                }
            })
            .await;

        assert!(!connected);
        assert!(!supervisor.is_connected());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reconnection_task_retries_beyond_connect_budget() {
        let supervisor: ConnectionSupervisor<String> = ConnectionSupervisor::new(
            "test",
            fast_policy(2),
            BufferPolicy::default(),
        );
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&attempts);
        supervisor
            .start_reconnection(move || {
                let counter = Arc::clone(&counter);
                async move { counter.fetch_add(1, Ordering::SeqCst) >= 4 }
            })
            .await;

        for _ in 0..200 {
            if supervisor.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(supervisor.is_connected());
        assert!(attempts.load(Ordering::SeqCst) >= 5);
        supervisor.stop_reconnection().await;
    }

    #[tokio::test]
    async fn stop_reconnection_halts_the_task() {
        let supervisor: ConnectionSupervisor<String> =
            ConnectionSupervisor::new("test", fast_policy(2), BufferPolicy::default());

        supervisor.start_reconnection(|| async { false }).await;
        supervisor.stop_reconnection().await;
        assert!(!supervisor.is_connected());
    }

    #[test]
    fn buffer_drops_oldest_on_overflow() {
        let supervisor: ConnectionSupervisor<u32> = ConnectionSupervisor::new(
            "test",
            fast_policy(1),
            BufferPolicy {
                capacity: 3,
                staleness: Duration::from_secs(300),
            },
        );

        for n in 0..5 {
            supervisor.buffer_message(n);
        }
        assert_eq!(supervisor.buffered(), 3);
        assert_eq!(supervisor.take_replayable(), vec![2, 3, 4]);
        assert_eq!(supervisor.buffered(), 0);
    }

    #[test]
    fn replay_discards_stale_messages() {
        let supervisor: ConnectionSupervisor<u32> = ConnectionSupervisor::new(
            "test",
            fast_policy(1),
            BufferPolicy {
                capacity: 10,
                staleness: Duration::from_millis(0),
            },
        );

        supervisor.buffer_message(1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(supervisor.take_replayable().is_empty());
    }
}
