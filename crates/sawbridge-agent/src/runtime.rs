//! Bridge runtime orchestration.
//!
//! The orchestrator owns both links and every long-lived task. Commands are
//! drained by a single consumer, so execution order is exactly arrival
//! order. All tasks watch one stop channel; `stop()` signals it, awaits
//! every task, and tears both links down.

use crate::config::BridgeConfig;
use crate::executor::CommandExecutor;
use crate::link::{BufferedPublish, LinkError, MessageBusLink};
use crate::supervisor::{BackoffPolicy, BufferPolicy, ConnectionSupervisor};
use chrono::Utc;
use sawbridge_core::{
    Alarm, Command, CommandResult, ProcessedMetrics, Quantity, TagTable, TagTableError,
    TelemetryAggregator,
};
use sawbridge_fieldbus::{FieldBusSession, FieldClient, SessionConfig};
use sawbridge_proto::{StatusMessage, TagUpdateMessage, TopicScheme};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lifecycle state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Not running
    Stopped,
    /// `start()` in progress
    Starting,
    /// All tasks running
    Running,
    /// `stop()` in progress
    Stopping,
}

/// Errors for bridge lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Tag table is inconsistent
    #[error(transparent)]
    TagTable(#[from] TagTableError),
    /// Message-bus configuration or subscription failure
    #[error(transparent)]
    Link(#[from] LinkError),
    /// Field device unreachable after retry exhaustion
    #[error("field device unreachable")]
    FieldUnavailable,
    /// Broker unreachable within the startup deadline
    #[error("message broker unreachable")]
    BusUnavailable,
    /// `start()` called while not stopped
    #[error("bridge is not stopped")]
    NotStopped,
}

/// Top-level runtime tying the field session, the bus link, the executor,
/// and the telemetry aggregator together.
pub struct BridgeOrchestrator {
    config: BridgeConfig,
    scheme: TopicScheme,
    session: Arc<FieldBusSession>,
    field_supervisor: Arc<ConnectionSupervisor<()>>,
    bus_supervisor: Arc<ConnectionSupervisor<BufferedPublish>>,
    executor: Arc<CommandExecutor>,
    aggregator: Arc<Mutex<TelemetryAggregator>>,
    link: Mutex<Option<Arc<MessageBusLink>>>,
    state: Mutex<BridgeState>,
    stop_tx: Mutex<watch::Sender<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeOrchestrator {
    /// Build the orchestrator over the given protocol client.
    ///
    /// # Errors
    ///
    /// Returns error if the configured tag table is inconsistent.
    pub fn new(
        config: BridgeConfig,
        client: Arc<dyn FieldClient>,
    ) -> Result<Arc<Self>, BridgeError> {
        let tags = TagTable::new(config.tags.clone())?;
        let session = FieldBusSession::new(
            client,
            tags,
            SessionConfig {
                sampling_interval: config.fieldbus.sampling_interval,
                op_timeout: config.fieldbus.op_timeout,
                critical_tags: config.fieldbus.critical_tags.clone(),
            },
        );

        let backoff = BackoffPolicy {
            initial_delay: config.reconnect.initial_backoff,
            max_delay: config.reconnect.max_backoff,
            max_retries: config.reconnect.max_retries,
        };
        let buffer = BufferPolicy {
            capacity: config.reconnect.buffer_size,
            staleness: config.reconnect.staleness,
        };

        let window = chrono::Duration::from_std(config.telemetry_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let aggregator = Arc::new(Mutex::new(TelemetryAggregator::new(window, Utc::now())));

        let executor = Arc::new(CommandExecutor::new(
            Arc::clone(&session),
            config.max_cutting_speed,
        ));

        let (stop_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            scheme: TopicScheme::new(&config.machine_id),
            session,
            field_supervisor: Arc::new(ConnectionSupervisor::new(
                "fieldbus",
                backoff.clone(),
                BufferPolicy::default(),
            )),
            bus_supervisor: Arc::new(ConnectionSupervisor::new("mqtt", backoff, buffer)),
            executor,
            aggregator,
            link: Mutex::new(None),
            state: Mutex::new(BridgeState::Stopped),
            stop_tx: Mutex::new(stop_tx),
            tasks: Mutex::new(Vec::new()),
            config,
        }))
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BridgeState {
        *self.state.lock().expect("state lock")
    }

    /// Bring both links up and spawn every runtime task.
    ///
    /// # Errors
    ///
    /// Returns error if either link fails to come up within its startup
    /// budget; the partial startup is torn down before returning.
    pub async fn start(self: &Arc<Self>) -> Result<(), BridgeError> {
        {
            let mut state = self.state.lock().expect("state lock");
            if *state != BridgeState::Stopped {
                return Err(BridgeError::NotStopped);
            }
            *state = BridgeState::Starting;
        }
        tracing::info!(machine = %self.config.machine_id, "Starting bridge");

        let (stop_tx, _) = watch::channel(false);
        *self.stop_tx.lock().expect("stop lock") = stop_tx.clone();

        // Observers must be registered before the field session connects:
        // the subscription delivers initial values immediately, and samples
        // produced while the bus side is still coming up must not bypass
        // the aggregator.
        self.spawn_sample_feed("power_consumption", Quantity::PowerConsumption, &stop_tx);
        self.spawn_sample_feed("cutting_speed", Quantity::CuttingSpeed, &stop_tx);
        self.spawn_sample_feed("pieces_count", Quantity::PiecesCount, &stop_tx);
        self.spawn_activity_feed(&stop_tx);

        // Field side first; without the device there is nothing to bridge.
        let session = Arc::clone(&self.session);
        let field_up = self
            .field_supervisor
            .connect(|| {
                let session = Arc::clone(&session);
                async move {
                    match session.connect().await {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::error!(error = %e, "Field connect failed");
                            false
                        }
                    }
                }
            })
            .await;
        if !field_up {
            self.teardown().await;
            return Err(BridgeError::FieldUnavailable);
        }

        // Bus side: create the link, drive its event loop, and wait for the
        // first ConnAck within the same retry budget the field side gets.
        let client_id = format!("sawbridge-{}-{}", self.config.machine_id, Uuid::new_v4());
        let link = match MessageBusLink::new(
            &self.config.bus.broker,
            &client_id,
            self.config.bus.keep_alive,
            self.config.bus.publish_timeout,
            self.scheme.clone(),
            Arc::clone(&self.bus_supervisor),
        ) {
            Ok((link, eventloop)) => {
                let link = Arc::new(link);
                let (commands_tx, commands_rx) = mpsc::unbounded_channel();
                self.spawn(
                    Arc::clone(&link)
                        .run_event_pump(eventloop, commands_tx, stop_tx.subscribe()),
                );
                self.spawn_command_drain(Arc::clone(&link), commands_rx, &stop_tx);
                link
            }
            Err(e) => {
                self.teardown().await;
                return Err(e.into());
            }
        };
        *self.link.lock().expect("link lock") = Some(Arc::clone(&link));

        let startup_budget = self
            .config
            .reconnect
            .initial_backoff
            .saturating_mul(self.config.reconnect.max_retries.max(1));
        if !wait_connected(&link, startup_budget).await {
            tracing::error!("Broker unreachable within startup budget");
            self.teardown().await;
            return Err(BridgeError::BusUnavailable);
        }
        if let Err(e) = link.subscribe_channels().await {
            self.teardown().await;
            return Err(e.into());
        }

        self.spawn_tag_mirror(Arc::clone(&link), &stop_tx);
        self.spawn_status_loop(Arc::clone(&link), &stop_tx);
        self.spawn_alarm_loop(Arc::clone(&link), &stop_tx);
        self.spawn_health_loop(&stop_tx);

        *self.state.lock().expect("state lock") = BridgeState::Running;
        tracing::info!("Bridge running");
        Ok(())
    }

    /// Stop every task and disconnect both links. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().expect("state lock");
            match *state {
                BridgeState::Stopped | BridgeState::Stopping => return,
                BridgeState::Starting | BridgeState::Running => *state = BridgeState::Stopping,
            }
        }
        tracing::info!("Stopping bridge");
        self.teardown().await;
    }

    async fn teardown(&self) {
        let stop_tx = self.stop_tx.lock().expect("stop lock").clone();
        let _ = stop_tx.send(true);

        // Runtime tasks first: the status loop may arm a reconnection task
        // right up until it observes the stop signal, so the supervisors
        // must be stopped only after every task has exited.
        let tasks: Vec<JoinHandle<()>> =
            self.tasks.lock().expect("tasks lock").drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.field_supervisor.stop_reconnection().await;
        self.bus_supervisor.stop_reconnection().await;

        self.session.disconnect().await;
        self.bus_supervisor.mark_disconnected();
        *self.link.lock().expect("link lock") = None;
        *self.state.lock().expect("state lock") = BridgeState::Stopped;
        tracing::info!("Bridge stopped");
    }

    /// Current machine status (collaborator API).
    #[must_use]
    pub fn status(&self) -> StatusMessage {
        StatusMessage::from_snapshot(&self.session.snapshot(), Utc::now())
    }

    /// Execute a command directly (collaborator API).
    ///
    /// Bypasses the bus but not the alarm gate or transition rules; results
    /// are identical to control-topic execution.
    pub async fn execute_command(&self, command: &Command) -> CommandResult {
        self.executor.execute(command).await
    }

    /// Snapshot of all active alarms, oldest first (collaborator API).
    #[must_use]
    pub fn alarms(&self) -> Vec<Alarm> {
        self.executor.active_alarms()
    }

    /// Acknowledge an active alarm (collaborator API).
    pub fn acknowledge_alarm(&self, code: &str) -> bool {
        self.executor.acknowledge_alarm(code)
    }

    /// Metrics over the current sliding window (collaborator API).
    #[must_use]
    pub fn metrics(&self) -> ProcessedMetrics {
        self.aggregator
            .lock()
            .expect("aggregator lock")
            .compute(Utc::now())
    }

    /// Clear every window and restart downtime accounting (collaborator API).
    pub fn reset_metrics(&self) {
        self.aggregator
            .lock()
            .expect("aggregator lock")
            .reset(Utc::now());
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        self.tasks
            .lock()
            .expect("tasks lock")
            .push(tokio::spawn(task));
    }

    fn spawn_command_drain(
        &self,
        link: Arc<MessageBusLink>,
        mut commands_rx: mpsc::UnboundedReceiver<Command>,
        stop_tx: &watch::Sender<bool>,
    ) {
        let executor = Arc::clone(&self.executor);
        let mut stop_rx = stop_tx.subscribe();
        self.spawn(async move {
            loop {
                tokio::select! {
                    command = commands_rx.recv() => match command {
                        Some(command) => {
                            let result = executor.execute(&command).await;
                            tracing::info!(
                                command = result.command,
                                success = result.success,
                                "Command executed"
                            );
                            link.publish_result(&result).await;
                        }
                        None => break,
                    },
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_sample_feed(&self, tag: &str, quantity: Quantity, stop_tx: &watch::Sender<bool>) {
        let mut updates = self.session.observe(tag);
        let aggregator = Arc::clone(&self.aggregator);
        let mut stop_rx = stop_tx.subscribe();
        self.spawn(async move {
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Some(update) => {
                            if let Some(value) = update.value.as_f64() {
                                aggregator
                                    .lock()
                                    .expect("aggregator lock")
                                    .record_sample(quantity, update.timestamp, value);
                            }
                        }
                        None => break,
                    },
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_activity_feed(&self, stop_tx: &watch::Sender<bool>) {
        let mut updates = self.session.observe("is_active");
        let aggregator = Arc::clone(&self.aggregator);
        let mut stop_rx = stop_tx.subscribe();
        self.spawn(async move {
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Some(update) => {
                            if let Some(active) = update.value.as_bool() {
                                aggregator
                                    .lock()
                                    .expect("aggregator lock")
                                    .record_activity(update.timestamp, active);
                            }
                        }
                        None => break,
                    },
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_tag_mirror(&self, link: Arc<MessageBusLink>, stop_tx: &watch::Sender<bool>) {
        let Some(mut updates) = self.session.take_outbound() else {
            tracing::warn!("Outbound tag queue already taken, mirror task not started");
            return;
        };
        let mut stop_rx = stop_tx.subscribe();
        self.spawn(async move {
            loop {
                tokio::select! {
                    update = updates.recv() => match update {
                        Some(update) => {
                            let message = TagUpdateMessage::new(
                                update.value,
                                update.unit,
                                update.timestamp,
                            );
                            link.publish_tag(&update.name, &message).await;
                        }
                        None => break,
                    },
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_status_loop(&self, link: Arc<MessageBusLink>, stop_tx: &watch::Sender<bool>) {
        let session = Arc::clone(&self.session);
        let field_supervisor = Arc::clone(&self.field_supervisor);
        let mut stop_rx = stop_tx.subscribe();
        self.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        session.set_bus_connected(link.is_connected());
                        let status =
                            StatusMessage::from_snapshot(&session.snapshot(), Utc::now());
                        link.publish_status(&status).await;

                        if !session.is_connected() {
                            field_supervisor.mark_disconnected();
                            let session = Arc::clone(&session);
                            field_supervisor
                                .start_reconnection(move || {
                                    let session = Arc::clone(&session);
                                    async move { session.connect().await.is_ok() }
                                })
                                .await;
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_alarm_loop(&self, link: Arc<MessageBusLink>, stop_tx: &watch::Sender<bool>) {
        let session = Arc::clone(&self.session);
        let executor = Arc::clone(&self.executor);
        let mut stop_rx = stop_tx.subscribe();
        self.spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if executor.sync_with_snapshot(&session.snapshot()) {
                            link.publish_alarms(&executor.active_alarms()).await;
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_health_loop(&self, stop_tx: &watch::Sender<bool>) {
        let session = Arc::clone(&self.session);
        let interval = self.config.fieldbus.health_check_interval;
        let mut stop_rx = stop_tx.subscribe();
        self.spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        match session.check_subscription_health().await {
                            Ok(false) => {}
                            Ok(true) => {
                                tracing::warn!("Subscription was dead and has been recreated");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "Subscription health check failed");
                            }
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

async fn wait_connected(link: &MessageBusLink, budget: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if link.is_connected() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    link.is_connected()
}
