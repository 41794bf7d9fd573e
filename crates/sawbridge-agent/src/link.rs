//! Message-bus link: MQTT publishing, subscriptions, and the event pump.
//!
//! Publishing is soft-fail: while the broker is unreachable, outbound
//! payloads are handed to the connection supervisor's bounded buffer and
//! replayed (minus stale entries) on the next `ConnAck`. The last will is
//! a retained offline marker on the status topic, so consumers see an
//! ungraceful death without polling.

use crate::supervisor::ConnectionSupervisor;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use sawbridge_core::{Alarm, Command, CommandResult};
use sawbridge_proto::{
    alarms_payload, offline_status_payload, CommandResultMessage, ControlMessage, StatusMessage,
    TagUpdateMessage, TopicKind, TopicScheme,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use url::Url;

/// An outbound payload held back while the broker is unreachable.
#[derive(Debug, Clone)]
pub struct BufferedPublish {
    /// Destination topic
    pub topic: String,
    /// Serialized payload
    pub payload: Vec<u8>,
    /// MQTT retain flag
    pub retain: bool,
}

/// MQTT link for the bridge.
pub struct MessageBusLink {
    client: AsyncClient,
    scheme: TopicScheme,
    supervisor: Arc<ConnectionSupervisor<BufferedPublish>>,
    publish_timeout: Duration,
}

impl MessageBusLink {
    /// Create the link and its event loop.
    ///
    /// Registers a retained `{"status": "offline"}` last will on the status
    /// topic. The returned event loop must be driven by
    /// [`run_event_pump`](Self::run_event_pump) for the link to make
    /// progress.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL cannot be parsed.
    pub fn new(
        mqtt_broker: &str,
        client_id: &str,
        keep_alive: Duration,
        publish_timeout: Duration,
        scheme: TopicScheme,
        supervisor: Arc<ConnectionSupervisor<BufferedPublish>>,
    ) -> Result<(Self, EventLoop), LinkError> {
        let (host, port) = parse_mqtt_url(mqtt_broker)?;

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options.set_keep_alive(keep_alive);
        mqtt_options.set_last_will(LastWill::new(
            scheme.status(),
            offline_status_payload(),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        Ok((
            Self {
                client,
                scheme,
                supervisor,
                publish_timeout,
            },
            eventloop,
        ))
    }

    /// Whether the broker session is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.supervisor.is_connected()
    }

    /// Topic scheme in use.
    #[must_use]
    pub fn scheme(&self) -> &TopicScheme {
        &self.scheme
    }

    /// Subscribe to the inbound channels (control and config).
    ///
    /// # Errors
    ///
    /// Returns error if either subscription is refused.
    pub async fn subscribe_channels(&self) -> Result<(), LinkError> {
        for topic in [self.scheme.control(), self.scheme.config()] {
            tracing::info!(topic, "Subscribing to inbound topic");
            self.client
                .subscribe(&topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| LinkError::Subscribe(e.to_string()))?;
        }
        Ok(())
    }

    /// Publish a payload, buffering it instead when the broker is down.
    ///
    /// Returns whether the payload was handed to the broker session now;
    /// `false` means it was buffered for replay.
    pub async fn publish(&self, topic: String, payload: Vec<u8>, retain: bool) -> bool {
        if !self.supervisor.is_connected() {
            tracing::debug!(topic, "Broker down, buffering payload");
            self.supervisor.buffer_message(BufferedPublish {
                topic,
                payload,
                retain,
            });
            return false;
        }

        let publish = self
            .client
            .publish(&topic, QoS::AtLeastOnce, retain, payload.clone());
        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!(topic, error = %e, "Publish failed, buffering payload");
                self.supervisor.mark_disconnected();
                self.supervisor.buffer_message(BufferedPublish {
                    topic,
                    payload,
                    retain,
                });
                false
            }
            Err(_) => {
                tracing::warn!(topic, "Publish timed out, buffering payload");
                self.supervisor.mark_disconnected();
                self.supervisor.buffer_message(BufferedPublish {
                    topic,
                    payload,
                    retain,
                });
                false
            }
        }
    }

    /// Publish a periodic status message (retained).
    pub async fn publish_status(&self, status: &StatusMessage) {
        match status.to_json() {
            Ok(payload) => {
                self.publish(self.scheme.status(), payload, true).await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize status message"),
        }
    }

    /// Publish the active-alarm array (retained).
    pub async fn publish_alarms(&self, alarms: &[Alarm]) {
        match alarms_payload(alarms) {
            Ok(payload) => {
                self.publish(self.scheme.alarm(), payload, true).await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize alarm array"),
        }
    }

    /// Publish a command result.
    pub async fn publish_result(&self, result: &CommandResult) {
        match CommandResultMessage::from(result).to_json() {
            Ok(payload) => {
                self.publish(self.scheme.result(), payload, false).await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialize command result"),
        }
    }

    /// Publish a per-tag mirror update.
    pub async fn publish_tag(&self, name: &str, update: &TagUpdateMessage) {
        match update.to_json() {
            Ok(payload) => {
                self.publish(self.scheme.tag(name), payload, false).await;
            }
            Err(e) => tracing::error!(tag = name, error = %e, "Failed to serialize tag update"),
        }
    }

    /// Drive the MQTT event loop until stopped.
    ///
    /// `ConnAck` marks the link connected, re-establishes subscriptions, and
    /// replays the buffered backlog. Inbound control payloads are validated
    /// and forwarded to `commands_tx`; malformed ones are logged and
    /// dropped. Event-loop errors mark the link disconnected and back off
    /// before polling again.
    pub async fn run_event_pump(
        self: Arc<Self>,
        mut eventloop: EventLoop,
        commands_tx: mpsc::UnboundedSender<Command>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        loop {
            if *stop_rx.borrow() {
                break;
            }

            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("Broker session established");
                        self.supervisor.mark_connected();
                        if let Err(e) = self.subscribe_channels().await {
                            tracing::error!(error = %e, "Failed to re-establish subscriptions");
                        }
                        self.replay_buffered().await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_inbound(&publish.topic, &publish.payload, &commands_tx);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "MQTT event loop error");
                        self.supervisor.mark_disconnected();
                        tokio::select! {
                            () = tokio::time::sleep(Duration::from_secs(1)) => {}
                            _ = stop_rx.changed() => {}
                        }
                    }
                },
            }
        }

        tracing::info!("MQTT event pump stopped");
        let _ = self.client.disconnect().await;
    }

    async fn replay_buffered(&self) {
        let backlog = self.supervisor.take_replayable();
        if backlog.is_empty() {
            return;
        }
        tracing::info!(count = backlog.len(), "Replaying buffered payloads");
        for entry in backlog {
            if let Err(e) = self
                .client
                .publish(&entry.topic, QoS::AtLeastOnce, entry.retain, entry.payload)
                .await
            {
                tracing::warn!(topic = entry.topic, error = %e, "Replay publish failed");
            }
        }
    }

    fn handle_inbound(
        &self,
        topic: &str,
        payload: &[u8],
        commands_tx: &mpsc::UnboundedSender<Command>,
    ) {
        match self.scheme.parse(topic) {
            Some(TopicKind::Control) => match ControlMessage::parse(payload) {
                Ok(command) => {
                    tracing::info!(command = command.kind(), "Received control command");
                    if commands_tx.send(command).is_err() {
                        tracing::warn!("Command channel closed, dropping control command");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping malformed control message");
                }
            },
            Some(TopicKind::Config) => {
                tracing::debug!(payload_len = payload.len(), "Config channel message");
            }
            _ => {
                tracing::trace!(topic, "Ignoring message on unhandled topic");
            }
        }
    }
}

/// Parse an MQTT broker address into host and port.
fn parse_mqtt_url(input: &str) -> Result<(String, u16), LinkError> {
    if input.contains("://") {
        let url = Url::parse(input)
            .map_err(|e| LinkError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(LinkError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| LinkError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(1883);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| LinkError::InvalidBrokerUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => 1883,
        Some(port) => port.parse().map_err(|_| {
            LinkError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'"))
        })?,
    };
    if parts.next().is_some() {
        return Err(LinkError::InvalidBrokerUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

/// Errors for message-bus operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LinkError {
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
}
