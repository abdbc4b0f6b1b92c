//! Impure I/O operations for the MQTT transport
//!
//! [`MqttTransport`] owns the broker session. Its supervisor loop polls the
//! [`EventSource`], routes messages into the [`Multiplexer`], replays every
//! subscription after each connect, retries failed connections with a fixed
//! delay and tears everything down exactly once when cancelled.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::discovery::Discovery;
use super::message_handler::{EventRoute, MessageHandler, Packet};
use super::multiplexer::Multiplexer;
use super::topic::{ProtocolTopics, TopicKind};
use crate::config::PresenceConfig;
use crate::device::DeviceState;
use crate::error::PresenceResult;
use crate::transport::{BrokerClient, EventSource, ServerTransport, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of rumqttc's request channel
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// MQTT transport with discovery and a connection supervisor
pub struct MqttTransport {
    will_id: String,
    topics: ProtocolTopics,
    reconnect: ReconnectConfig,
    broker: Arc<dyn BrokerClient>,
    events: Mutex<Option<Box<dyn EventSource>>>,
    mux: Arc<Multiplexer>,
    discovery: Arc<Discovery>,
    state_tx: watch::Sender<ConnectionState>,
    torn_down: AtomicBool,
}

impl MqttTransport {
    /// Build a transport backed by rumqttc
    pub fn new(config: PresenceConfig) -> PresenceResult<Self> {
        config.validate()?;
        let will_id = config.resolve_client_id();
        let mqtt_options = configure_mqtt_options(&will_id, &config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        Ok(Self::assemble(
            &config,
            will_id,
            Arc::new(RumqttcBroker::new(client)),
            Box::new(RumqttcEvents::new(event_loop)),
        ))
    }

    /// Build a transport on top of any broker client and event source
    pub fn with_broker(
        config: PresenceConfig,
        broker: Arc<dyn BrokerClient>,
        events: Box<dyn EventSource>,
    ) -> PresenceResult<Self> {
        config.validate()?;
        let will_id = config.resolve_client_id();
        Ok(Self::assemble(&config, will_id, broker, events))
    }

    fn assemble(
        config: &PresenceConfig,
        will_id: String,
        broker: Arc<dyn BrokerClient>,
        events: Box<dyn EventSource>,
    ) -> Self {
        let topics = ProtocolTopics::new(&config.topics);
        let mux = Arc::new(Multiplexer::new(broker.clone()));
        let discovery = Discovery::new(mux.clone(), topics.clone(), config.discover_delay());
        let (state_tx, _) = watch::channel(ConnectionState::Idle);

        Self {
            will_id,
            topics,
            reconnect: ReconnectConfig::from_config(config),
            broker,
            events: Mutex::new(Some(events)),
            mux,
            discovery,
            state_tx,
            torn_down: AtomicBool::new(false),
        }
    }

    /// Name of a protocol topic
    pub fn topic_name(&self, kind: TopicKind) -> &str {
        self.topics.name(kind)
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.state_tx.borrow() == ConnectionState::Connected
    }

    /// Run the connection supervisor on the current task.
    ///
    /// Returns `(false, Err(_))` when the supervisor is finished for good
    /// (cancelled, or already running elsewhere) and `(true, Err(_))` when a
    /// connection attempt failed and `retry_internally` is off; the caller may
    /// back off and call `start` again in that case.
    pub async fn start(&self, cancel: CancellationToken) -> (bool, Result<(), MqttError>) {
        let Some(mut events) = self.take_events() else {
            return (false, Err(MqttError::AlreadyRunning));
        };

        if self.torn_down.load(Ordering::SeqCst) {
            return (false, Err(MqttError::Cancelled));
        }

        let span = crate::mqtt_span!(will_id = %self.will_id, operation = "supervise");
        async {
            self.set_state(ConnectionState::Connecting);
            info!(will_id = %self.will_id, "Starting connection supervisor");

            loop {
                let route = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        self.teardown().await;
                        return (false, Err(MqttError::Cancelled));
                    }
                    route = events.next_route() => route,
                };

                let failure = match route {
                    EventRoute::ConnectionAcknowledged(status) if status.is_success() => {
                        self.on_connected();
                        None
                    }
                    EventRoute::ConnectionAcknowledged(status) => {
                        Some(MqttError::ConnectionRefused(status))
                    }
                    EventRoute::MessageReceived(packet) => {
                        // A full subscriber stream must not hold off shutdown
                        let delivered = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => false,
                            _ = self.mux.route(&packet) => true,
                        };
                        if !delivered {
                            self.teardown().await;
                            return (false, Err(MqttError::Cancelled));
                        }
                        None
                    }
                    EventRoute::Disconnected => {
                        warn!("Broker closed the session");
                        self.set_state(ConnectionState::Disconnected(
                            "disconnected by broker".to_string(),
                        ));
                        None
                    }
                    EventRoute::ConnectionError(reason) => {
                        Some(MqttError::ConnectionFailedStr(reason))
                    }
                    EventRoute::Other => None,
                };

                let Some(failure) = failure else {
                    continue;
                };

                self.set_state(ConnectionState::Disconnected(failure.to_string()));
                if cancel.is_cancelled() {
                    self.teardown().await;
                    return (false, Err(MqttError::Cancelled));
                }
                if !self.reconnect.retry_internally {
                    self.restore_events(events);
                    return (true, Err(failure));
                }

                error!(
                    "Connection failed, retrying in {}ms: {}",
                    self.reconnect.delay.as_millis(),
                    failure
                );
                if !Self::interruptible_sleep(&cancel, self.reconnect.delay).await {
                    self.teardown().await;
                    return (false, Err(MqttError::Cancelled));
                }
                self.set_state(ConnectionState::Connecting);
            }
        }
        .instrument(span)
        .await
    }

    /// Run the supervisor on a background task
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<(bool, Result<(), MqttError>)> {
        let transport = self.clone();
        tokio::spawn(async move { transport.start(cancel).await })
    }

    /// Wait until the broker session is up
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), MqttError> {
        Self::wait_for_connection_confirmation(self.connection_state(), timeout).await
    }

    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let result = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Stopped => {
                        return Err(MqttError::NotConnected {
                            state: ConnectionState::Stopped,
                        })
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match result {
            Ok(outcome) => outcome,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Sleep for `delay` unless cancelled first; false means cancelled
    async fn interruptible_sleep(cancel: &CancellationToken, delay: Duration) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Cancelled during reconnection delay, stopping");
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn on_connected(&self) {
        info!(will_id = %self.will_id, "Connected to broker");
        self.set_state(ConnectionState::Connected);

        // Replay from a separate task so the event source keeps being polled
        let broker = self.broker.clone();
        let topics = self.mux.topics();
        tokio::spawn(async move {
            Self::resubscribe_to_topics(broker.as_ref(), &topics).await;
        });

        self.discovery.on_connected();
    }

    async fn resubscribe_to_topics(broker: &dyn BrokerClient, topics: &[String]) {
        for topic in topics {
            if let Err(e) = broker.subscribe(topic).await {
                error!("Failed to re-subscribe to {}: {}", topic, e);
            } else {
                debug!(target: "mqtt_transport", "Re-subscribed to: {}", topic);
            }
        }
    }

    /// Destroy the connection and close every stream, once
    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(will_id = %self.will_id, "Shutting down transport");

        if let Err(e) = self.broker.destroy(true).await {
            warn!("Failed to destroy broker connection: {}", e);
        }
        self.discovery.close();
        self.mux.close_all();
        self.set_state(ConnectionState::Stopped);
    }

    fn take_events(&self) -> Option<Box<dyn EventSource>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn restore_events(&self, events: Box<dyn EventSource>) {
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(events);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn ensure_open(&self) -> Result<(), MqttError> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(MqttError::NotConnected {
                state: ConnectionState::Stopped,
            });
        }
        Ok(())
    }

    /// Access to the discovery layer
    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<(), MqttError> {
        self.ensure_open()?;
        self.mux.publish(topic, payload, retain).await
    }

    async fn publish_meta(&self, device_topic: &str, payload: Bytes) -> Result<(), MqttError> {
        let topic = self.topics.announce_topic(device_topic);
        Transport::publish(self, &topic, payload, true).await
    }

    async fn subscribe(&self, topic: &str) -> mpsc::Receiver<Bytes> {
        self.mux.subscribe(topic).await
    }

    async fn subscribe_raw(&self, pattern: &str) -> mpsc::Receiver<Packet> {
        self.mux.subscribe_raw(pattern).await
    }

    async fn unsubscribe(&self, topic: &str) -> bool {
        self.mux.unsubscribe(topic).await
    }

    async fn resubscribe(&self, old_topic: &str, new_topic: &str) -> bool {
        self.mux.resubscribe(old_topic, new_topic).await
    }

    async fn discover(&self) -> mpsc::Receiver<Bytes> {
        self.mux
            .subscribe(self.topics.name(TopicKind::Discover))
            .await
    }

    fn last_will_id(&self) -> String {
        self.will_id.clone()
    }
}

#[async_trait]
impl ServerTransport for MqttTransport {
    async fn device_state(&self) -> Result<mpsc::Receiver<DeviceState>, MqttError> {
        self.discovery.device_state().await
    }
}

/// [`BrokerClient`] over rumqttc's v5 client
pub struct RumqttcBroker {
    client: AsyncClient,
}

impl RumqttcBroker {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BrokerClient for RumqttcBroker {
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<(), MqttError> {
        let qos = MessageHandler::determine_qos_level(retain);
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client
            .subscribe(topic, MessageHandler::subscription_qos())
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))
    }

    async fn destroy(&self, force: bool) -> Result<(), MqttError> {
        let result = if force {
            self.client.try_disconnect()
        } else {
            self.client.disconnect().await
        };
        result.map_err(|e| MqttError::ConnectionFailed(Box::new(e)))
    }
}

/// [`EventSource`] over rumqttc's v5 event loop
pub struct RumqttcEvents {
    event_loop: EventLoop,
}

impl RumqttcEvents {
    pub fn new(event_loop: EventLoop) -> Self {
        Self { event_loop }
    }
}

#[async_trait]
impl EventSource for RumqttcEvents {
    async fn next_route(&mut self) -> EventRoute {
        match self.event_loop.poll().await {
            Ok(event) => MessageHandler::route_mqtt_event(&event),
            Err(e) => MessageHandler::route_connection_error(&e),
        }
    }
}
