//! Mock implementations for testing
//!
//! [`MockBroker`] records every broker call and can optionally behave like a
//! tiny in-memory broker: retained messages are kept, and publishes matching a
//! live subscription are looped back through an [`EventScript`].
//! [`ScriptedEvents`] is an [`EventSource`] fed from that script.
//! [`MockTransport`] skips the connection entirely: a multiplexer over a
//! [`MockBroker`], with device-state events pushed by the test.

use crate::device::DeviceState;
use crate::transport::mqtt::topic::matches;
use crate::transport::mqtt::{
    ConnectStatus, EventRoute, MqttError, Multiplexer, Packet, ProtocolTopics, TopicKind,
};
use crate::transport::{BrokerClient, EventSource, ServerTransport, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// One recorded broker call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Publish {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    Subscribe(String),
    Unsubscribe(String),
    Destroy(bool),
}

#[derive(Debug, Default)]
struct BrokerState {
    calls: Vec<BrokerCall>,
    retained: BTreeMap<String, Bytes>,
    subscriptions: Vec<String>,
}

/// Mock broker client for testing
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    loopback: Option<EventScript>,
    fail_publish: Arc<AtomicBool>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that delivers matching publishes and retained messages back
    /// through `script`
    pub fn with_loopback(script: EventScript) -> Self {
        Self {
            loopback: Some(script),
            ..Default::default()
        }
    }

    /// Make every following publish fail
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub async fn calls(&self) -> Vec<BrokerCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Number of broker subscribe calls issued for `topic`
    pub async fn subscribe_count(&self, topic: &str) -> usize {
        self.count(|call| matches!(call, BrokerCall::Subscribe(t) if t == topic))
            .await
    }

    /// Number of broker unsubscribe calls issued for `topic`
    pub async fn unsubscribe_count(&self, topic: &str) -> usize {
        self.count(|call| matches!(call, BrokerCall::Unsubscribe(t) if t == topic))
            .await
    }

    /// Every publish issued for `topic`, in order, as `(payload, retain)`
    pub async fn published_to(&self, topic: &str) -> Vec<(Bytes, bool)> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Publish {
                    topic: t,
                    payload,
                    retain,
                } if t == topic => Some((payload.clone(), *retain)),
                _ => None,
            })
            .collect()
    }

    /// Currently retained payload for `topic`
    pub async fn retained(&self, topic: &str) -> Option<Bytes> {
        self.state.lock().await.retained.get(topic).cloned()
    }

    /// Store a retained message without recording a publish call
    pub async fn seed_retained(&self, topic: &str, payload: impl Into<Bytes>) {
        self.state
            .lock()
            .await
            .retained
            .insert(topic.to_string(), payload.into());
    }

    async fn count(&self, predicate: impl Fn(&BrokerCall) -> bool) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<(), MqttError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed("mock publish failure".into()));
        }

        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::Publish {
            topic: topic.to_string(),
            payload: payload.clone(),
            retain,
        });
        if retain {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(topic.to_string(), payload.clone());
            }
        }

        if let Some(script) = &self.loopback {
            if state.subscriptions.iter().any(|filter| matches(topic, filter)) {
                script.message(topic, payload, false);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::Subscribe(topic.to_string()));
        if !state.subscriptions.iter().any(|filter| filter == topic) {
            state.subscriptions.push(topic.to_string());
        }

        if let Some(script) = &self.loopback {
            for (retained_topic, payload) in &state.retained {
                if matches(retained_topic, topic) {
                    script.message(retained_topic, payload.clone(), true);
                }
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::Unsubscribe(topic.to_string()));
        state.subscriptions.retain(|filter| filter != topic);
        Ok(())
    }

    async fn destroy(&self, force: bool) -> Result<(), MqttError> {
        let mut state = self.state.lock().await;
        state.calls.push(BrokerCall::Destroy(force));
        state.subscriptions.clear();
        Ok(())
    }
}

/// Sending side of a [`ScriptedEvents`] source
#[derive(Debug, Clone)]
pub struct EventScript {
    tx: mpsc::UnboundedSender<EventRoute>,
}

impl EventScript {
    pub fn push(&self, route: EventRoute) {
        let _ = self.tx.send(route);
    }

    /// Successful connection acknowledgement
    pub fn connack(&self) {
        self.push(EventRoute::ConnectionAcknowledged(ConnectStatus::success()));
    }

    pub fn refused(&self, detail: &str) {
        self.push(EventRoute::ConnectionAcknowledged(ConnectStatus::refused(
            detail,
        )));
    }

    pub fn message(&self, topic: &str, payload: impl Into<Bytes>, retain: bool) {
        self.push(EventRoute::MessageReceived(Packet::new(
            topic, payload, retain,
        )));
    }

    pub fn connection_error(&self, reason: &str) {
        self.push(EventRoute::ConnectionError(reason.to_string()));
    }

    pub fn disconnected(&self) {
        self.push(EventRoute::Disconnected);
    }
}

/// Event source replaying whatever is pushed through its [`EventScript`].
///
/// Once the script is exhausted and every script handle is dropped, the source
/// idles forever, like a connection with no traffic.
#[derive(Debug)]
pub struct ScriptedEvents {
    rx: mpsc::UnboundedReceiver<EventRoute>,
}

impl ScriptedEvents {
    pub fn new() -> (Self, EventScript) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, EventScript { tx })
    }
}

#[async_trait]
impl EventSource for ScriptedEvents {
    async fn next_route(&mut self) -> EventRoute {
        match self.rx.recv().await {
            Some(route) => route,
            None => std::future::pending().await,
        }
    }
}

/// Transport over a bare multiplexer, for testing device handles and the
/// presence manager without a supervisor
pub struct MockTransport {
    mux: Multiplexer,
    topics: ProtocolTopics,
    will_id: String,
    states: std::sync::Mutex<Option<mpsc::Receiver<DeviceState>>>,
    state_tx: mpsc::Sender<DeviceState>,
}

impl MockTransport {
    pub fn new(broker: Arc<MockBroker>) -> Self {
        let (state_tx, state_rx) = mpsc::channel(32);
        Self {
            mux: Multiplexer::new(broker),
            topics: ProtocolTopics::default(),
            will_id: "mock-will".to_string(),
            states: std::sync::Mutex::new(Some(state_rx)),
            state_tx,
        }
    }

    /// Deliver an inbound message as if it came from the broker
    pub async fn inject(&self, topic: &str, payload: impl Into<Bytes>, retain: bool) {
        self.mux.route(&Packet::new(topic, payload, retain)).await;
    }

    /// Sender feeding the device-state stream
    pub fn state_sender(&self) -> mpsc::Sender<DeviceState> {
        self.state_tx.clone()
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.mux.listener_count(topic)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<(), MqttError> {
        self.mux.publish(topic, payload, retain).await
    }

    async fn publish_meta(&self, device_topic: &str, payload: Bytes) -> Result<(), MqttError> {
        self.mux
            .publish(&self.topics.announce_topic(device_topic), payload, true)
            .await
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
impl ServerTransport for MockTransport {
    async fn device_state(&self) -> Result<mpsc::Receiver<DeviceState>, MqttError> {
        self.states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or(MqttError::AlreadyInitialized)
    }
}
