//! Transport layer for device presence
//!
//! Two boundaries live here. [`Transport`] and [`ServerTransport`] are what
//! device handles and the presence manager talk to. [`BrokerClient`] and
//! [`EventSource`] are what the transport itself needs from an MQTT client, so
//! the supervisor can be driven by rumqttc in production and by
//! [`crate::testing`] doubles in tests.

use crate::device::DeviceState;
use bytes::Bytes;
use tokio::sync::mpsc;

pub mod mqtt;

pub use mqtt::{MqttError, MqttTransport};

/// Device-facing transport used by both roles
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Fire-and-forget publish
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<(), MqttError>;

    /// Publish a device announcement (retained) under the announce topic
    async fn publish_meta(&self, device_topic: &str, payload: Bytes) -> Result<(), MqttError>;

    /// Subscribe to an exact topic. The stream closes on unsubscribe or shutdown.
    async fn subscribe(&self, topic: &str) -> mpsc::Receiver<Bytes>;

    /// Subscribe to a pattern that may contain `+` and `#`
    async fn subscribe_raw(&self, pattern: &str) -> mpsc::Receiver<mqtt::Packet>;

    /// Drop every local listener of `topic`; returns whether any existed
    async fn unsubscribe(&self, topic: &str) -> bool;

    /// Move every listener of `old_topic` over to `new_topic`
    async fn resubscribe(&self, old_topic: &str, new_topic: &str) -> bool;

    /// Stream of discover trigger payloads
    async fn discover(&self) -> mpsc::Receiver<Bytes>;

    /// The will-ID this connection's last will publishes
    fn last_will_id(&self) -> String;
}

/// Transport additions needed by the observing side
#[async_trait::async_trait]
pub trait ServerTransport: Transport {
    /// Start the discovery protocol and hand out its event stream.
    ///
    /// Can be called once per transport; later calls fail with
    /// [`MqttError::AlreadyInitialized`].
    async fn device_state(&self) -> Result<mpsc::Receiver<DeviceState>, MqttError>;
}

/// Outbound half of an MQTT client
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<(), MqttError>;
    async fn subscribe(&self, topic: &str) -> Result<(), MqttError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError>;
    /// Tear the connection down; `force` skips waiting for the request queue
    async fn destroy(&self, force: bool) -> Result<(), MqttError>;
}

/// Inbound half of an MQTT client
#[async_trait::async_trait]
pub trait EventSource: Send {
    /// Wait for the next connection event.
    ///
    /// Calling this again after a [`mqtt::EventRoute::ConnectionError`] starts
    /// a new connection attempt.
    async fn next_route(&mut self) -> mqtt::EventRoute;
}
