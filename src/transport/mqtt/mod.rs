//! MQTT implementation of the presence transport
//!
//! Pure logic and I/O are kept apart:
//!
//! - [`topic`] - wildcard matching and protocol topic names
//! - [`connection`] - connection states, connect results, rumqttc options
//! - [`message_handler`] - event routing and inbound classification
//! - [`multiplexer`] - subscription de-duplication and fan-out
//! - [`discovery`] - announce / discover / leave protocol
//! - [`client`] - the connection supervisor tying it together
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_presence::config::PresenceConfig;
//! use mqtt_presence::transport::MqttTransport;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let config = PresenceConfig::for_broker("mqtt://localhost:1883");
//! let transport = Arc::new(MqttTransport::new(config)?);
//!
//! let cancel = CancellationToken::new();
//! let supervisor = transport.spawn(cancel.clone());
//! transport.wait_connected(std::time::Duration::from_secs(5)).await?;
//!
//! cancel.cancel();
//! let (_may_retry, _result) = supervisor.await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod discovery;
pub mod message_handler;
pub mod multiplexer;
pub mod topic;

pub use client::{MqttTransport, RumqttcBroker, RumqttcEvents};
pub use connection::{
    ConnectCode, ConnectStatus, ConnectionState, MqttError, ReconnectConfig,
};
pub use discovery::Discovery;
pub use message_handler::{EventRoute, MessageHandler, Packet};
pub use multiplexer::Multiplexer;
pub use topic::{ProtocolTopics, TopicKind};
