//! Pure connection state management for the MQTT transport
//!
//! Connection states, connect results, the reconnect policy and rumqttc option
//! building. Nothing in here performs I/O.

use crate::config::PresenceConfig;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, LastWill};
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state of the supervisor
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Supervisor not started yet
    Idle,
    /// Waiting for the broker to acknowledge a connection attempt
    Connecting,
    /// Broker session established
    Connected,
    /// Session lost, a retry will follow
    Disconnected(String),
    /// Supervisor shut down; it cannot be started again
    Stopped,
}

/// Outcome class of a connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectCode {
    Success,
    /// The broker answered but refused the session
    Refused,
    /// The broker could not be reached
    NetworkError,
}

/// Result of a connection attempt: a status code plus an optional cause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectStatus {
    pub code: ConnectCode,
    pub detail: Option<String>,
}

impl ConnectStatus {
    pub fn success() -> Self {
        Self {
            code: ConnectCode::Success,
            detail: None,
        }
    }

    pub fn refused(detail: impl Into<String>) -> Self {
        Self {
            code: ConnectCode::Refused,
            detail: Some(detail.into()),
        }
    }

    pub fn network_error(detail: impl Into<String>) -> Self {
        Self {
            code: ConnectCode::NetworkError,
            detail: Some(detail.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ConnectCode::Success
    }

    /// Map a rumqttc v5 ConnAck code
    pub fn from_return_code(code: ConnectReturnCode) -> Self {
        if matches!(code, ConnectReturnCode::Success) {
            Self::success()
        } else {
            Self::refused(format!("{code:?}"))
        }
    }
}

impl std::fmt::Display for ConnectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{:?}: {}", self.code, detail),
            None => write!(f, "{:?}", self.code),
        }
    }
}

/// Reconnection policy
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Fixed delay between attempts
    pub delay: Duration,
    /// Retry inside the supervisor loop instead of returning to the caller
    pub retry_internally: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            retry_internally: true,
        }
    }
}

impl ReconnectConfig {
    pub fn from_config(config: &PresenceConfig) -> Self {
        Self {
            delay: config.reconnect_delay(),
            retry_internally: config.mqtt.retry_internally,
        }
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
    #[error("Connection refused: {0}")]
    ConnectionRefused(ConnectStatus),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection supervisor is already running")]
    AlreadyRunning,
    #[error("Device state stream is already initialized")]
    AlreadyInitialized,
    #[error("Cancelled")]
    Cancelled,
}

/// Build rumqttc options from configuration.
///
/// The last will publishes `will_id` unretained to the leave topic.
pub fn configure_mqtt_options(
    will_id: &str,
    config: &PresenceConfig,
) -> Result<MqttOptions, MqttError> {
    let broker_url = &config.mqtt.broker_url;
    let url = Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.clone()))?;
    let tls = matches!(url.scheme(), "mqtts" | "ssl");
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(will_id, host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = config.get_mqtt_username() {
        let password = config.get_mqtt_password().unwrap_or_default();
        mqtt_options.set_credentials(&username, &password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.mqtt.keep_alive_secs));
    mqtt_options.set_clean_start(true);

    let lwt = LastWill::new(
        &config.topics.leave,
        will_id.to_string(),
        QoS::AtLeastOnce,
        false,
        None,
    );
    mqtt_options.set_last_will(lwt);

    Ok(mqtt_options)
}
