//! Configuration for the presence transport
//!
//! Everything the transport needs is passed in through [`PresenceConfig`]; there is
//! no process-wide state. Configurations are usually loaded from TOML, but every
//! section has defaults so they can also be built in code.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PresenceConfig {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub topics: TopicSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://host:port` or `mqtts://host:port`
    #[serde(default)]
    pub broker_url: String,
    /// MQTT client id, also used as this process' will-ID.
    /// Defaults to the executable name followed by a random UUID.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Fixed delay between reconnection attempts
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    /// When false, a failed connection attempt is handed back to the caller of
    /// `start` instead of being retried by the supervisor itself
    #[serde(default = "default_retry_internally")]
    pub retry_internally: bool,
}

fn default_keep_alive() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    5000
}

fn default_retry_internally() -> bool {
    true
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: String::new(),
            client_id: None,
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive(),
            reconnect_delay_ms: default_reconnect_delay(),
            retry_internally: default_retry_internally(),
        }
    }
}

/// Protocol topic names
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicSection {
    #[serde(default = "default_announce_topic")]
    pub announce: String,
    #[serde(default = "default_discover_topic")]
    pub discover: String,
    #[serde(default = "default_leave_topic")]
    pub leave: String,
}

fn default_announce_topic() -> String {
    "announce".to_string()
}

fn default_discover_topic() -> String {
    "discover".to_string()
}

fn default_leave_topic() -> String {
    "leave".to_string()
}

impl Default for TopicSection {
    fn default() -> Self {
        Self {
            announce: default_announce_topic(),
            discover: default_discover_topic(),
            leave: default_leave_topic(),
        }
    }
}

/// Discovery timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySection {
    /// Time between subscribing to announcements and publishing a discover.
    /// Must be long enough for all retained announcements to arrive.
    #[serde(default = "default_discover_delay")]
    pub discover_delay_ms: u64,
}

fn default_discover_delay() -> u64 {
    5000
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            discover_delay_ms: default_discover_delay(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("At least one broker address must be provided")]
    NoAddress,
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Topic '{0}' contains invalid characters")]
    InvalidTopic(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PresenceConfig {
    /// Build a configuration for the given broker with all other values defaulted
    pub fn for_broker(broker_url: impl Into<String>) -> Self {
        Self {
            mqtt: MqttSection {
                broker_url: broker_url.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PresenceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for errors that can never be recovered by retrying
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.broker_url.trim().is_empty() {
            return Err(ConfigError::NoAddress);
        }
        let url = Url::parse(&self.mqtt.broker_url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(self.mqtt.broker_url.clone()))?;
        if !matches!(url.scheme(), "mqtt" | "mqtts" | "tcp" | "ssl") || url.host_str().is_none() {
            return Err(ConfigError::InvalidBrokerUrl(self.mqtt.broker_url.clone()));
        }

        for topic in [
            &self.topics.announce,
            &self.topics.discover,
            &self.topics.leave,
        ] {
            validate_topic_name(topic)?;
        }

        if self.mqtt.reconnect_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect_delay_ms must be greater than 0".to_string(),
            ));
        }

        if let Some(client_id) = &self.mqtt.client_id {
            if client_id.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "client_id must not be empty when set".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// The client id to connect with, generating one when none is configured
    pub fn resolve_client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(generate_client_id)
    }

    pub fn discover_delay(&self) -> Duration {
        Duration::from_millis(self.discovery.discover_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.mqtt.reconnect_delay_ms)
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }
}

/// Protocol topics are used as prefixes and subscription filters, so they must
/// not contain wildcard characters themselves
fn validate_topic_name(topic: &str) -> Result<(), ConfigError> {
    if topic.is_empty() || topic.contains(['#', '+']) {
        return Err(ConfigError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// `<executable name>-<uuid>`, falling back to a fixed prefix when the
/// executable name is unavailable
fn generate_client_id() -> String {
    let prefix = std::env::args()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "presence".to_string());
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
client_id = "bridge-1"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
keep_alive_secs = 30
reconnect_delay_ms = 1000
retry_internally = false

[topics]
announce = "home/announce"
discover = "home/discover"
leave = "home/leave"

[discovery]
discover_delay_ms = 250
"#;

        let config = PresenceConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.mqtt.broker_url, "mqtt://localhost:1883");
        assert_eq!(config.mqtt.client_id.as_deref(), Some("bridge-1"));
        assert_eq!(config.mqtt.keep_alive_secs, 30);
        assert!(!config.mqtt.retry_internally);
        assert_eq!(config.topics.announce, "home/announce");
        assert_eq!(config.discover_delay(), Duration::from_millis(250));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(1));
        assert_eq!(config.resolve_client_id(), "bridge-1");
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = PresenceConfig::from_toml_str(
            r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
        )
        .unwrap();

        assert_eq!(config.topics, TopicSection::default());
        assert_eq!(config.topics.announce, "announce");
        assert_eq!(config.topics.discover, "discover");
        assert_eq!(config.topics.leave, "leave");
        assert_eq!(config.discover_delay(), Duration::from_secs(5));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
        assert!(config.mqtt.retry_internally);
    }

    #[test]
    fn test_missing_address() {
        let result = PresenceConfig::from_toml_str("[topics]\nannounce = \"a\"\n");
        assert!(matches!(result, Err(ConfigError::NoAddress)));

        let result = PresenceConfig::default().validate();
        assert!(matches!(result, Err(ConfigError::NoAddress)));
    }

    #[test]
    fn test_invalid_broker_url() {
        let config = PresenceConfig::for_broker("not a url");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));

        let config = PresenceConfig::for_broker("http://localhost:1883");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_wildcards_in_topics_rejected() {
        for bad in ["announce/#", "disc+over", "#"] {
            let mut config = PresenceConfig::for_broker("mqtt://localhost:1883");
            config.topics.announce = bad.to_string();
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidTopic(_))),
                "expected {bad} to be rejected"
            );
        }

        let mut config = PresenceConfig::for_broker("mqtt://localhost:1883");
        config.topics.leave = "leave/+".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTopic(_))
        ));
    }

    #[test]
    fn test_zero_reconnect_delay_rejected() {
        let mut config = PresenceConfig::for_broker("mqtt://localhost:1883");
        config.mqtt.reconnect_delay_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_generated_client_ids_are_unique() {
        let config = PresenceConfig::for_broker("mqtt://localhost:1883");
        let a = config.resolve_client_id();
        let b = config.resolve_client_id();
        assert_ne!(a, b);
        assert!(a.contains('-'));
    }
}
