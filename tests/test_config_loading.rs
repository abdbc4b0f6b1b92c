//! Configuration loading and validation tests
//!
//! Tests focus on observable outcomes of loading: defaults applied, values
//! carried through, and permanent errors reported before anything connects.

use mqtt_presence::config::{ConfigError, PresenceConfig};
use mqtt_presence::transport::MqttTransport;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtts://broker.example.com:8883"
client_id = "hallway-bridge"
username_env = "MQTT_USER"
password_env = "MQTT_PASS"
keep_alive_secs = 30
reconnect_delay_ms = 250
retry_internally = false

[topics]
announce = "home/announce"
discover = "home/discover"
leave = "home/leave"

[discovery]
discover_delay_ms = 1500
"#,
    );

    let config = PresenceConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.broker_url, "mqtts://broker.example.com:8883");
    assert_eq!(config.resolve_client_id(), "hallway-bridge");
    assert_eq!(config.mqtt.username_env, Some("MQTT_USER".to_string()));
    assert_eq!(config.mqtt.keep_alive_secs, 30);
    assert!(!config.mqtt.retry_internally);
    assert_eq!(config.reconnect_delay(), Duration::from_millis(250));
    assert_eq!(config.topics.announce, "home/announce");
    assert_eq!(config.discover_delay(), Duration::from_millis(1500));
}

#[test]
fn test_config_applies_defaults() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
    );

    let config = PresenceConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.topics.announce, "announce");
    assert_eq!(config.topics.discover, "discover");
    assert_eq!(config.topics.leave, "leave");
    assert_eq!(config.discover_delay(), Duration::from_secs(5));
    assert_eq!(config.reconnect_delay(), Duration::from_secs(5));
    assert!(config.mqtt.retry_internally);
    assert!(config.mqtt.client_id.is_none());
}

#[test]
fn test_generated_client_ids_are_unique() {
    let config = PresenceConfig::for_broker("mqtt://localhost:1883");
    let first = config.resolve_client_id();
    let second = config.resolve_client_id();

    assert_ne!(first, second);
    assert!(!first.is_empty());
}

#[test]
fn test_missing_broker_address_fails() {
    let temp_file = write_config(
        r#"
[discovery]
discover_delay_ms = 100
"#,
    );

    let result = PresenceConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::NoAddress)));
}

#[test]
fn test_wildcard_topic_is_rejected() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtt://localhost:1883"

[topics]
announce = "home/+/announce"
"#,
    );

    let result = PresenceConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidTopic(_))));
}

#[test]
fn test_invalid_broker_url_is_rejected() {
    for url in ["not a url", "http://localhost:1883", "mqtt:localhost"] {
        let config = PresenceConfig::for_broker(url);
        assert!(
            matches!(config.validate(), Err(ConfigError::InvalidBrokerUrl(_))),
            "url: {url}"
        );
    }
}

#[test]
fn test_malformed_toml_fails() {
    let temp_file = write_config("[mqtt\nbroker_url = ");
    let result = PresenceConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_missing_file_fails() {
    let result = PresenceConfig::load_from_file(std::path::Path::new("/nonexistent/presence.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[tokio::test]
async fn test_transport_rejects_invalid_config_before_connecting() {
    let result = MqttTransport::new(PresenceConfig::default());
    assert!(result.is_err());
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = PresenceConfig::for_broker("mqtt://localhost:1883");
    let text = toml::to_string_pretty(&config).unwrap();
    let parsed = PresenceConfig::from_toml_str(&text).unwrap();
    assert_eq!(parsed, config);
}
