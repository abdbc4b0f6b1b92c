//! Tests for logging configuration and the span macros
//!
//! Only one global subscriber can exist per test binary, so initialization is
//! exercised once and every later call must be a harmless no-op.

use mqtt_presence::observability::logging::{parse_level, LogFormat};
use mqtt_presence::observability::{init_logging, LogFormat as ReexportedFormat};
use mqtt_presence::{device_span, mqtt_span};
use tracing::Level;

#[test]
fn test_log_format_parse() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("COMPACT"), LogFormat::Compact);
    assert_eq!(LogFormat::parse("xml"), LogFormat::Json);
    assert_eq!(ReexportedFormat::parse("pretty"), LogFormat::Pretty);
}

#[test]
fn test_parse_level_defaults_to_info() {
    assert_eq!(parse_level("debug"), Level::DEBUG);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[test]
fn test_init_logging_twice_does_not_panic() {
    init_logging(Level::DEBUG, LogFormat::Compact, true);
    init_logging(Level::INFO, LogFormat::Json, false);

    let span = mqtt_span!(will_id = "bridge-1", operation = "test");
    let _entered = span.enter();
    let device = device_span!(topic = "lights/lamp");
    let _device = device.enter();
    tracing::info!(topic = "lights/lamp", "Logging works inside spans");
}
