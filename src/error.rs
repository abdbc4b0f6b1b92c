//! Crate-wide error type
//!
//! Each layer has its own error enum; [`PresenceError`] aggregates them for
//! callers that drive the whole stack.

use crate::config::ConfigError;
use crate::device::LookupError;
use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Main error type for presence operations
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PresenceError {
    /// Whether retrying the same operation later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PresenceError::Transport(
                MqttError::ConnectionFailed(_)
                    | MqttError::ConnectionFailedStr(_)
                    | MqttError::PublishFailed(_)
                    | MqttError::SubscriptionFailed(_)
                    | MqttError::NotConnected { .. }
            )
        )
    }
}

/// Result type alias for presence operations
pub type PresenceResult<T> = Result<T, PresenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_conversions() {
        let error: PresenceError = ConfigError::NoAddress.into();
        assert!(matches!(error, PresenceError::Config(ConfigError::NoAddress)));
        assert!(!error.is_transient());

        let error: PresenceError = MqttError::ConnectionFailedStr("down".to_string()).into();
        assert!(error.is_transient());

        let error: PresenceError = MqttError::AlreadyRunning.into();
        assert!(!error.is_transient());

        let error: PresenceError = LookupError::NotFound {
            topic: "a".to_string(),
        }
        .into();
        assert!(error.to_string().contains("not found"));
    }
}
