//! Device model shared by the server (observer) and client (publisher) roles
//!
//! Both roles see a device through the same two capabilities, [`Identity`] and
//! [`FeatureSet`]. Each role has its own concrete type holding its own transport
//! reference; there is no shared base struct.

pub mod info;

pub use info::{DeviceInfo, FeatureInfo, InfoUpdate};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// What happened to a device, as observed by the discovery protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// The device announced itself (first time or again)
    Update,
    /// The device's retained announcement was cleared
    Delete,
    /// The connection covering the device went away
    Leave,
}

/// Protocol event handed from the discovery layer to the presence manager
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub action: Action,
    pub topic: String,
    /// Present only for [`Action::Update`]
    pub device: Option<DeviceInfo>,
}

impl DeviceState {
    pub fn update(info: DeviceInfo) -> Self {
        Self {
            action: Action::Update,
            topic: info.topic.clone(),
            device: Some(info),
        }
    }

    pub fn delete(topic: impl Into<String>) -> Self {
        Self {
            action: Action::Delete,
            topic: topic.into(),
            device: None,
        }
    }

    pub fn leave(topic: impl Into<String>) -> Self {
        Self {
            action: Action::Leave,
            topic: topic.into(),
            device: None,
        }
    }
}

/// Logical lookup failures, carried by sentinel devices and features
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("device '{topic}' not found")]
    NotFound { topic: String },
    #[error("feature '{feature}' not found on device '{topic}'")]
    FeatureNotFound { topic: String, feature: String },
    #[error("waiting for device '{topic}' was cancelled")]
    Cancelled { topic: String },
    #[error("timed out waiting for device '{topic}'")]
    Timeout { topic: String },
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Identity accessors common to every device handle
pub trait Identity {
    /// The device topic, its unique key
    fn id(&self) -> String;
    fn name(&self) -> String;
    fn manufacturer(&self) -> String;
    fn model(&self) -> String;
    fn serial_number(&self) -> String;
    fn device_type(&self) -> String;
    fn is_reachable(&self) -> bool;
    /// Full snapshot of the device's current info
    fn info(&self) -> DeviceInfo;
}

/// Feature lookup common to every device handle
///
/// `feature` never fails outright: an unknown name yields the role's sentinel
/// feature, whose operations return [`LookupError::FeatureNotFound`].
pub trait FeatureSet {
    type Feature;

    fn feature(&self, name: &str) -> Self::Feature;
    fn features(&self) -> Vec<Self::Feature>;
}

/// Implements [`Identity`] for a type whose `snapshot()` returns a [`DeviceInfo`]
macro_rules! impl_identity_from_snapshot {
    ($ty:ty) => {
        impl $crate::device::Identity for $ty {
            fn id(&self) -> String {
                self.snapshot().topic
            }
            fn name(&self) -> String {
                self.snapshot().name
            }
            fn manufacturer(&self) -> String {
                self.snapshot().manufacturer
            }
            fn model(&self) -> String {
                self.snapshot().model
            }
            fn serial_number(&self) -> String {
                self.snapshot().serial_number
            }
            fn device_type(&self) -> String {
                self.snapshot().device_type
            }
            fn is_reachable(&self) -> bool {
                self.snapshot().reachable
            }
            fn info(&self) -> $crate::device::DeviceInfo {
                self.snapshot()
            }
        }
    };
}

pub(crate) use impl_identity_from_snapshot;

/// Buffer of feature value streams
pub const VALUE_BUFFER: usize = 5;

/// Turn a raw payload stream into a stream of string values.
///
/// The returned stream closes when the source closes.
pub(crate) fn value_stream(mut source: mpsc::Receiver<Bytes>) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(VALUE_BUFFER);
    tokio::spawn(async move {
        while let Some(payload) = source.recv().await {
            let value = String::from_utf8_lossy(&payload).into_owned();
            if tx.send(value).await.is_err() {
                break;
            }
        }
    });
    rx
}
