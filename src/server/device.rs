//! Observer-side device and feature handles, plus their sentinels

use crate::device::{
    impl_identity_from_snapshot, value_stream, DeviceInfo, FeatureInfo, FeatureSet, Identity,
    LookupError,
};
use crate::error::PresenceResult;
use crate::transport::Transport;
use bytes::Bytes;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;

/// A device known to the presence manager
#[derive(Clone)]
pub struct ServerDevice {
    info: Arc<RwLock<DeviceInfo>>,
    transport: Arc<dyn Transport>,
}

impl ServerDevice {
    pub(crate) fn new(info: DeviceInfo, transport: Arc<dyn Transport>) -> Self {
        Self {
            info: Arc::new(RwLock::new(info)),
            transport,
        }
    }

    /// Copy of the current info
    pub fn snapshot(&self) -> DeviceInfo {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn replace(&self, info: DeviceInfo) {
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = info;
    }

    /// Flip reachability; returns the previous value
    pub(crate) fn set_reachable(&self, reachable: bool) -> bool {
        let mut info = self.info.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut info.reachable, reachable)
    }

    fn feature_info(&self, name: &str) -> Option<FeatureInfo> {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .features
            .get(name)
            .cloned()
    }
}

impl std::fmt::Debug for ServerDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDevice")
            .field("info", &self.snapshot())
            .finish()
    }
}

impl_identity_from_snapshot!(ServerDevice);

impl FeatureSet for ServerDevice {
    type Feature = Feature;

    fn feature(&self, name: &str) -> Feature {
        if self.feature_info(name).is_some() {
            Feature::Present(ServerFeature {
                device: self.clone(),
                name: name.to_string(),
            })
        } else {
            Feature::Missing {
                name: name.to_string(),
                error: LookupError::FeatureNotFound {
                    topic: self.id(),
                    feature: name.to_string(),
                },
            }
        }
    }

    fn features(&self) -> Vec<Feature> {
        self.snapshot()
            .features
            .keys()
            .map(|name| self.feature(name))
            .collect()
    }
}

/// A feature of a [`ServerDevice`]. Topics are read live, so a feature handle
/// follows topic changes announced by the device.
#[derive(Clone, Debug)]
pub struct ServerFeature {
    device: ServerDevice,
    name: String,
}

impl ServerFeature {
    fn current(&self) -> Result<FeatureInfo, LookupError> {
        self.device
            .feature_info(&self.name)
            .ok_or_else(|| LookupError::FeatureNotFound {
                topic: self.device.id(),
                feature: self.name.clone(),
            })
    }

    /// Request a new value on the feature's set topic
    pub async fn set(&self, value: &str) -> PresenceResult<()> {
        let info = self.current()?;
        self.device
            .transport
            .publish(&info.set_topic, Bytes::from(value.to_string()), false)
            .await?;
        Ok(())
    }

    /// Stream of values the device publishes on the feature's get topic
    pub async fn on_update(&self) -> Result<mpsc::Receiver<String>, LookupError> {
        let info = self.current()?;
        Ok(value_stream(
            self.device.transport.subscribe(&info.get_topic).await,
        ))
    }
}

/// Result of a device lookup: the device, or a sentinel carrying why it is absent
#[derive(Clone, Debug)]
pub enum Device {
    Present(ServerDevice),
    Missing { topic: String, error: LookupError },
}

impl Device {
    pub(crate) fn missing(topic: &str, error: LookupError) -> Self {
        Device::Missing {
            topic: topic.to_string(),
            error,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Device::Missing { .. })
    }

    /// Why the device is absent
    pub fn error(&self) -> Option<&LookupError> {
        match self {
            Device::Present(_) => None,
            Device::Missing { error, .. } => Some(error),
        }
    }

    pub fn into_result(self) -> Result<ServerDevice, LookupError> {
        match self {
            Device::Present(device) => Ok(device),
            Device::Missing { error, .. } => Err(error),
        }
    }

    fn snapshot(&self) -> DeviceInfo {
        match self {
            Device::Present(device) => device.snapshot(),
            Device::Missing { topic, .. } => DeviceInfo::new(topic.clone()),
        }
    }
}

impl_identity_from_snapshot!(Device);

impl FeatureSet for Device {
    type Feature = Feature;

    fn feature(&self, name: &str) -> Feature {
        match self {
            Device::Present(device) => device.feature(name),
            Device::Missing { error, .. } => Feature::Missing {
                name: name.to_string(),
                error: error.clone(),
            },
        }
    }

    fn features(&self) -> Vec<Feature> {
        match self {
            Device::Present(device) => device.features(),
            Device::Missing { .. } => Vec::new(),
        }
    }
}

/// Result of a feature lookup: the feature, or a sentinel carrying the error
#[derive(Clone, Debug)]
pub enum Feature {
    Present(ServerFeature),
    Missing { name: String, error: LookupError },
}

impl Feature {
    pub fn name(&self) -> &str {
        match self {
            Feature::Present(feature) => &feature.name,
            Feature::Missing { name, .. } => name,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Feature::Missing { .. })
    }

    pub fn error(&self) -> Option<&LookupError> {
        match self {
            Feature::Present(_) => None,
            Feature::Missing { error, .. } => Some(error),
        }
    }

    pub fn info(&self) -> Result<FeatureInfo, LookupError> {
        match self {
            Feature::Present(feature) => feature.current(),
            Feature::Missing { error, .. } => Err(error.clone()),
        }
    }

    pub async fn set(&self, value: &str) -> PresenceResult<()> {
        match self {
            Feature::Present(feature) => feature.set(value).await,
            Feature::Missing { error, .. } => Err(error.clone().into()),
        }
    }

    pub async fn on_update(&self) -> Result<mpsc::Receiver<String>, LookupError> {
        match self {
            Feature::Present(feature) => feature.on_update().await,
            Feature::Missing { error, .. } => Err(error.clone()),
        }
    }
}
