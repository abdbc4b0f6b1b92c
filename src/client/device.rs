//! Devices published by this process
//!
//! A [`ClientDevice`] keeps its announcement retained on the broker and answers
//! every discover trigger by announcing again, which is how observers learn it
//! is reachable.

use crate::device::{
    impl_identity_from_snapshot, value_stream, DeviceInfo, FeatureInfo, FeatureSet, Identity,
    LookupError,
};
use crate::error::PresenceResult;
use crate::transport::Transport;
use bytes::Bytes;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Shared {
    info: RwLock<DeviceInfo>,
    transport: Arc<dyn Transport>,
}

impl Shared {
    fn snapshot(&self) -> DeviceInfo {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn feature_info(&self, name: &str) -> Option<FeatureInfo> {
        self.info
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .features
            .get(name)
            .cloned()
    }

    async fn announce(&self) -> PresenceResult<()> {
        let info = self.snapshot();
        let payload = serde_json::to_vec(&info)?;
        self.transport
            .publish_meta(&info.topic, Bytes::from(payload))
            .await?;
        Ok(())
    }
}

/// A device announced by this process.
///
/// Dropping it stops answering discover triggers; the retained announcement
/// stays until [`delete_device`] clears it.
pub struct ClientDevice {
    shared: Arc<Shared>,
    announcer: JoinHandle<()>,
}

impl ClientDevice {
    /// Register `info` as a local device and start answering discover triggers.
    ///
    /// An empty will-ID is filled from the transport so a lost connection marks
    /// the device unreachable.
    pub async fn new(mut info: DeviceInfo, transport: Arc<dyn Transport>) -> Self {
        if info.last_will_id.is_empty() {
            info.last_will_id = transport.last_will_id();
        }
        info.normalize();
        info!(topic = %info.topic, will_id = %info.last_will_id, "Registering local device");

        let mut triggers = transport.discover().await;
        let shared = Arc::new(Shared {
            info: RwLock::new(info),
            transport,
        });

        let announcer = {
            let shared = shared.clone();
            tokio::spawn(async move {
                while triggers.recv().await.is_some() {
                    if let Err(e) = shared.announce().await {
                        warn!(topic = %shared.snapshot().topic, "Failed to announce device: {}", e);
                    }
                }
                debug!("Discover trigger stream closed");
            })
        };

        Self { shared, announcer }
    }

    /// Publish the current announcement now
    pub async fn announce(&self) -> PresenceResult<()> {
        self.shared.announce().await
    }

    fn snapshot(&self) -> DeviceInfo {
        self.shared.snapshot()
    }
}

impl Drop for ClientDevice {
    fn drop(&mut self) {
        self.announcer.abort();
    }
}

impl std::fmt::Debug for ClientDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientDevice")
            .field("info", &self.snapshot())
            .finish()
    }
}

impl_identity_from_snapshot!(ClientDevice);

impl FeatureSet for ClientDevice {
    type Feature = Feature;

    fn feature(&self, name: &str) -> Feature {
        if self.shared.feature_info(name).is_some() {
            Feature::Present(ClientFeature {
                shared: self.shared.clone(),
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

/// A feature served by a [`ClientDevice`]
#[derive(Clone)]
pub struct ClientFeature {
    shared: Arc<Shared>,
    name: String,
}

impl ClientFeature {
    fn current(&self) -> Result<FeatureInfo, LookupError> {
        self.shared
            .feature_info(&self.name)
            .ok_or_else(|| LookupError::FeatureNotFound {
                topic: self.shared.snapshot().topic,
                feature: self.name.clone(),
            })
    }

    /// Publish the feature's current value (retained) on its get topic
    pub async fn update(&self, value: &str) -> PresenceResult<()> {
        let info = self.current()?;
        self.shared
            .transport
            .publish(&info.get_topic, Bytes::from(value.to_string()), true)
            .await?;
        Ok(())
    }

    /// Stream of values observers request on the feature's set topic
    pub async fn on_set(&self) -> Result<mpsc::Receiver<String>, LookupError> {
        let info = self.current()?;
        Ok(value_stream(
            self.shared.transport.subscribe(&info.set_topic).await,
        ))
    }
}

impl std::fmt::Debug for ClientFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientFeature")
            .field("name", &self.name)
            .finish()
    }
}

/// Result of a local feature lookup
#[derive(Clone, Debug)]
pub enum Feature {
    Present(ClientFeature),
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

    pub async fn update(&self, value: &str) -> PresenceResult<()> {
        match self {
            Feature::Present(feature) => feature.update(value).await,
            Feature::Missing { error, .. } => Err(error.clone().into()),
        }
    }

    pub async fn on_set(&self) -> Result<mpsc::Receiver<String>, LookupError> {
        match self {
            Feature::Present(feature) => feature.on_set().await,
            Feature::Missing { error, .. } => Err(error.clone()),
        }
    }
}

/// Remove a device from the broker: clear its retained feature values and its
/// retained announcement. Observers see the cleared announcement as a deletion.
pub async fn delete_device(mut info: DeviceInfo, transport: &dyn Transport) -> PresenceResult<()> {
    info.normalize();
    for feature in info.features.values() {
        transport
            .publish(&feature.get_topic, Bytes::new(), true)
            .await?;
    }
    transport.publish_meta(&info.topic, Bytes::new()).await?;
    info!(topic = %info.topic, "Device deleted");
    Ok(())
}
