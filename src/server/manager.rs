//! Device presence manager
//!
//! Turns the discovery event stream into a registry that many readers can
//! query concurrently. Changes are reported either through a buffered update
//! channel or through a [`Handler`] called on its own dispatch task; installing
//! one replaces (and closes) the other.

use super::device::{Device, ServerDevice};
use crate::device::{Action, DeviceInfo, DeviceState, Identity, InfoUpdate, LookupError};
use crate::error::PresenceResult;
use crate::transport::{ServerTransport, Transport};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Buffer of the update channel and of the handler dispatch queue
pub const UPDATE_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    Added,
    Updated,
    Removed,
}

/// A change to the registry
#[derive(Debug, Clone)]
pub struct Update {
    pub update_type: UpdateType,
    pub device: ServerDevice,
    /// Field-level changes; empty for `Added` and `Removed`
    pub changes: Vec<InfoUpdate>,
}

/// Callback receiving registry changes in the order they happen
pub trait Handler: Send + Sync {
    fn handle(&self, update: Update);
}

impl<F> Handler for F
where
    F: Fn(Update) + Send + Sync,
{
    fn handle(&self, update: Update) {
        self(update)
    }
}

/// Registry of every device seen by the discovery protocol
pub struct Manager {
    transport: Arc<dyn ServerTransport>,
    device_transport: Arc<dyn Transport>,
    registry: RwLock<HashMap<String, ServerDevice>>,
    waiting: Mutex<HashMap<String, watch::Sender<bool>>>,
    notifier: Mutex<Option<mpsc::Sender<Update>>>,
}

impl Manager {
    pub fn new<T>(transport: Arc<T>) -> Arc<Self>
    where
        T: ServerTransport + 'static,
    {
        Arc::new(Self {
            transport: transport.clone(),
            device_transport: transport,
            registry: RwLock::new(HashMap::new()),
            waiting: Mutex::new(HashMap::new()),
            notifier: Mutex::new(None),
        })
    }

    /// Install a fresh update channel, closing whatever was installed before
    pub fn update_channel(&self) -> mpsc::Receiver<Update> {
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
        self.install_notifier(Some(tx));
        rx
    }

    /// Install a handler, closing whatever was installed before.
    ///
    /// The handler runs on a dedicated task, one update at a time.
    pub fn set_handler(&self, handler: Arc<dyn Handler>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<Update>(UPDATE_BUFFER);
        self.install_notifier(Some(tx));

        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                handler.handle(update);
            }
            debug!("Update handler dispatch stopped");
        })
    }

    fn install_notifier(&self, tx: Option<mpsc::Sender<Update>>) {
        *self.notifier.lock().unwrap_or_else(PoisonError::into_inner) = tx;
    }

    /// Consume the device-state stream until cancelled or until it closes.
    ///
    /// On exit the update channel is closed and pending waiters are released.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> PresenceResult<()> {
        let mut states = self.transport.device_state().await?;
        info!("Presence manager started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                state = states.recv() => match state {
                    Some(state) => {
                        let span = crate::device_span!(topic = %state.topic, action = ?state.action);
                        // An unread update channel must not hold off shutdown
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = self.apply(state).instrument(span) => {}
                        }
                    }
                    None => {
                        debug!("Device state stream closed");
                        break;
                    }
                },
            }
        }

        self.install_notifier(None);
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!("Presence manager stopped");
        Ok(())
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<PresenceResult<()>> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run(cancel).await })
    }

    /// Apply one protocol event to the registry
    pub async fn apply(&self, state: DeviceState) {
        match state.action {
            Action::Update => match state.device {
                Some(info) => self.apply_update(info).await,
                None => warn!(topic = %state.topic, "Update event without device info"),
            },
            Action::Leave => self.apply_leave(&state.topic).await,
            Action::Delete => self.apply_delete(&state.topic).await,
        }
    }

    async fn apply_update(&self, mut info: DeviceInfo) {
        info.normalize();
        let topic = info.topic.clone();

        let Some(device) = self.lookup(&topic) else {
            let device = ServerDevice::new(info, self.device_transport.clone());
            self.registry
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(topic.clone(), device.clone());
            self.resolve_waiter(&topic);

            info!(topic = %topic, reachable = device.is_reachable(), "Device added");
            self.emit(UpdateType::Added, device, Vec::new()).await;
            return;
        };

        let previous = device.snapshot();
        let changes = match previous.diff(&info) {
            Ok(changes) => changes,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Skipping device update");
                return;
            }
        };
        device.replace(info.clone());
        self.move_feature_subscriptions(&previous, &info).await;

        if changes.is_empty() {
            debug!(topic = %topic, "Device re-announced without changes");
            return;
        }
        info!(topic = %topic, changes = changes.len(), "Device updated");
        self.emit(UpdateType::Updated, device, changes).await;
    }

    async fn apply_leave(&self, topic: &str) {
        let Some(device) = self.lookup(topic) else {
            debug!(topic = %topic, "Leave for unknown device");
            return;
        };
        if !device.set_reachable(false) {
            return;
        }
        info!(topic = %topic, "Device unreachable");
        self.emit(UpdateType::Updated, device, vec![InfoUpdate::unreachable()])
            .await;
    }

    async fn apply_delete(&self, topic: &str) {
        let removed = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
        let Some(device) = removed else {
            debug!(topic = %topic, "Delete for unknown device");
            return;
        };

        for feature_topic in device.snapshot().feature_topics() {
            self.device_transport.unsubscribe(&feature_topic).await;
        }
        info!(topic = %topic, "Device removed");
        self.emit(UpdateType::Removed, device, Vec::new()).await;
    }

    /// Keep feature streams alive across topic changes, drop them for removed features
    async fn move_feature_subscriptions(&self, previous: &DeviceInfo, current: &DeviceInfo) {
        for (name, old) in &previous.features {
            match current.features.get(name) {
                Some(new) => {
                    if old.get_topic != new.get_topic {
                        self.device_transport
                            .resubscribe(&old.get_topic, &new.get_topic)
                            .await;
                    }
                    if old.set_topic != new.set_topic {
                        self.device_transport
                            .resubscribe(&old.set_topic, &new.set_topic)
                            .await;
                    }
                }
                None => {
                    self.device_transport.unsubscribe(&old.get_topic).await;
                    self.device_transport.unsubscribe(&old.set_topic).await;
                }
            }
        }
    }

    async fn emit(&self, update_type: UpdateType, device: ServerDevice, changes: Vec<InfoUpdate>) {
        let notifier = self
            .notifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(tx) = notifier else {
            return;
        };

        let update = Update {
            update_type,
            device,
            changes,
        };
        if tx.send(update).await.is_err() {
            debug!("Update receiver dropped");
        }
    }

    fn resolve_waiter(&self, topic: &str) {
        let waiter = self
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
        if let Some(tx) = waiter {
            tx.send_replace(true);
        }
    }

    fn forget_waiter(&self, topic: &str) {
        let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
        if waiting
            .get(topic)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            waiting.remove(topic);
        }
    }

    fn lookup(&self, topic: &str) -> Option<ServerDevice> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
    }

    /// The device for `topic`, or a not-found sentinel
    pub fn device(&self, topic: &str) -> Device {
        match self.lookup(topic) {
            Some(device) => Device::Present(device),
            None => Device::missing(
                topic,
                LookupError::NotFound {
                    topic: topic.to_string(),
                },
            ),
        }
    }

    /// Every known device, ordered by topic
    pub fn devices(&self) -> Vec<ServerDevice> {
        let mut devices: Vec<ServerDevice> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        devices.sort_by_key(|device| device.id());
        devices
    }

    pub fn has_device(&self, topic: &str) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(topic)
    }

    pub fn devices_by_type(&self, device_type: &str) -> Vec<ServerDevice> {
        self.devices()
            .into_iter()
            .filter(|device| device.device_type().eq_ignore_ascii_case(device_type))
            .collect()
    }

    /// Wait until `topic` is known or `cancel` fires.
    ///
    /// Cancellation yields a sentinel carrying [`LookupError::Cancelled`].
    pub async fn wait_for_device(&self, topic: &str, cancel: &CancellationToken) -> Device {
        self.wait(topic, async {
            cancel.cancelled().await;
            LookupError::Cancelled {
                topic: topic.to_string(),
            }
        })
        .await
    }

    /// Wait until `topic` is known, at most `timeout`
    pub async fn wait_for_device_timeout(&self, topic: &str, timeout: Duration) -> Device {
        self.wait(topic, async {
            tokio::time::sleep(timeout).await;
            LookupError::Timeout {
                topic: topic.to_string(),
            }
        })
        .await
    }

    async fn wait(&self, topic: &str, stop: impl Future<Output = LookupError>) -> Device {
        let mut arrived = {
            // Waiter lock first: an insert racing with this check always finds the waiter.
            let mut waiting = self.waiting.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(device) = self.lookup(topic) {
                return Device::Present(device);
            }
            waiting
                .entry(topic.to_string())
                .or_insert_with(|| watch::channel(false).0)
                .subscribe()
        };

        let outcome = tokio::select! {
            found = arrived.wait_for(|found| *found) => match found {
                Ok(_) => None,
                Err(_) => Some(LookupError::Cancelled { topic: topic.to_string() }),
            },
            error = stop => Some(error),
        };
        drop(arrived);

        let error = match outcome {
            None => match self.lookup(topic) {
                Some(device) => return Device::Present(device),
                None => LookupError::NotFound {
                    topic: topic.to_string(),
                },
            },
            Some(error) => error,
        };
        self.forget_waiter(topic);
        debug!(topic = %topic, error = %error, "Stopped waiting for device");
        Device::missing(topic, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{FeatureInfo, FeatureSet};
    use crate::testing::{MockBroker, MockTransport};
    use bytes::Bytes;

    struct Fixture {
        manager: Arc<Manager>,
        transport: Arc<MockTransport>,
        broker: Arc<MockBroker>,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(MockBroker::new());
        let transport = Arc::new(MockTransport::new(broker.clone()));
        Fixture {
            manager: Manager::new(transport.clone()),
            transport,
            broker,
        }
    }

    fn lamp(reachable: bool) -> DeviceInfo {
        let mut info = DeviceInfo {
            name: "Lamp".to_string(),
            device_type: "Lightbulb".to_string(),
            last_will_id: "will-1".to_string(),
            ..DeviceInfo::new("lights/lamp")
        }
        .with_feature("on", FeatureInfo::default());
        info.reachable = reachable;
        info
    }

    #[tokio::test]
    async fn test_added_then_identical_update_is_silent() {
        let f = fixture();
        let mut updates = f.manager.update_channel();

        f.manager.apply(DeviceState::update(lamp(false))).await;
        f.manager.apply(DeviceState::update(lamp(false))).await;

        let added = updates.recv().await.unwrap();
        assert_eq!(added.update_type, UpdateType::Added);
        assert!(added.changes.is_empty());
        assert_eq!(added.device.id(), "lights/lamp");
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_emits_diff() {
        let f = fixture();
        let mut updates = f.manager.update_channel();

        f.manager.apply(DeviceState::update(lamp(false))).await;
        f.manager.apply(DeviceState::update(lamp(true))).await;

        updates.recv().await.unwrap();
        let updated = updates.recv().await.unwrap();
        assert_eq!(updated.update_type, UpdateType::Updated);
        assert_eq!(updated.changes, vec![InfoUpdate::new("reachable", "0", "1")]);
        assert!(f.manager.device("lights/lamp").is_reachable());
    }

    #[tokio::test]
    async fn test_leave_flips_reachability_once() {
        let f = fixture();
        let mut updates = f.manager.update_channel();

        f.manager.apply(DeviceState::update(lamp(true))).await;
        f.manager.apply(DeviceState::leave("lights/lamp")).await;
        f.manager.apply(DeviceState::leave("lights/lamp")).await;
        f.manager.apply(DeviceState::leave("lights/unknown")).await;

        assert_eq!(updates.recv().await.unwrap().update_type, UpdateType::Added);
        let left = updates.recv().await.unwrap();
        assert_eq!(left.update_type, UpdateType::Updated);
        assert_eq!(left.changes, vec![InfoUpdate::unreachable()]);
        assert!(updates.try_recv().is_err());
        assert!(!f.manager.device("lights/lamp").is_reachable());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let f = fixture();
        let mut updates = f.manager.update_channel();

        f.manager.apply(DeviceState::delete("lights/lamp")).await;
        f.manager.apply(DeviceState::update(lamp(true))).await;
        f.manager.apply(DeviceState::delete("lights/lamp")).await;
        f.manager.apply(DeviceState::delete("lights/lamp")).await;

        assert_eq!(updates.recv().await.unwrap().update_type, UpdateType::Added);
        assert_eq!(
            updates.recv().await.unwrap().update_type,
            UpdateType::Removed
        );
        assert!(updates.try_recv().is_err());
        assert!(!f.manager.has_device("lights/lamp"));
    }

    #[tokio::test]
    async fn test_delete_unsubscribes_feature_topics() {
        let f = fixture();
        f.manager.apply(DeviceState::update(lamp(true))).await;

        let mut values = f
            .manager
            .device("lights/lamp")
            .feature("on")
            .on_update()
            .await
            .unwrap();
        f.manager.apply(DeviceState::delete("lights/lamp")).await;

        assert_eq!(f.broker.unsubscribe_count("lights/lamp/on/get").await, 1);
        assert_eq!(values.recv().await, None);
    }

    #[tokio::test]
    async fn test_topic_change_resubscribes_feature_stream() {
        let f = fixture();
        f.manager.apply(DeviceState::update(lamp(true))).await;
        let mut values = f
            .manager
            .device("lights/lamp")
            .feature("on")
            .on_update()
            .await
            .unwrap();

        let moved = lamp(true).with_feature(
            "on",
            FeatureInfo {
                get_topic: "lights/lamp/power/state".to_string(),
                ..FeatureInfo::default()
            },
        );
        f.manager.apply(DeviceState::update(moved)).await;

        f.transport.inject("lights/lamp/on/get", "stale", false).await;
        f.transport
            .inject("lights/lamp/power/state", "true", false)
            .await;
        assert_eq!(values.recv().await.as_deref(), Some("true"));
        assert_eq!(f.transport.listener_count("lights/lamp/on/get"), 0);
    }

    #[tokio::test]
    async fn test_unknown_device_is_sentinel() {
        let f = fixture();
        let device = f.manager.device("nowhere");
        assert!(matches!(device.error(), Some(LookupError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_queries() {
        let f = fixture();
        f.manager.apply(DeviceState::update(lamp(true))).await;
        let mut plug = DeviceInfo::new("power/plug");
        plug.device_type = "outlet".to_string();
        f.manager.apply(DeviceState::update(plug)).await;

        let topics: Vec<String> = f.manager.devices().iter().map(|d| d.id()).collect();
        assert_eq!(topics, vec!["lights/lamp", "power/plug"]);
        assert_eq!(f.manager.devices_by_type("lightbulb").len(), 1);
        assert_eq!(f.manager.devices_by_type("OUTLET").len(), 1);
        assert!(f.manager.devices_by_type("thermostat").is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_device_returns_known_device() {
        let f = fixture();
        f.manager.apply(DeviceState::update(lamp(true))).await;
        let device = f
            .manager
            .wait_for_device("lights/lamp", &CancellationToken::new())
            .await;
        assert!(!device.is_missing());
    }

    #[tokio::test]
    async fn test_wait_for_device_unblocks_on_arrival() {
        let f = fixture();
        let manager = f.manager.clone();
        let waiter = tokio::spawn(async move {
            manager
                .wait_for_device_timeout("lights/lamp", Duration::from_secs(5))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        f.manager.apply(DeviceState::update(lamp(true))).await;

        let device = waiter.await.unwrap();
        assert!(!device.is_missing());
        assert_eq!(device.name(), "Lamp");
        assert!(f.manager.waiting.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_device_timeout() {
        let f = fixture();
        let device = f
            .manager
            .wait_for_device_timeout("lights/lamp", Duration::from_millis(20))
            .await;

        assert!(matches!(device.error(), Some(LookupError::Timeout { .. })));
        assert!(f.manager.waiting.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_device_cancelled() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let device = f.manager.wait_for_device("lights/lamp", &cancel).await;
        assert!(matches!(device.error(), Some(LookupError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_handler_replaces_channel() {
        let f = fixture();
        let mut updates = f.manager.update_channel();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        f.manager.set_handler(Arc::new(move |update: Update| {
            let _ = seen_tx.send(update.update_type);
        }));

        assert_eq!(updates.recv().await.map(|u| u.update_type), None);

        f.manager.apply(DeviceState::update(lamp(true))).await;
        f.manager.apply(DeviceState::delete("lights/lamp")).await;
        assert_eq!(seen_rx.recv().await, Some(UpdateType::Added));
        assert_eq!(seen_rx.recv().await, Some(UpdateType::Removed));
    }

    #[tokio::test]
    async fn test_run_consumes_states_and_closes_channel() {
        let f = fixture();
        let mut updates = f.manager.update_channel();
        let states = f.transport.state_sender();
        let cancel = CancellationToken::new();
        let handle = f.manager.spawn(cancel.clone());

        states.send(DeviceState::update(lamp(true))).await.unwrap();
        assert_eq!(updates.recv().await.unwrap().update_type, UpdateType::Added);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(updates.recv().await.is_none());

        // The device-state stream can only be taken once
        let second = f.manager.run(CancellationToken::new()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_cancel_stops_run_with_full_update_channel() {
        // Arrange: the update channel is never read
        let f = fixture();
        let _updates = f.manager.update_channel();
        let states = f.transport.state_sender();
        let cancel = CancellationToken::new();
        let handle = f.manager.spawn(cancel.clone());

        for i in 0..UPDATE_BUFFER + 5 {
            let info = DeviceInfo {
                name: format!("Lamp {i}"),
                ..DeviceInfo::new(format!("lights/lamp{i}"))
            };
            states.send(DeviceState::update(info)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Act
        cancel.cancel();
        let stopped = tokio::time::timeout(Duration::from_secs(2), handle).await;

        // Assert
        assert!(matches!(stopped, Ok(Ok(Ok(())))));
        assert!(f.manager.notifier.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_feature_set_through_registry() {
        let f = fixture();
        f.manager.apply(DeviceState::update(lamp(true))).await;

        f.manager
            .device("lights/lamp")
            .feature("on")
            .set("true")
            .await
            .unwrap();
        assert_eq!(
            f.broker.published_to("lights/lamp/on/set").await,
            vec![(Bytes::from("true"), false)]
        );
    }
}
