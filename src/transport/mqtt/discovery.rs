//! Announce / discover / leave protocol
//!
//! Retained announcements replayed by the broker only prove that a device
//! existed at some point. After `discover_delay` a retained discover trigger is
//! published; live devices answer it by announcing again, and every
//! announcement after that point marks the device reachable.
//!
//! Devices carry the will-ID of the connection that announced them. When that
//! connection's last will arrives on the leave topic, every device attributed
//! to it gets a `Leave` event.

use super::message_handler::{Inbound, MessageHandler, Packet};
use super::multiplexer::Multiplexer;
use super::topic::{ProtocolTopics, TopicKind};
use super::MqttError;
use crate::device::{DeviceInfo, DeviceState};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffer of the device-state stream
pub const DEVICE_STATE_BUFFER: usize = 32;

/// Payload of the discover trigger
const DISCOVER_PAYLOAD: &str = "1";

#[derive(Default)]
struct DiscoveryState {
    initialized: bool,
    device_tx: Option<mpsc::Sender<DeviceState>>,
    discover_sent: bool,
    generation: u64,
    wills: HashMap<String, Vec<String>>,
}

pub struct Discovery {
    mux: Arc<Multiplexer>,
    topics: ProtocolTopics,
    delay: Duration,
    shutdown: CancellationToken,
    state: Mutex<DiscoveryState>,
}

impl Discovery {
    pub fn new(mux: Arc<Multiplexer>, topics: ProtocolTopics, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            mux,
            topics,
            delay,
            shutdown: CancellationToken::new(),
            state: Mutex::new(DiscoveryState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DiscoveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the protocol and return its event stream. Only one stream exists.
    pub async fn device_state(self: &Arc<Self>) -> Result<mpsc::Receiver<DeviceState>, MqttError> {
        let rx = {
            let mut state = self.lock();
            if state.initialized {
                return Err(MqttError::AlreadyInitialized);
            }
            state.initialized = true;
            if self.shutdown.is_cancelled() {
                let (_, rx) = mpsc::channel(1);
                return Ok(rx);
            }
            let (tx, rx) = mpsc::channel(DEVICE_STATE_BUFFER);
            state.device_tx = Some(tx);
            rx
        };

        let announces = self.mux.subscribe_raw(&self.topics.announce_filter()).await;
        let leaves = self
            .mux
            .subscribe_raw(self.topics.name(TopicKind::Leave))
            .await;
        tokio::spawn(self.clone().pump(announces, leaves));

        info!(delay_ms = self.delay.as_millis() as u64, "Discovery started");
        self.start_window();
        Ok(rx)
    }

    /// Whether the device-state stream has been handed out
    pub fn is_active(&self) -> bool {
        let state = self.lock();
        state.initialized && state.device_tx.is_some()
    }

    /// Whether the current window's discover trigger has been published
    pub fn discover_sent(&self) -> bool {
        self.lock().discover_sent
    }

    /// Restart the discover window after the broker session was re-established
    pub fn on_connected(self: &Arc<Self>) {
        if self.is_active() {
            debug!("Restarting discover window after connect");
            self.start_window();
        }
    }

    fn start_window(self: &Arc<Self>) {
        let generation = {
            let mut state = self.lock();
            state.discover_sent = false;
            state.generation += 1;
            state.generation
        };

        let discovery = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = discovery.shutdown.cancelled() => {}
                _ = tokio::time::sleep(discovery.delay) => {
                    discovery.send_discover(generation).await;
                }
            }
        });
    }

    async fn send_discover(&self, generation: u64) {
        {
            let mut state = self.lock();
            if state.generation != generation || state.device_tx.is_none() {
                return;
            }
            state.discover_sent = true;
        }

        let topic = self.topics.name(TopicKind::Discover);
        debug!(topic = %topic, "Publishing discover trigger");
        if let Err(e) = self
            .mux
            .publish(topic, Bytes::from_static(DISCOVER_PAYLOAD.as_bytes()), true)
            .await
        {
            warn!(topic = %topic, "Failed to publish discover trigger: {}", e);
        }
    }

    async fn pump(
        self: Arc<Self>,
        mut announces: mpsc::Receiver<Packet>,
        mut leaves: mpsc::Receiver<Packet>,
    ) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(packet) = announces.recv() => self.handle(&packet).await,
                Some(packet) = leaves.recv() => self.handle(&packet).await,
                else => break,
            }
        }
        debug!("Discovery pump stopped");
    }

    /// Handle one protocol message
    pub async fn handle(&self, packet: &Packet) {
        match MessageHandler::classify(&packet.topic, &self.topics) {
            Inbound::Announce(device_topic) => self.on_announce(device_topic, &packet.payload).await,
            Inbound::Leave => self.on_leave(&packet.payload).await,
            Inbound::Discover | Inbound::Data => {}
        }
    }

    async fn on_announce(&self, device_topic: &str, payload: &[u8]) {
        if payload.is_empty() {
            debug!(topic = %device_topic, "Announcement cleared");
            self.forget_will(device_topic);
            self.emit(DeviceState::delete(device_topic)).await;
            return;
        }

        let mut info: DeviceInfo = match serde_json::from_slice(payload) {
            Ok(info) => info,
            Err(e) => {
                warn!(topic = %device_topic, "Dropping malformed announcement: {}", e);
                return;
            }
        };
        if info.topic.is_empty() {
            info.topic = device_topic.to_string();
        }
        info.normalize();

        {
            let mut state = self.lock();
            info.reachable = state.discover_sent;
            update_wills(&mut state.wills, &info.topic, &info.last_will_id);
        }

        debug!(topic = %info.topic, reachable = info.reachable, "Announcement received");
        self.emit(DeviceState::update(info)).await;
    }

    async fn on_leave(&self, payload: &[u8]) {
        let will_id = String::from_utf8_lossy(payload).trim().to_string();
        let topics = self.lock().wills.remove(&will_id);

        let Some(topics) = topics else {
            debug!(will_id = %will_id, "Leave for unknown will-ID");
            return;
        };

        info!(will_id = %will_id, devices = topics.len(), "Connection left");
        for topic in topics {
            self.emit(DeviceState::leave(topic)).await;
        }
    }

    fn forget_will(&self, device_topic: &str) {
        update_wills(&mut self.lock().wills, device_topic, "");
    }

    async fn emit(&self, event: DeviceState) {
        let tx = self.lock().device_tx.clone();
        let Some(tx) = tx else {
            return;
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => debug!("Discovery closed while emitting"),
            sent = tx.send(event) => {
                if sent.is_err() {
                    debug!("Device state stream dropped");
                }
            }
        }
    }

    /// Device topics currently attributed to `will_id`
    pub fn devices_for_will(&self, will_id: &str) -> Vec<String> {
        self.lock().wills.get(will_id).cloned().unwrap_or_default()
    }

    pub fn will_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().wills.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop timers and close the device-state stream
    pub fn close(&self) {
        self.shutdown.cancel();
        let mut state = self.lock();
        state.device_tx = None;
        state.wills.clear();
    }
}

/// Move `topic` into the bucket of `will_id`, removing it from any other
/// bucket first. Empty buckets are deleted; an empty `will_id` only removes.
fn update_wills(wills: &mut HashMap<String, Vec<String>>, topic: &str, will_id: &str) {
    wills.retain(|id, topics| {
        if id != will_id {
            topics.retain(|t| t != topic);
        }
        !topics.is_empty()
    });

    if will_id.is_empty() {
        return;
    }
    let bucket = wills.entry(will_id.to_string()).or_default();
    if !bucket.iter().any(|t| t == topic) {
        bucket.push(topic.to_string());
    }
}
