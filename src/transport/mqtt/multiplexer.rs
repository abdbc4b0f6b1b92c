//! Topic multiplexer
//!
//! Keeps one broker subscription per distinct topic string and fans inbound
//! messages out to every local stream registered for it. Exact subscriptions
//! receive payloads; raw subscriptions may use wildcards and receive the whole
//! [`Packet`].
//!
//! Broker calls are decided under the table lock but issued after it is
//! released, and routing clones the matching senders before awaiting any send.
//! Topics whose every receiver was dropped are unsubscribed on the next
//! message routed to them.

use super::message_handler::Packet;
use super::topic::matches;
use crate::transport::BrokerClient;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Buffer of every subscriber stream
pub const STREAM_BUFFER: usize = 5;

#[derive(Default)]
struct Tables {
    exact: HashMap<String, Vec<mpsc::Sender<Bytes>>>,
    raw: HashMap<String, Vec<mpsc::Sender<Packet>>>,
    closed: bool,
}

impl Tables {
    fn has_topic(&self, topic: &str) -> bool {
        self.exact.contains_key(topic) || self.raw.contains_key(topic)
    }
}

pub struct Multiplexer {
    broker: Arc<dyn BrokerClient>,
    tables: RwLock<Tables>,
}

impl Multiplexer {
    pub fn new(broker: Arc<dyn BrokerClient>) -> Self {
        Self {
            broker,
            tables: RwLock::new(Tables::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to an exact topic
    pub async fn subscribe(&self, topic: &str) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let needs_broker = {
            let mut tables = self.write();
            if tables.closed {
                return rx;
            }
            let needs_broker = !tables.has_topic(topic);
            tables.exact.entry(topic.to_string()).or_default().push(tx);
            needs_broker
        };

        if needs_broker {
            self.broker_subscribe(topic).await;
        }
        rx
    }

    /// Subscribe to a pattern that may contain `+` and `#`
    pub async fn subscribe_raw(&self, pattern: &str) -> mpsc::Receiver<Packet> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let needs_broker = {
            let mut tables = self.write();
            if tables.closed {
                return rx;
            }
            let needs_broker = !tables.has_topic(pattern);
            tables.raw.entry(pattern.to_string()).or_default().push(tx);
            needs_broker
        };

        if needs_broker {
            self.broker_subscribe(pattern).await;
        }
        rx
    }

    /// Close every stream registered under exactly `topic`
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let found = {
            let mut tables = self.write();
            let exact = tables.exact.remove(topic).is_some();
            let raw = tables.raw.remove(topic).is_some();
            exact || raw
        };

        if found {
            if let Err(e) = self.broker.unsubscribe(topic).await {
                warn!(topic = %topic, "Broker unsubscribe failed: {}", e);
            }
        }
        found
    }

    /// Move every exact listener of `old_topic` to `new_topic`.
    ///
    /// Returns false when nobody listened on `old_topic`.
    pub async fn resubscribe(&self, old_topic: &str, new_topic: &str) -> bool {
        if old_topic == new_topic {
            return self.read().exact.contains_key(old_topic);
        }

        let (subscribe_new, unsubscribe_old) = {
            let mut tables = self.write();
            let Some(moved) = tables.exact.remove(old_topic) else {
                return false;
            };
            let subscribe_new = !tables.has_topic(new_topic);
            tables
                .exact
                .entry(new_topic.to_string())
                .or_default()
                .extend(moved);
            (subscribe_new, !tables.raw.contains_key(old_topic))
        };

        debug!(old = %old_topic, new = %new_topic, "Moved subscribers");
        if subscribe_new {
            self.broker_subscribe(new_topic).await;
        }
        if unsubscribe_old {
            if let Err(e) = self.broker.unsubscribe(old_topic).await {
                warn!(topic = %old_topic, "Broker unsubscribe failed: {}", e);
            }
        }
        true
    }

    pub async fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> Result<(), super::MqttError> {
        self.broker.publish(topic, payload, retain).await
    }

    /// Deliver an inbound message to every exact and matching raw stream
    pub async fn route(&self, packet: &Packet) {
        let (exact, raw) = {
            let tables = self.read();
            let exact = tables
                .exact
                .get(&packet.topic)
                .cloned()
                .unwrap_or_default();
            let raw: Vec<mpsc::Sender<Packet>> = tables
                .raw
                .iter()
                .filter(|(pattern, _)| matches(&packet.topic, pattern))
                .flat_map(|(_, senders)| senders.iter().cloned())
                .collect();
            (exact, raw)
        };

        let mut stale = false;
        for tx in exact {
            stale |= tx.send(packet.payload.clone()).await.is_err();
        }
        for tx in raw {
            stale |= tx.send(packet.clone()).await.is_err();
        }

        if stale {
            self.prune_closed().await;
        }
    }

    /// Every topic with at least one listener, exact and raw, deduplicated
    pub fn topics(&self) -> Vec<String> {
        let tables = self.read();
        let mut topics: Vec<String> = tables.exact.keys().cloned().collect();
        for pattern in tables.raw.keys() {
            if !tables.exact.contains_key(pattern) {
                topics.push(pattern.clone());
            }
        }
        topics.sort();
        topics
    }

    /// Number of live exact streams on `topic`
    pub fn listener_count(&self, topic: &str) -> usize {
        self.read().exact.get(topic).map_or(0, Vec::len)
    }

    /// Drop every stream and refuse new ones.
    ///
    /// Dropping the senders is what closes the streams, so calling this
    /// twice is harmless.
    pub fn close_all(&self) {
        let mut tables = self.write();
        tables.closed = true;
        tables.exact.clear();
        tables.raw.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.read().closed
    }

    /// Forget senders whose receivers are gone and release broker
    /// subscriptions nobody listens to any more
    async fn prune_closed(&self) {
        let abandoned: Vec<String> = {
            let mut tables = self.write();
            let mut emptied = Vec::new();
            tables.exact.retain(|topic, senders| {
                senders.retain(|tx| !tx.is_closed());
                if senders.is_empty() {
                    emptied.push(topic.clone());
                }
                !senders.is_empty()
            });
            tables.raw.retain(|pattern, senders| {
                senders.retain(|tx| !tx.is_closed());
                if senders.is_empty() {
                    emptied.push(pattern.clone());
                }
                !senders.is_empty()
            });
            emptied.sort();
            emptied.dedup();
            emptied.retain(|topic| !tables.has_topic(topic));
            emptied
        };

        for topic in abandoned {
            debug!(topic = %topic, "Last listener gone, unsubscribing");
            if let Err(e) = self.broker.unsubscribe(&topic).await {
                warn!(topic = %topic, "Broker unsubscribe failed: {}", e);
            }
        }
    }

    async fn broker_subscribe(&self, topic: &str) {
        // Failures are repaired by the replay after the next connect
        if let Err(e) = self.broker.subscribe(topic).await {
            warn!(topic = %topic, "Broker subscribe failed: {}", e);
        }
    }
}
