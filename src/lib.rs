//! MQTT device discovery and presence
//!
//! Independent processes announce devices over an MQTT broker; other processes
//! observe the live set of devices, their features and whether they are
//! reachable right now, without any central directory.
//!
//! # Overview
//!
//! - [`transport`] - connection supervisor, topic multiplexer and the
//!   announce / discover / leave discovery protocol
//! - [`server`] - the presence [`Manager`] registry and observer-side device handles
//! - [`client`] - devices published by this process
//! - [`device`] - device descriptors, diffing and the shared device traits
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_presence::{Identity, Manager, MqttTransport, PresenceConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let transport = Arc::new(MqttTransport::new(PresenceConfig::for_broker(
//!     "mqtt://localhost:1883",
//! ))?);
//! let cancel = CancellationToken::new();
//! transport.spawn(cancel.clone());
//!
//! let manager = Manager::new(transport.clone());
//! let mut updates = manager.update_channel();
//! manager.spawn(cancel.clone());
//!
//! while let Some(update) = updates.recv().await {
//!     println!("{:?} {}", update.update_type, update.device.id());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod observability;
pub mod server;
pub mod testing;
pub mod transport;

pub use client::ClientDevice;
pub use config::PresenceConfig;
pub use device::{Action, DeviceInfo, DeviceState, FeatureInfo, FeatureSet, Identity, InfoUpdate};
pub use error::{PresenceError, PresenceResult};
pub use server::{Device, Manager, ServerDevice, Update, UpdateType};
pub use transport::{MqttTransport, ServerTransport, Transport};
