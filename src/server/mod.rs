//! Observer role: the device presence manager and its device handles

pub mod device;
pub mod manager;

pub use device::{Device, Feature, ServerDevice, ServerFeature};
pub use manager::{Handler, Manager, Update, UpdateType, UPDATE_BUFFER};
