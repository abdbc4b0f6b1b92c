//! Publisher role: devices this process announces and serves

pub mod device;

pub use device::{delete_device, ClientDevice, ClientFeature, Feature};
