//! Testing utilities and mock implementations
//!
//! Drive the presence transport without a real MQTT broker.

pub mod mocks;

pub use mocks::*;
