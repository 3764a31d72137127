//! Plugswitch Core - Device, switch and state types
//!
//! This crate provides the foundational types for the Plugswitch bridge:
//! - Physical smart-plug devices and their telemetry readings
//! - Alpaca switch descriptors with stable numbering
//! - The switch state cache shared by the refresh loop and the HTTP API
//! - The Alpaca error taxonomy

pub mod cache;
pub mod device;
pub mod error;
pub mod switch;

pub use cache::{CacheError, SwitchStateCache};
pub use device::{DeviceId, DeviceReading, DeviceStatus, PhysicalDevice, Telemetry, TelemetryChannel};
pub use error::AlpacaError;
pub use switch::{SwitchDescriptor, SwitchKind, SwitchValue};
