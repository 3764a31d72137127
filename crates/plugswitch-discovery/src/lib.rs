//! Plugswitch Discovery - Device registry for smart plugs
//!
//! The registry periodically enumerates plugs through a
//! [`DeviceController`](plugswitch_control::DeviceController), merges them
//! by stable identity, assigns switch numbers and feeds the state cache.

pub mod registry;

pub use registry::{CommandError, DeviceRegistry, RefreshError, RefreshSummary, RegistryConfig};
