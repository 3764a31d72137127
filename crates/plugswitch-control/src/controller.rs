//! Device controller capability

use async_trait::async_trait;
use plugswitch_core::{DeviceId, DeviceReading, PhysicalDevice};
use std::time::Duration;
use thiserror::Error;

/// Default bound for a single device call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Device call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("Device {0} is not reachable")]
    Unreachable(DeviceId),
    #[error("Command failed: {0}")]
    CommandFailed(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Failed to launch vendor tool: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Vendor capability used to enumerate, poll and switch plugs
///
/// Implementations own any retry policy; callers bound every call with
/// their own timeout and treat expiry as failure.
#[async_trait]
pub trait DeviceController: Send + Sync {
    /// Enumerate plugs on the local network
    async fn discover(&self, timeout: Duration) -> Result<Vec<PhysicalDevice>, ControllerError>;

    /// Read relay state and telemetry
    async fn get_state(&self, id: &DeviceId) -> Result<DeviceReading, ControllerError>;

    /// Switch the relay on or off
    async fn set_state(&self, id: &DeviceId, on: bool) -> Result<(), ControllerError>;
}
