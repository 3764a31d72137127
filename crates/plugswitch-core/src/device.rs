//! Device types for tracking discovered smart plugs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for a plug (vendor device ID or MAC address)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name-based GUID for this device, stable across restarts
    pub fn guid(&self) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_DNS, self.0.as_bytes())
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Availability of a device as seen by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Device was seen in the most recent discovery pass
    Online,
    /// Device has not been seen within the grace period
    Unavailable,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self::Online
    }
}

/// Optional energy telemetry channel a plug can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryChannel {
    Power,
    Voltage,
    Current,
}

impl TelemetryChannel {
    pub const ALL: [TelemetryChannel; 3] = [Self::Power, Self::Voltage, Self::Current];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Power => "Power",
            Self::Voltage => "Voltage",
            Self::Current => "Current",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Self::Power => "W",
            Self::Voltage => "V",
            Self::Current => "A",
        }
    }

    /// Gauge resolution reported as the switch step
    pub fn step(&self) -> f64 {
        match self {
            Self::Power => 0.1,
            Self::Voltage => 0.1,
            Self::Current => 0.001,
        }
    }
}

impl std::fmt::Display for TelemetryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Energy readings from one poll; absent fields were not reported
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub power_w: Option<f64>,
    pub voltage_v: Option<f64>,
    pub current_a: Option<f64>,
}

impl Telemetry {
    pub fn value(&self, channel: TelemetryChannel) -> Option<f64> {
        match channel {
            TelemetryChannel::Power => self.power_w,
            TelemetryChannel::Voltage => self.voltage_v,
            TelemetryChannel::Current => self.current_a,
        }
    }

    pub fn set(&mut self, channel: TelemetryChannel, value: f64) {
        match channel {
            TelemetryChannel::Power => self.power_w = Some(value),
            TelemetryChannel::Voltage => self.voltage_v = Some(value),
            TelemetryChannel::Current => self.current_a = Some(value),
        }
    }

    /// Channels that carry a value in this reading
    pub fn channels(&self) -> Vec<TelemetryChannel> {
        TelemetryChannel::ALL
            .into_iter()
            .filter(|c| self.value(*c).is_some())
            .collect()
    }
}

/// Relay state plus telemetry returned by a state poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceReading {
    pub on: bool,
    pub telemetry: Telemetry,
}

impl DeviceReading {
    pub fn new(on: bool) -> Self {
        Self {
            on,
            telemetry: Telemetry::default(),
        }
    }

    pub fn with(mut self, channel: TelemetryChannel, value: f64) -> Self {
        self.telemetry.set(channel, value);
        self
    }
}

/// A smart plug known to the bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalDevice {
    /// Stable identity used to merge discovery results
    pub id: DeviceId,
    /// Human-readable name (the vendor alias)
    pub name: String,
    /// Network address, if the vendor reports one
    pub address: Option<String>,
    /// Telemetry channels the plug supports
    pub channels: Vec<TelemetryChannel>,
    /// Current availability
    pub status: DeviceStatus,
    /// When the device was first discovered
    pub first_seen: DateTime<Utc>,
    /// When the device last appeared in a discovery pass
    pub last_seen: DateTime<Utc>,
    /// Error from the last failed poll, cleared on success
    pub last_error: Option<String>,
}

impl PhysicalDevice {
    /// Create a new device seen just now
    pub fn new(id: DeviceId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            address: None,
            channels: Vec::new(),
            status: DeviceStatus::Online,
            first_seen: now,
            last_seen: now,
            last_error: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_channels(mut self, channels: impl IntoIterator<Item = TelemetryChannel>) -> Self {
        let mut channels: Vec<_> = channels.into_iter().collect();
        channels.sort();
        channels.dedup();
        self.channels = channels;
        self
    }

    pub fn supports_telemetry(&self) -> bool {
        !self.channels.is_empty()
    }

    /// Update the last seen timestamp and mark the device online
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
        self.status = DeviceStatus::Online;
    }

    /// Check whether the device has been unseen for longer than `grace_secs`
    pub fn is_stale(&self, grace_secs: i64) -> bool {
        let elapsed = Utc::now() - self.last_seen;
        elapsed.num_seconds() > grace_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_device_guid_is_stable() {
        let a = DeviceId::new("8006ABCD");
        let b = DeviceId::new("8006ABCD");
        assert_eq!(a.guid(), b.guid());
        assert_ne!(a.guid(), DeviceId::new("other").guid());
    }

    #[test]
    fn test_channels_sorted_and_deduplicated() {
        let device = PhysicalDevice::new(DeviceId::new("p1"), "Plug").with_channels([
            TelemetryChannel::Current,
            TelemetryChannel::Power,
            TelemetryChannel::Current,
        ]);
        assert_eq!(
            device.channels,
            vec![TelemetryChannel::Power, TelemetryChannel::Current]
        );
        assert!(device.supports_telemetry());
    }

    #[test]
    fn test_is_stale() {
        let mut device = PhysicalDevice::new(DeviceId::new("p1"), "Plug");
        assert!(!device.is_stale(60));

        device.last_seen = Utc::now() - Duration::seconds(120);
        assert!(device.is_stale(60));

        device.touch();
        assert!(!device.is_stale(60));
        assert_eq!(device.status, DeviceStatus::Online);
    }

    #[test]
    fn test_telemetry_channels() {
        let reading = DeviceReading::new(true)
            .with(TelemetryChannel::Power, 12.5)
            .with(TelemetryChannel::Voltage, 231.0);
        assert_eq!(reading.telemetry.value(TelemetryChannel::Power), Some(12.5));
        assert_eq!(reading.telemetry.value(TelemetryChannel::Current), None);
        assert_eq!(
            reading.telemetry.channels(),
            vec![TelemetryChannel::Power, TelemetryChannel::Voltage]
        );
    }
}
