//! Alpaca switch descriptors derived from physical devices

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::{DeviceId, PhysicalDevice, TelemetryChannel};

/// Whether a switch can be written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchKind {
    /// Writable on/off relay
    Actuator,
    /// Read-only measured quantity
    ReadOnlyGauge,
}

/// One numbered Alpaca switch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchDescriptor {
    /// Switch number, stable for the lifetime of the process
    pub id: usize,
    pub name: String,
    pub description: String,
    pub kind: SwitchKind,
    pub min_value: f64,
    pub max_value: f64,
    pub step: f64,
    /// Owning device
    pub device: DeviceId,
    /// Telemetry channel for gauges
    pub channel: Option<TelemetryChannel>,
}

impl SwitchDescriptor {
    /// On/off relay switch for a device
    pub fn actuator(id: usize, device: &PhysicalDevice) -> Self {
        Self {
            id,
            name: device.name.clone(),
            description: actuator_description(device),
            kind: SwitchKind::Actuator,
            min_value: 0.0,
            max_value: 1.0,
            step: 1.0,
            device: device.id.clone(),
            channel: None,
        }
    }

    /// Read-only gauge for one telemetry channel of a device
    ///
    /// Plugs report no measurement range, so gauges are bounded below by 0
    /// and left unbounded above.
    pub fn gauge(id: usize, device: &PhysicalDevice, channel: TelemetryChannel) -> Self {
        Self {
            id,
            name: gauge_name(&device.name, channel),
            description: gauge_description(&device.name, channel),
            kind: SwitchKind::ReadOnlyGauge,
            min_value: 0.0,
            max_value: f64::MAX,
            step: channel.step(),
            device: device.id.clone(),
            channel: Some(channel),
        }
    }

    /// All descriptors for a newly seen device, numbered from `first_id`
    pub fn for_device(first_id: usize, device: &PhysicalDevice) -> Vec<Self> {
        let mut descriptors = vec![Self::actuator(first_id, device)];
        for (offset, channel) in device.channels.iter().enumerate() {
            descriptors.push(Self::gauge(first_id + 1 + offset, device, *channel));
        }
        descriptors
    }

    pub fn can_write(&self) -> bool {
        self.kind == SwitchKind::Actuator
    }

    /// Re-derive name and description after the device was renamed
    pub fn rename(&mut self, device: &PhysicalDevice) {
        match self.channel {
            Some(channel) => {
                self.name = gauge_name(&device.name, channel);
                self.description = gauge_description(&device.name, channel);
            }
            None => {
                self.name = device.name.clone();
                self.description = actuator_description(device);
            }
        }
    }

    /// Check that `value` lies in `[min_value, max_value]` and on the step grid
    pub fn accepts(&self, value: f64) -> bool {
        if !value.is_finite() || value < self.min_value || value > self.max_value {
            return false;
        }
        if self.step <= 0.0 {
            return true;
        }
        let steps = (value - self.min_value) / self.step;
        (steps - steps.round()).abs() < 1e-6
    }
}

fn actuator_description(device: &PhysicalDevice) -> String {
    format!("{} (GUID: {})", device.name, device.id.guid())
}

fn gauge_name(device_name: &str, channel: TelemetryChannel) -> String {
    format!("{} {}", device_name, channel.label())
}

fn gauge_description(device_name: &str, channel: TelemetryChannel) -> String {
    format!(
        "{} measured by {} ({}, read-only)",
        channel.label(),
        device_name,
        channel.unit()
    )
}

/// Current value of a switch as held by the state cache
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SwitchValue {
    /// 0.0/1.0 for actuators, the measured quantity for gauges
    pub value: f64,
    pub updated_at: DateTime<Utc>,
    /// Set while the owning device's last poll failed
    pub stale: bool,
}

impl SwitchValue {
    /// Placeholder value before the first successful poll
    pub fn unknown() -> Self {
        Self {
            value: 0.0,
            updated_at: Utc::now(),
            stale: true,
        }
    }

    pub fn fresh(value: f64) -> Self {
        Self {
            value,
            updated_at: Utc::now(),
            stale: false,
        }
    }

    pub fn as_bool(&self) -> bool {
        self.value > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plug(channels: &[TelemetryChannel]) -> PhysicalDevice {
        PhysicalDevice::new(DeviceId::new("p2"), "Plug2").with_channels(channels.iter().copied())
    }

    #[test]
    fn test_descriptors_for_device() {
        let device = plug(&[TelemetryChannel::Power]);
        let descriptors = SwitchDescriptor::for_device(1, &device);

        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].id, 1);
        assert_eq!(descriptors[0].kind, SwitchKind::Actuator);
        assert_eq!(descriptors[0].name, "Plug2");
        assert_eq!(descriptors[1].id, 2);
        assert_eq!(descriptors[1].kind, SwitchKind::ReadOnlyGauge);
        assert_eq!(descriptors[1].name, "Plug2 Power");
        assert_eq!(descriptors[1].channel, Some(TelemetryChannel::Power));
        assert!(!descriptors[1].can_write());
    }

    #[test]
    fn test_actuator_range() {
        let actuator = SwitchDescriptor::actuator(0, &plug(&[]));
        assert!(actuator.accepts(0.0));
        assert!(actuator.accepts(1.0));
        assert!(!actuator.accepts(0.5));
        assert!(!actuator.accepts(2.0));
        assert!(!actuator.accepts(-1.0));
        assert!(!actuator.accepts(f64::NAN));
    }

    #[test]
    fn test_gauge_range_is_unbounded() {
        let gauge = SwitchDescriptor::gauge(1, &plug(&[]), TelemetryChannel::Power);
        assert_eq!(gauge.min_value, 0.0);
        assert_eq!(gauge.max_value, f64::MAX);
        assert_eq!(gauge.step, 0.1);
    }

    #[test]
    fn test_rename_keeps_id() {
        let mut device = plug(&[TelemetryChannel::Voltage]);
        let mut descriptors = SwitchDescriptor::for_device(4, &device);

        device.name = "Heater".to_string();
        for d in &mut descriptors {
            d.rename(&device);
        }

        assert_eq!(descriptors[0].id, 4);
        assert_eq!(descriptors[0].name, "Heater");
        assert!(descriptors[0].description.starts_with("Heater (GUID: "));
        assert_eq!(descriptors[1].name, "Heater Voltage");
    }
}
