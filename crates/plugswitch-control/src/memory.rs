//! In-process controller with simulated plugs
//!
//! Backs the `memory` controller backend for running the bridge without
//! hardware, and doubles as the controller in tests.

use async_trait::async_trait;
use plugswitch_core::{DeviceId, DeviceReading, PhysicalDevice, TelemetryChannel};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::controller::{ControllerError, DeviceController};

/// A simulated plug
#[derive(Debug, Clone)]
pub struct SimulatedPlug {
    pub id: DeviceId,
    pub name: String,
    pub channels: Vec<TelemetryChannel>,
    pub on: bool,
    /// Reported power draw while on
    pub load_w: f64,
    /// Whether the plug appears in discovery and answers polls
    pub reachable: bool,
    /// Error returned by `set_state` while set
    pub command_error: Option<String>,
    /// Error returned by `get_state` while set
    pub poll_error: Option<String>,
}

impl SimulatedPlug {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: DeviceId::new(id),
            name: name.into(),
            channels: Vec::new(),
            on: false,
            load_w: 60.0,
            reachable: true,
            command_error: None,
            poll_error: None,
        }
    }

    pub fn with_channels(mut self, channels: impl IntoIterator<Item = TelemetryChannel>) -> Self {
        self.channels = channels.into_iter().collect();
        self
    }

    fn reading(&self) -> DeviceReading {
        let mut reading = DeviceReading::new(self.on);
        let voltage = 230.0;
        let power = if self.on { self.load_w } else { 0.0 };
        for channel in &self.channels {
            let value = match channel {
                TelemetryChannel::Power => power,
                TelemetryChannel::Voltage => voltage,
                TelemetryChannel::Current => power / voltage,
            };
            reading.telemetry.set(*channel, value);
        }
        reading
    }
}

#[derive(Debug, Default)]
struct Inner {
    plugs: Vec<SimulatedPlug>,
    commands: HashMap<DeviceId, usize>,
    discovery_error: Option<String>,
    delay: Option<Duration>,
}

/// [`DeviceController`] over a list of simulated plugs
#[derive(Debug, Default)]
pub struct MemoryController {
    inner: Mutex<Inner>,
}

impl MemoryController {
    pub fn new(plugs: impl IntoIterator<Item = SimulatedPlug>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                plugs: plugs.into_iter().collect(),
                ..Inner::default()
            }),
        }
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner)
    }

    fn with_plug<T>(
        &self,
        id: &DeviceId,
        f: impl FnOnce(&mut SimulatedPlug) -> T,
    ) -> Result<T, ControllerError> {
        self.with_inner(|inner| {
            inner
                .plugs
                .iter_mut()
                .find(|p| &p.id == id)
                .map(f)
                .ok_or_else(|| ControllerError::UnknownDevice(id.clone()))
        })
    }

    /// Add a plug; it appears on the next discovery
    pub fn add_plug(&self, plug: SimulatedPlug) {
        self.with_inner(|inner| inner.plugs.push(plug));
    }

    /// Make a plug vanish from discovery and stop answering polls
    pub fn set_reachable(&self, id: &DeviceId, reachable: bool) {
        let _ = self.with_plug(id, |p| p.reachable = reachable);
    }

    /// Make `set_state` fail with `message` until cleared with `None`
    pub fn set_command_error(&self, id: &DeviceId, message: Option<&str>) {
        let _ = self.with_plug(id, |p| p.command_error = message.map(str::to_string));
    }

    /// Make `get_state` fail with `message` until cleared with `None`
    pub fn set_poll_error(&self, id: &DeviceId, message: Option<&str>) {
        let _ = self.with_plug(id, |p| p.poll_error = message.map(str::to_string));
    }

    /// Make enumeration fail until cleared with `None`
    pub fn set_discovery_error(&self, message: Option<&str>) {
        self.with_inner(|inner| inner.discovery_error = message.map(str::to_string));
    }

    /// Delay every device call, to exercise caller timeouts
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.with_inner(|inner| inner.delay = delay);
    }

    /// Rename a plug as the vendor app would
    pub fn rename(&self, id: &DeviceId, name: &str) {
        let _ = self.with_plug(id, |p| p.name = name.to_string());
    }

    /// Toggle a plug without going through the controller
    pub fn set_local_state(&self, id: &DeviceId, on: bool) {
        let _ = self.with_plug(id, |p| p.on = on);
    }

    /// Relay state of a plug, if it exists
    pub fn is_on(&self, id: &DeviceId) -> Option<bool> {
        self.with_plug(id, |p| p.on).ok()
    }

    /// Number of `set_state` calls that reached a plug
    pub fn command_count(&self, id: &DeviceId) -> usize {
        self.with_inner(|inner| inner.commands.get(id).copied().unwrap_or(0))
    }

    async fn simulate_latency(&self) {
        if let Some(delay) = self.with_inner(|inner| inner.delay) {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl DeviceController for MemoryController {
    async fn discover(&self, _timeout: Duration) -> Result<Vec<PhysicalDevice>, ControllerError> {
        self.simulate_latency().await;
        self.with_inner(|inner| {
            if let Some(message) = &inner.discovery_error {
                return Err(ControllerError::CommandFailed(message.clone()));
            }
            Ok(inner
                .plugs
                .iter()
                .filter(|p| p.reachable)
                .map(|p| {
                    PhysicalDevice::new(p.id.clone(), p.name.clone())
                        .with_address(format!("memory://{}", p.id))
                        .with_channels(p.channels.iter().copied())
                })
                .collect())
        })
    }

    async fn get_state(&self, id: &DeviceId) -> Result<DeviceReading, ControllerError> {
        self.simulate_latency().await;
        self.with_plug(id, |p| {
            if !p.reachable {
                return Err(ControllerError::Unreachable(p.id.clone()));
            }
            match &p.poll_error {
                Some(message) => Err(ControllerError::InvalidResponse(message.clone())),
                None => Ok(p.reading()),
            }
        })?
    }

    async fn set_state(&self, id: &DeviceId, on: bool) -> Result<(), ControllerError> {
        self.simulate_latency().await;
        self.with_inner(|inner| {
            *inner.commands.entry(id.clone()).or_insert(0) += 1;
        });
        self.with_plug(id, |p| {
            if !p.reachable {
                return Err(ControllerError::Unreachable(p.id.clone()));
            }
            if let Some(message) = &p.command_error {
                return Err(ControllerError::CommandFailed(message.clone()));
            }
            p.on = on;
            debug!(device = %p.id, on, "Simulated plug switched");
            Ok(())
        })?
    }
}
