//! Controller backed by the `KasaCmd` vendor command-line tool
//!
//! `KasaCmd` addresses plugs by their friendly name, so the controller keeps
//! the id -> name mapping learned from the last device list. Discovery only
//! lists devices; telemetry channels show up in the first status poll.

use async_trait::async_trait;
use plugswitch_core::{DeviceId, DeviceReading, PhysicalDevice, TelemetryChannel};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::controller::{ControllerError, DeviceController, DEFAULT_TIMEOUT};
use crate::credentials::{expose, Credentials};

/// Pause before retrying a status query against an expired device list
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Status queries are attempted at most this many times
const STATUS_ATTEMPTS: u32 = 2;

/// Runs `KasaCmd` processes with a bounded lifetime
struct Runner {
    program: PathBuf,
    timeout: Duration,
    credentials: Option<Credentials>,
}

impl Runner {
    async fn run(&self, args: &[&str], timeout: Duration) -> Result<String, ControllerError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).kill_on_drop(true);
        if let Some(creds) = &self.credentials {
            cmd.env("KASA_EMAIL", &creds.username)
                .env("KASA_PASSWORD", expose(creds));
        }

        let start = Instant::now();
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| ControllerError::Timeout(timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(
            args = ?args,
            elapsed_ms = start.elapsed().as_millis() as u64,
            status = %output.status,
            "KasaCmd finished"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!("KasaCmd exited with {}", output.status)
            } else {
                stderr.trim().to_string()
            };
            return Err(ControllerError::CommandFailed(message));
        }

        Ok(stdout)
    }

    /// Query relay state and telemetry; the retry shares one timeout budget
    async fn status(&self, name: &str) -> Result<DeviceReading, ControllerError> {
        let deadline = Instant::now() + self.timeout;
        let mut attempt = 1;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ControllerError::Timeout(self.timeout));
            }
            let output = self.run(&["-device", name, "-status"], remaining).await?;
            if !needs_list_refresh(&output) {
                return Ok(parse_status(&output));
            }
            if attempt >= STATUS_ATTEMPTS
                || deadline.saturating_duration_since(Instant::now()) <= RETRY_DELAY
            {
                return Err(ControllerError::InvalidResponse(format!(
                    "KasaCmd device list still expired after {} attempt(s)",
                    attempt
                )));
            }
            warn!(device = %name, attempt, "KasaCmd device list expired, retrying status");
            attempt += 1;
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }
}

/// [`DeviceController`] that shells out to `KasaCmd`
pub struct KasaCmdController {
    runner: Runner,
    names: RwLock<HashMap<DeviceId, String>>,
}

impl KasaCmdController {
    /// Create a controller for the given `KasaCmd` executable
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::build(program.into(), timeout, None)
    }

    /// Create a controller that passes vendor account credentials to `KasaCmd`
    pub fn with_credentials(
        program: impl Into<PathBuf>,
        timeout: Duration,
        credentials: Credentials,
    ) -> Self {
        Self::build(program.into(), timeout, Some(credentials))
    }

    fn build(program: PathBuf, timeout: Duration, credentials: Option<Credentials>) -> Self {
        let timeout = if timeout.is_zero() { DEFAULT_TIMEOUT } else { timeout };
        Self {
            runner: Runner {
                program,
                timeout,
                credentials,
            },
            names: RwLock::new(HashMap::new()),
        }
    }

    async fn device_name(&self, id: &DeviceId) -> Result<String, ControllerError> {
        self.names
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ControllerError::UnknownDevice(id.clone()))
    }
}

#[async_trait]
impl DeviceController for KasaCmdController {
    async fn discover(&self, timeout: Duration) -> Result<Vec<PhysicalDevice>, ControllerError> {
        let output = self.runner.run(&["-devicelist"], timeout).await?;
        let devices: Vec<PhysicalDevice> = parse_device_list(&output)
            .into_iter()
            .map(|(id, name)| PhysicalDevice::new(id, name))
            .collect();

        let mut names = self.names.write().await;
        for device in &devices {
            names.insert(device.id.clone(), device.name.clone());
        }

        info!(count = devices.len(), "KasaCmd device list loaded");
        Ok(devices)
    }

    async fn get_state(&self, id: &DeviceId) -> Result<DeviceReading, ControllerError> {
        let name = self.device_name(id).await?;
        self.runner.status(&name).await
    }

    async fn set_state(&self, id: &DeviceId, on: bool) -> Result<(), ControllerError> {
        let name = self.device_name(id).await?;
        let action = if on { "-on" } else { "-off" };
        self.runner
            .run(&["-device", &name, action], self.runner.timeout)
            .await?;
        info!(device = %name, on, "KasaCmd switched device");
        Ok(())
    }
}

/// Parse `KasaCmd -devicelist` output into (id, name) pairs
///
/// Device lines are comma separated with the vendor id first and the friendly
/// name second. Progress lines are skipped.
pub fn parse_device_list(output: &str) -> Vec<(DeviceId, String)> {
    let mut devices: Vec<(DeviceId, String)> = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.to_ascii_lowercase().contains("retrieving updated list") {
            continue;
        }
        let mut parts = line.split(',').map(str::trim);
        let (Some(raw_id), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let id = if raw_id.is_empty() { name } else { raw_id };
        let id = DeviceId::new(id);
        if devices.iter().any(|(existing, _)| existing == &id) {
            warn!(device = %id, "Duplicate device in KasaCmd list, ignoring");
            continue;
        }
        devices.push((id, name.to_string()));
    }
    devices
}

/// Parse `KasaCmd -device <name> -status` output
///
/// The relay is read from a `Relay: 0|1` field, falling back to the last
/// integer token; output without either reads as off.
pub fn parse_status(output: &str) -> DeviceReading {
    let mut relay = None;
    let mut reading = DeviceReading::default();

    for line in output.lines() {
        if relay.is_none() {
            relay = labelled_value(line, "relay").map(|v| v == 1.0);
        }
        for channel in TelemetryChannel::ALL {
            if let Some(value) = labelled_value(line, channel.label()) {
                reading.telemetry.set(channel, value);
            }
        }
    }

    reading.on = relay.unwrap_or_else(|| {
        output
            .split_whitespace()
            .filter(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_digit()))
            .last()
            .map(|t| t == "1")
            .unwrap_or(false)
    });
    reading
}

/// Whether `KasaCmd` asked for its device list to be refreshed
fn needs_list_refresh(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    lower.contains("devicelist expired") || lower.contains("retrieving updated list")
}

/// Find `<label>: <number>` in a line, case-insensitively
fn labelled_value(line: &str, label: &str) -> Option<f64> {
    let lower = line.to_ascii_lowercase();
    let needle = format!("{}:", label.to_ascii_lowercase());
    let start = lower.find(&needle)? + needle.len();
    let number: String = lower[start..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    number.parse().ok()
}
