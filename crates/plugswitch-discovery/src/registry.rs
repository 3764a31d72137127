//! Device registry that combines discovery, switch numbering and polling

use plugswitch_control::{ControllerError, DeviceController};
use plugswitch_core::{
    AlpacaError, CacheError, DeviceId, DeviceReading, DeviceStatus, PhysicalDevice,
    SwitchDescriptor, SwitchStateCache, SwitchValue,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Time between refresh passes
    pub interval: Duration,
    /// Bound for each enumeration, poll and command call on its own
    pub device_timeout: Duration,
    /// How long a device may be missing before it is marked unavailable
    pub grace_period: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            device_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(120),
        }
    }
}

#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("Device enumeration timed out after {0:?}")]
    Timeout(Duration),
    #[error("Device enumeration failed: {0}")]
    Controller(#[from] ControllerError),
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Switch {0} does not exist")]
    UnknownSwitch(usize),
    #[error("Switch {0} is read-only")]
    ReadOnly(usize),
    #[error("Device {device} did not respond within {after:?}")]
    Timeout { device: DeviceId, after: Duration },
    #[error("Device {device} failed: {message}")]
    Device { device: DeviceId, message: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl From<CommandError> for AlpacaError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::UnknownSwitch(id) => AlpacaError::InvalidDeviceNumber(id),
            CommandError::ReadOnly(id) => {
                AlpacaError::InvalidOperation(format!("Switch {} is read-only", id))
            }
            CommandError::Cache(e) => e.into(),
            e @ (CommandError::Timeout { .. } | CommandError::Device { .. }) => {
                AlpacaError::DriverError(e.to_string())
            }
        }
    }
}

/// Outcome of one refresh pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Devices reported by this enumeration
    pub found: usize,
    /// Devices seen for the first time
    pub added: usize,
    /// Devices newly marked unavailable
    pub unavailable: usize,
    /// Devices whose state poll failed
    pub poll_failures: usize,
    /// Switches after the pass
    pub switches: usize,
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// Devices in discovery order
    devices: Vec<PhysicalDevice>,
    /// Switches in numbering order; index == switch id
    descriptors: Vec<SwitchDescriptor>,
}

/// Authoritative list of plugs and the switches derived from them
pub struct DeviceRegistry {
    controller: Arc<dyn DeviceController>,
    cache: Arc<SwitchStateCache>,
    config: RegistryConfig,
    inner: RwLock<RegistryInner>,
    /// Serializes refresh passes
    refresh_lock: Mutex<()>,
    failed_refreshes: AtomicU64,
    /// One lock per device so commands to the same plug run in order
    command_locks: std::sync::Mutex<HashMap<DeviceId, Arc<Mutex<()>>>>,
}

type PollOutcome = (DeviceId, u64, Result<DeviceReading, String>);

impl DeviceRegistry {
    /// Create an empty registry writing into `cache`
    pub fn new(
        controller: Arc<dyn DeviceController>,
        cache: Arc<SwitchStateCache>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            controller,
            cache,
            config,
            inner: RwLock::new(RegistryInner::default()),
            refresh_lock: Mutex::new(()),
            failed_refreshes: AtomicU64::new(0),
            command_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<SwitchStateCache> {
        &self.cache
    }

    /// Consecutive failed enumerations since the last success
    pub fn failed_refreshes(&self) -> u64 {
        self.failed_refreshes.load(Ordering::SeqCst)
    }

    /// All switches in numbering order
    pub async fn descriptors(&self) -> Vec<SwitchDescriptor> {
        self.inner.read().await.descriptors.clone()
    }

    /// Get a specific switch
    pub async fn descriptor(&self, id: usize) -> Option<SwitchDescriptor> {
        self.inner.read().await.descriptors.get(id).cloned()
    }

    /// Number of switches (Alpaca MaxSwitch)
    pub async fn switch_count(&self) -> usize {
        self.inner.read().await.descriptors.len()
    }

    /// All devices in discovery order
    pub async fn devices(&self) -> Vec<PhysicalDevice> {
        self.inner.read().await.devices.clone()
    }

    /// Get a specific device
    pub async fn device(&self, id: &DeviceId) -> Option<PhysicalDevice> {
        self.inner
            .read()
            .await
            .devices
            .iter()
            .find(|d| &d.id == id)
            .cloned()
    }

    /// Run a single refresh pass
    ///
    /// Enumerates devices, merges them into the registry, numbers new
    /// switches and polls every device seen in this pass. Enumeration and
    /// each poll get their own `device_timeout`. Telemetry channels first
    /// reported by a poll get gauges appended after that poll. A failed
    /// enumeration leaves the registry untouched apart from grace-period
    /// expiry.
    pub async fn refresh(&self) -> Result<RefreshSummary, RefreshError> {
        let _guard = self.refresh_lock.lock().await;
        let timeout = self.config.device_timeout;

        let discovered =
            match tokio::time::timeout(timeout, self.controller.discover(timeout)).await {
                Ok(Ok(devices)) => devices,
                Ok(Err(e)) => return Err(self.record_failure(e.into()).await),
                Err(_) => return Err(self.record_failure(RefreshError::Timeout(timeout)).await),
            };
        self.failed_refreshes.store(0, Ordering::SeqCst);

        let mut summary = RefreshSummary {
            found: discovered.len(),
            ..Default::default()
        };

        let seen = {
            let mut inner = self.inner.write().await;
            let seen = self.merge(&mut inner, discovered, &mut summary).await;
            summary.unavailable = self.expire_unseen(&mut inner.devices, &seen).await;
            seen
        };

        summary.poll_failures = self.poll(&seen).await;
        summary.switches = self.switch_count().await;

        info!(
            found = summary.found,
            added = summary.added,
            unavailable = summary.unavailable,
            poll_failures = summary.poll_failures,
            switches = summary.switches,
            "Refresh complete"
        );

        Ok(summary)
    }

    /// Merge an enumeration into the registry, returning the ids seen
    async fn merge(
        &self,
        inner: &mut RegistryInner,
        discovered: Vec<PhysicalDevice>,
        summary: &mut RefreshSummary,
    ) -> Vec<DeviceId> {
        let RegistryInner {
            devices,
            descriptors,
        } = inner;
        let mut seen: Vec<DeviceId> = Vec::new();

        for device in discovered {
            if seen.contains(&device.id) {
                warn!(device = %device.id, "Device reported twice in one enumeration, ignoring");
                continue;
            }
            seen.push(device.id.clone());

            if let Some(existing) = devices.iter_mut().find(|d| d.id == device.id) {
                if existing.status == DeviceStatus::Unavailable {
                    info!(device = %existing.id, name = %existing.name, "Device available again");
                }
                existing.touch();
                if device.address.is_some() {
                    existing.address = device.address;
                }

                if existing.name != device.name {
                    info!(device = %existing.id, old = %existing.name, new = %device.name, "Device renamed");
                    existing.name = device.name;
                    for descriptor in descriptors.iter_mut().filter(|d| d.device == existing.id) {
                        descriptor.rename(existing);
                    }
                }

                // Channels that appeared since the device was first numbered
                for channel in device.channels {
                    if existing.channels.contains(&channel) {
                        continue;
                    }
                    existing.channels.push(channel);
                    let descriptor = SwitchDescriptor::gauge(descriptors.len(), existing, channel);
                    self.append(descriptors, descriptor).await;
                }

            } else {
                for descriptor in SwitchDescriptor::for_device(descriptors.len(), &device) {
                    self.append(descriptors, descriptor).await;
                }
                info!(
                    device = %device.id,
                    name = %device.name,
                    channels = device.channels.len(),
                    "New device discovered"
                );
                summary.added += 1;
                devices.push(device);
            }
        }

        seen
    }

    async fn append(&self, descriptors: &mut Vec<SwitchDescriptor>, descriptor: SwitchDescriptor) {
        if let Err(e) = self.cache.register(&descriptor).await {
            warn!(switch = descriptor.id, error = %e, "Failed to register switch in cache");
        }
        debug!(switch = descriptor.id, name = %descriptor.name, kind = ?descriptor.kind, "Switch assigned");
        descriptors.push(descriptor);
    }

    /// Mark devices unseen beyond the grace period as unavailable
    async fn expire_unseen(&self, devices: &mut [PhysicalDevice], seen: &[DeviceId]) -> usize {
        let grace_secs = self.config.grace_period.as_secs() as i64;
        let mut expired = 0;
        for device in devices.iter_mut() {
            if seen.contains(&device.id)
                || device.status == DeviceStatus::Unavailable
                || !device.is_stale(grace_secs)
            {
                continue;
            }
            device.status = DeviceStatus::Unavailable;
            self.cache.mark_stale(&device.id).await;
            info!(device = %device.id, name = %device.name, last_seen = %device.last_seen, "Device unavailable");
            expired += 1;
        }
        expired
    }

    /// Poll devices concurrently and feed the cache; returns the failure count
    ///
    /// Results are applied in discovery order so gauges for newly reported
    /// channels are numbered the same way on every run.
    async fn poll(&self, ids: &[DeviceId]) -> usize {
        let timeout = self.config.device_timeout;
        let mut tasks = JoinSet::new();

        for id in ids.iter().cloned() {
            let controller = self.controller.clone();
            let observed = self.cache.generation();
            tasks.spawn(async move {
                let result = match tokio::time::timeout(timeout, controller.get_state(&id)).await {
                    Ok(Ok(reading)) => Ok(reading),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("State poll timed out after {:?}", timeout)),
                };
                (id, observed, result)
            });
        }

        let mut outcomes: HashMap<DeviceId, PollOutcome> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    outcomes.insert(outcome.0.clone(), outcome);
                }
                Err(e) => warn!(error = %e, "Poll task failed"),
            }
        }

        let mut failures = 0;
        let mut inner = self.inner.write().await;
        let RegistryInner {
            devices,
            descriptors,
        } = &mut *inner;

        for id in ids {
            let Some((_, observed, result)) = outcomes.remove(id) else {
                continue;
            };
            let Some(device) = devices.iter_mut().find(|d| &d.id == id) else {
                continue;
            };

            match result {
                Ok(reading) => {
                    for channel in reading.telemetry.channels() {
                        if device.channels.contains(&channel) {
                            continue;
                        }
                        device.channels.push(channel);
                        info!(device = %device.id, channel = %channel, "Telemetry channel reported");
                        let descriptor = SwitchDescriptor::gauge(descriptors.len(), device, channel);
                        self.append(descriptors, descriptor).await;
                    }
                    self.cache.apply_telemetry(id, &reading, observed).await;
                    device.last_error = None;
                }
                Err(message) => {
                    warn!(device = %id, error = %message, "Device poll failed");
                    self.cache.mark_stale(id).await;
                    device.last_error = Some(message);
                    failures += 1;
                }
            }
        }
        failures
    }

    async fn record_failure(&self, error: RefreshError) -> RefreshError {
        let consecutive = self.failed_refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(consecutive, error = %error, "Device enumeration failed, keeping previous registry");

        let mut inner = self.inner.write().await;
        self.expire_unseen(&mut inner.devices, &[]).await;
        error
    }

    /// Switch an actuator through the device and record the new value
    ///
    /// The cache is written only after the device confirmed the command, so
    /// a successful return is visible to every later read. Every call issues
    /// a device command, even if the cached value already matches. Commands
    /// to one device are serialized, so the cache ends on the value of the
    /// last command the device applied.
    pub async fn set_actuator(&self, switch_id: usize, on: bool) -> Result<SwitchValue, CommandError> {
        let descriptor = self
            .descriptor(switch_id)
            .await
            .ok_or(CommandError::UnknownSwitch(switch_id))?;
        if !descriptor.can_write() {
            return Err(CommandError::ReadOnly(switch_id));
        }

        let timeout = self.config.device_timeout;
        let device = descriptor.device;
        let lock = self.command_lock(&device);
        let _serial = lock.lock().await;
        match tokio::time::timeout(timeout, self.controller.set_state(&device, on)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(switch = switch_id, device = %device, error = %e, "Switch command failed");
                return Err(CommandError::Device {
                    device,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                warn!(switch = switch_id, device = %device, "Switch command timed out");
                return Err(CommandError::Timeout {
                    device,
                    after: timeout,
                });
            }
        }

        let value = self
            .cache
            .set(switch_id, if on { 1.0 } else { 0.0 })
            .await?;
        info!(switch = switch_id, device = %device, on, "Switch set");
        Ok(value)
    }

    fn command_lock(&self, device: &DeviceId) -> Arc<Mutex<()>> {
        let mut locks = self
            .command_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        locks.entry(device.clone()).or_default().clone()
    }

    /// Run the refresh loop until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.config.interval.max(Duration::from_secs(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = period.as_secs(), "Device refresh loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.refresh() => {
                    if let Err(e) = result {
                        debug!(error = %e, "Refresh pass failed");
                    }
                }
            }
        }

        info!("Device refresh loop stopped");
    }
}
