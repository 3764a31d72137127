//! Switch state cache shared between the refresh loop and the HTTP API
//!
//! The cache is the only place the API reads switch values from, so requests
//! never wait on device I/O. Values are written by two paths:
//! - the registry's refresh cycle via [`SwitchStateCache::apply_telemetry`]
//! - the explicit command path via [`SwitchStateCache::set`]
//!
//! Every `set` bumps a write generation. A poll records the generation before
//! it talks to the device and passes it back as `observed_at`; entries written
//! after that point are left alone, so a slow poll can never roll back a
//! command that completed while it was in flight.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::device::{DeviceId, DeviceReading, TelemetryChannel};
use crate::switch::{SwitchDescriptor, SwitchKind, SwitchValue};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Switch {0} not found")]
    NotFound(usize),
    #[error("Switch {0} is read-only")]
    InvalidOperation(usize),
    #[error("Switch {got} registered out of order, expected {expected}")]
    OutOfOrder { expected: usize, got: usize },
}

#[derive(Debug, Clone)]
struct CacheEntry {
    device: DeviceId,
    kind: SwitchKind,
    channel: Option<TelemetryChannel>,
    value: SwitchValue,
    written_at: u64,
}

/// Concurrency-safe snapshot of every switch value, indexed by switch id
#[derive(Debug, Default)]
pub struct SwitchStateCache {
    entries: RwLock<Vec<CacheEntry>>,
    generation: AtomicU64,
}

impl SwitchStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current write generation, captured by pollers before a device call
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Register the next switch; ids must arrive in sequence
    pub async fn register(&self, descriptor: &SwitchDescriptor) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        if descriptor.id != entries.len() {
            return Err(CacheError::OutOfOrder {
                expected: entries.len(),
                got: descriptor.id,
            });
        }
        entries.push(CacheEntry {
            device: descriptor.device.clone(),
            kind: descriptor.kind,
            channel: descriptor.channel,
            value: SwitchValue::unknown(),
            written_at: 0,
        });
        Ok(())
    }

    /// Number of registered switches
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Read the current value of a switch
    pub async fn get(&self, id: usize) -> Result<SwitchValue, CacheError> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|e| e.value)
            .ok_or(CacheError::NotFound(id))
    }

    /// Write an actuator value after a successful device command
    pub async fn set(&self, id: usize, value: f64) -> Result<SwitchValue, CacheError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(id).ok_or(CacheError::NotFound(id))?;
        if entry.kind != SwitchKind::Actuator {
            return Err(CacheError::InvalidOperation(id));
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        entry.value = SwitchValue::fresh(value);
        entry.written_at = generation;
        Ok(entry.value)
    }

    /// Apply a poll result to every switch of `device`
    ///
    /// Returns the number of switches updated.
    pub async fn apply_telemetry(
        &self,
        device: &DeviceId,
        reading: &DeviceReading,
        observed_at: u64,
    ) -> usize {
        let now = Utc::now();
        let mut updated = 0;
        let mut entries = self.entries.write().await;
        for entry in entries.iter_mut().filter(|e| &e.device == device) {
            if entry.written_at > observed_at {
                continue;
            }
            let value = match entry.channel {
                None => Some(if reading.on { 1.0 } else { 0.0 }),
                Some(channel) => reading.telemetry.value(channel),
            };
            match value {
                Some(value) => {
                    entry.value.value = value;
                    entry.value.updated_at = now;
                    entry.value.stale = false;
                    updated += 1;
                }
                // Channel missing from this reading
                None => entry.value.stale = true,
            }
        }
        updated
    }

    /// Flag every switch of `device` as stale, keeping the last value
    pub async fn mark_stale(&self, device: &DeviceId) {
        let mut entries = self.entries.write().await;
        for entry in entries.iter_mut().filter(|e| &e.device == device) {
            entry.value.stale = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PhysicalDevice;

    async fn cache_with_plug() -> (SwitchStateCache, DeviceId) {
        let device = PhysicalDevice::new(DeviceId::new("p1"), "Plug")
            .with_channels([TelemetryChannel::Power]);
        let cache = SwitchStateCache::new();
        for descriptor in SwitchDescriptor::for_device(0, &device) {
            cache.register(&descriptor).await.unwrap();
        }
        (cache, device.id)
    }

    #[tokio::test]
    async fn test_get_unknown_switch() {
        let (cache, _) = cache_with_plug().await;
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get(2).await, Err(CacheError::NotFound(2)));
    }

    #[tokio::test]
    async fn test_new_switch_is_stale_until_polled() {
        let (cache, id) = cache_with_plug().await;
        assert!(cache.get(0).await.unwrap().stale);

        let reading = DeviceReading::new(true).with(TelemetryChannel::Power, 42.0);
        let updated = cache.apply_telemetry(&id, &reading, cache.generation()).await;
        assert_eq!(updated, 2);

        let relay = cache.get(0).await.unwrap();
        assert_eq!(relay.value, 1.0);
        assert!(!relay.stale);
        assert_eq!(cache.get(1).await.unwrap().value, 42.0);
    }

    #[tokio::test]
    async fn test_set_gauge_rejected() {
        let (cache, _) = cache_with_plug().await;
        assert_eq!(cache.set(1, 5.0).await, Err(CacheError::InvalidOperation(1)));
    }

    #[tokio::test]
    async fn test_poll_does_not_overwrite_newer_set() {
        let (cache, id) = cache_with_plug().await;

        // Poll starts, then a command lands before the poll result is applied
        let observed = cache.generation();
        cache.set(0, 1.0).await.unwrap();

        let reading = DeviceReading::new(false).with(TelemetryChannel::Power, 3.0);
        cache.apply_telemetry(&id, &reading, observed).await;

        assert_eq!(cache.get(0).await.unwrap().value, 1.0);
        assert_eq!(cache.get(1).await.unwrap().value, 3.0);

        // A later poll is applied normally
        cache.apply_telemetry(&id, &reading, cache.generation()).await;
        assert_eq!(cache.get(0).await.unwrap().value, 0.0);
    }

    #[tokio::test]
    async fn test_mark_stale_keeps_value() {
        let (cache, id) = cache_with_plug().await;
        cache.set(0, 1.0).await.unwrap();
        cache.mark_stale(&id).await;

        let value = cache.get(0).await.unwrap();
        assert_eq!(value.value, 1.0);
        assert!(value.stale);
    }

    #[tokio::test]
    async fn test_register_out_of_order() {
        let cache = SwitchStateCache::new();
        let device = PhysicalDevice::new(DeviceId::new("p1"), "Plug");
        let descriptor = SwitchDescriptor::actuator(3, &device);
        assert_eq!(
            cache.register(&descriptor).await,
            Err(CacheError::OutOfOrder { expected: 0, got: 3 })
        );
        assert!(cache.is_empty().await);
    }
}
