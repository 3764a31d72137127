//! Configuration loading and validation

use anyhow::Result;
use plugswitch_control::SimulatedPlug;
use plugswitch_core::TelemetryChannel;
use plugswitch_discovery::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the HTTP API
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Exit when the last connected client disconnects
    #[serde(default = "default_true")]
    pub auto_shutdown: bool,
    /// Reject switch operations from clients that are not connected
    #[serde(default)]
    pub require_connection: bool,
    /// Alpaca UDP discovery port (0 disables the responder)
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// UniqueID reported by the management API
    #[serde(default)]
    pub unique_id: Option<String>,
    /// Location reported by the management API
    #[serde(default = "default_location")]
    pub location: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            auto_shutdown: true,
            require_connection: false,
            discovery_port: default_discovery_port(),
            unique_id: None,
            location: default_location(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5555
}

fn default_discovery_port() -> u16 {
    crate::beacon::DISCOVERY_PORT
}

fn default_location() -> String {
    "Observatory".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Seconds between refresh passes
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Bound for every device call
    #[serde(default = "default_device_timeout")]
    pub device_timeout_secs: u64,
    /// Seconds a device may be missing before it is marked unavailable
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            device_timeout_secs: default_device_timeout(),
            grace_period_secs: default_grace_period(),
        }
    }
}

fn default_interval() -> u64 {
    30
}

fn default_device_timeout() -> u64 {
    5
}

fn default_grace_period() -> u64 {
    120
}

/// Which [`plugswitch_control::DeviceController`] to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    KasaCmd,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub backend: Backend,
    /// Path to the KasaCmd executable
    #[serde(default = "default_kasacmd_path")]
    pub kasacmd_path: PathBuf,
    /// Plugs for the memory backend
    #[serde(default)]
    pub simulated: Vec<SimulatedPlugConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            kasacmd_path: default_kasacmd_path(),
            simulated: Vec::new(),
        }
    }
}

fn default_kasacmd_path() -> PathBuf {
    PathBuf::from("KasaCmd")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedPlugConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub channels: Vec<TelemetryChannel>,
    /// Initial relay state
    #[serde(default)]
    pub on: bool,
}

impl SimulatedPlugConfig {
    pub fn to_plug(&self) -> SimulatedPlug {
        let mut plug = SimulatedPlug::new(&self.id, &self.name).with_channels(self.channels.clone());
        plug.on = self.on;
        plug
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for `plugswitch.log`; unset logs to stderr only
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Config {
    /// Convert to RegistryConfig
    pub fn to_registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            interval: Duration::from_secs(self.discovery.interval_secs),
            device_timeout: Duration::from_secs(self.discovery.device_timeout_secs),
            grace_period: Duration::from_secs(self.discovery.grace_period_secs),
        }
    }

    /// HTTP listen address
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }

    /// Configured UniqueID, or one derived from the listen port
    pub fn unique_id(&self) -> String {
        match &self.server.unique_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => {
                let name = format!("plugswitch.switch.{}", self.server.port);
                Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes()).to_string()
            }
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}
