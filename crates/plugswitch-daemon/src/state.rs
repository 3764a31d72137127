//! Application state management

use plugswitch_control::{
    CredentialError, CredentialProvider, DeviceController, KasaCmdController, MemoryController,
};
use plugswitch_core::SwitchStateCache;
use plugswitch_discovery::DeviceRegistry;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Backend, Config};
use crate::session::SessionLifecycleManager;

/// Shared application state
pub struct AppState {
    /// Device registry and command path
    pub registry: Arc<DeviceRegistry>,
    /// Switch values served by the API
    pub cache: Arc<SwitchStateCache>,
    /// Connected Alpaca clients
    pub sessions: SessionLifecycleManager,
    /// Configuration
    pub config: Config,
    /// Cancelled to stop the server and the refresh loop
    pub shutdown: CancellationToken,
    /// Last ServerTransactionID handed out
    transaction: AtomicU32,
}

impl AppState {
    /// Create new application state around a controller
    pub fn new(config: Config, controller: Arc<dyn DeviceController>) -> Arc<Self> {
        let cache = Arc::new(SwitchStateCache::new());
        let registry = Arc::new(DeviceRegistry::new(
            controller,
            cache.clone(),
            config.to_registry_config(),
        ));
        let shutdown = CancellationToken::new();
        let sessions = SessionLifecycleManager::new(config.server.auto_shutdown, shutdown.clone());

        Arc::new(Self {
            registry,
            cache,
            sessions,
            config,
            shutdown,
            transaction: AtomicU32::new(0),
        })
    }

    /// Next ServerTransactionID, starting at 1
    ///
    /// After `u32::MAX` the counter wraps back to 1; 0 is never issued.
    pub fn next_transaction(&self) -> u32 {
        let previous = self
            .transaction
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| Some(following(t)))
            .unwrap_or_else(|t| t);
        following(previous)
    }
}

fn following(transaction: u32) -> u32 {
    if transaction == u32::MAX {
        1
    } else {
        transaction + 1
    }
}

/// Build the configured device controller
///
/// Missing vendor credentials are not fatal; KasaCmd may still work with
/// a cached session.
pub fn build_controller(
    config: &Config,
    credentials: &dyn CredentialProvider,
) -> Arc<dyn DeviceController> {
    let timeout = Duration::from_secs(config.discovery.device_timeout_secs);
    match config.controller.backend {
        Backend::KasaCmd => {
            let path = &config.controller.kasacmd_path;
            info!(path = %path.display(), "Using KasaCmd controller");
            match credentials.get() {
                Ok(creds) => {
                    info!(user = %creds.username, "Vendor credentials loaded");
                    Arc::new(KasaCmdController::with_credentials(path, timeout, creds))
                }
                Err(CredentialError::NotFound) => {
                    warn!("No vendor credentials stored; run with --store-credentials to add them");
                    Arc::new(KasaCmdController::new(path, timeout))
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read vendor credentials");
                    Arc::new(KasaCmdController::new(path, timeout))
                }
            }
        }
        Backend::Memory => {
            let plugs: Vec<_> = config
                .controller
                .simulated
                .iter()
                .map(|p| p.to_plug())
                .collect();
            info!(plugs = plugs.len(), "Using simulated controller");
            Arc::new(MemoryController::new(plugs))
        }
    }
}
