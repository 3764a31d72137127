//! Plugswitch Daemon - Main entry point
//!
//! Runs the device refresh loop and serves the Alpaca Switch API.

mod alpaca;
mod api;
mod beacon;
mod config;
mod logging;
mod management;
mod server;
mod session;
mod state;

use anyhow::{bail, Result};
use clap::Parser;
use plugswitch_control::{CredentialProvider, KeyringCredentials};
use std::io::BufRead;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "plugswitch")]
#[command(about = "ASCOM Alpaca switch bridge for smart plugs")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "plugswitch.toml")]
    config: PathBuf,

    /// HTTP port (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single refresh, print the switch table and exit
    #[arg(long)]
    scan_once: bool,

    /// Store vendor account credentials for USERNAME (secret read from stdin) and exit
    #[arg(long, value_name = "USERNAME")]
    store_credentials: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = config::load_config(&args.config)?;

    // Override port if specified
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // Initialize logging
    let _log_guard = logging::init(
        logging::parse_level(&args.log_level),
        config.logging.directory.as_deref(),
    )?;

    info!("Plugswitch v{}", env!("CARGO_PKG_VERSION"));
    info!(
        path = %args.config.display(),
        port = config.server.port,
        backend = ?config.controller.backend,
        "Configuration loaded"
    );

    let credentials = KeyringCredentials::new();

    if let Some(username) = args.store_credentials {
        let mut secret = String::new();
        std::io::stdin().lock().read_line(&mut secret)?;
        let secret = secret.trim_end_matches(['\r', '\n']);
        if secret.is_empty() {
            bail!("No secret given on stdin");
        }
        credentials.set(&username, secret)?;
        println!("Stored credentials for {}", username);
        return Ok(());
    }

    let controller = state::build_controller(&config, &credentials);
    let state = state::AppState::new(config, controller);

    if args.scan_once {
        // Single refresh mode
        info!("Running single refresh");
        let summary = state.registry.refresh().await?;
        println!("Discovered {} devices:", summary.found);
        for device in state.registry.devices().await {
            println!(
                "  {:<32} {:<20} {:?}{}",
                device.name,
                device.id,
                device.status,
                match &device.last_error {
                    Some(e) => format!(" ({})", e),
                    None => String::new(),
                }
            );
        }

        if state.cache.is_empty().await {
            println!("No switches found");
            return Ok(());
        }
        println!("{} switches:", summary.switches);
        for descriptor in state.registry.descriptors().await {
            let value = state.cache.get(descriptor.id).await?;
            println!(
                "  {:>3}  {:<32} {:<14} {}{}",
                descriptor.id,
                descriptor.name,
                format!("{:?}", descriptor.kind),
                value.value,
                if value.stale { " (stale)" } else { "" }
            );
        }
    } else {
        // Daemon mode - run Alpaca server and refresh loop
        server::run(state).await?;
    }

    Ok(())
}
