//! Web server setup and lifecycle

use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::api;
use crate::beacon;
use crate::management;
use crate::state::AppState;

/// Build the Alpaca router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Switch device API
        .route(
            "/api/v1/switch/{device_number}/{method}",
            get(api::get_method).put(api::put_method),
        )
        .route(
            "/api/v1/switch/{device_number}/{method}/{id}",
            get(api::get_method_id).put(api::put_method_id),
        )
        // Management API
        .route("/management/apiversions", get(management::api_versions))
        .route("/management/v1/description", get(management::description))
        .route(
            "/management/v1/configureddevices",
            get(management::configured_devices),
        )
        // CORS
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the server until shutdown is requested
///
/// Shutdown comes from Ctrl-C or from the last client disconnecting. The
/// refresh loop and discovery responder stop with the listener.
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let bind = state.config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    let port = listener.local_addr()?.port();
    let shutdown = state.shutdown.clone();

    // Device refresh loop
    let registry = state.registry.clone();
    let refresh = {
        let cancel = shutdown.clone();
        tokio::spawn(async move { registry.run(cancel).await })
    };

    // Alpaca discovery responder
    let discovery_port = state.config.server.discovery_port;
    if discovery_port != 0 {
        match beacon::bind(&state.config.server.bind, discovery_port).await {
            Ok(socket) => {
                let cancel = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(e) = beacon::run(socket, port, cancel).await {
                        error!(error = %e, "Discovery responder failed");
                    }
                });
            }
            Err(e) => warn!(port = discovery_port, error = %e, "Alpaca discovery disabled"),
        }
    }

    // Ctrl-C
    {
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    info!(address = %bind, protocol = "HTTP", "Starting Alpaca server");
    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    if let Err(e) = refresh.await {
        warn!(error = %e, "Refresh loop ended abnormally");
    }
    info!(
        clients = state.sessions.sessions().len(),
        connected = state.sessions.any_connected(),
        "Server stopped"
    );
    Ok(())
}
