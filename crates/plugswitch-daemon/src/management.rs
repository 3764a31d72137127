//! Alpaca management API

use axum::{
    extract::{Query, State},
    response::IntoResponse,
};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use crate::alpaca::{AlpacaResponse, Params};
use crate::api::DRIVER_NAME;
use crate::state::AppState;

pub const SERVER_NAME: &str = "Plugswitch Alpaca Server";
pub const MANUFACTURER: &str = "Plugswitch";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServerDescription {
    server_name: &'static str,
    manufacturer: &'static str,
    manufacturer_version: &'static str,
    location: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ConfiguredDevice {
    device_name: &'static str,
    device_type: &'static str,
    device_number: u32,
    #[serde(rename = "UniqueID")]
    unique_id: String,
}

fn respond(state: &AppState, params: HashMap<String, String>, value: serde_json::Value) -> AlpacaResponse {
    let params = Params::new(params);
    AlpacaResponse::ok(
        Some(value),
        params.client_transaction_id(),
        state.next_transaction(),
    )
}

/// Supported management API versions
pub async fn api_versions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    respond(&state, params, json!([1]))
}

/// Server description
pub async fn description(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let description = ServerDescription {
        server_name: SERVER_NAME,
        manufacturer: MANUFACTURER,
        manufacturer_version: env!("CARGO_PKG_VERSION"),
        location: state.config.server.location.clone(),
    };
    respond(&state, params, json!(description))
}

/// The single Switch device this server exposes
pub async fn configured_devices(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let devices = vec![ConfiguredDevice {
        device_name: DRIVER_NAME,
        device_type: "Switch",
        device_number: 0,
        unique_id: state.config.unique_id(),
    }];
    respond(&state, params, json!(devices))
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::server::router;
    use crate::state::AppState;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use plugswitch_control::MemoryController;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn get(uri: &str, config: Config) -> Value {
        let state = AppState::new(config, Arc::new(MemoryController::default()));
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = router(state).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_api_versions() {
        let body = get("/management/apiversions?ClientTransactionID=8", Config::default()).await;
        assert_eq!(body["Value"], serde_json::json!([1]));
        assert_eq!(body["ClientTransactionID"], 8);
    }

    #[tokio::test]
    async fn test_description() {
        let mut config = Config::default();
        config.server.location = "Roll-off roof".to_string();
        let body = get("/management/v1/description", config).await;
        assert_eq!(body["Value"]["Location"], "Roll-off roof");
        assert_eq!(body["Value"]["ServerName"], "Plugswitch Alpaca Server");
    }

    #[tokio::test]
    async fn test_configured_devices() {
        let mut config = Config::default();
        config.server.unique_id = Some("abc-123".to_string());
        let body = get("/management/v1/configureddevices", config).await;
        let device = &body["Value"][0];
        assert_eq!(device["DeviceType"], "Switch");
        assert_eq!(device["DeviceNumber"], 0);
        assert_eq!(device["UniqueID"], "abc-123");
    }
}
