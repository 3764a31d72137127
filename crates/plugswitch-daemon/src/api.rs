//! Alpaca Switch API handlers
//!
//! All methods share two routes, with and without a trailing switch id, and
//! are dispatched by name. Parameter names are case-insensitive.

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Form,
};
use plugswitch_core::{AlpacaError, DeviceStatus, SwitchDescriptor};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::alpaca::{switch_id, AlpacaResponse, BadRequest, Failure, Params};
use crate::state::AppState;

pub const DRIVER_NAME: &str = "Plugswitch";
pub const DRIVER_DESCRIPTION: &str = "Alpaca switch bridge for smart plugs";
pub const INTERFACE_VERSION: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Get,
    Put,
}

pub async fn get_method(
    State(state): State<Arc<AppState>>,
    Path((device_number, method)): Path<(u32, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    dispatch(&state, Verb::Get, device_number, &method, None, Params::new(params)).await
}

pub async fn get_method_id(
    State(state): State<Arc<AppState>>,
    Path((device_number, method, id)): Path<(u32, String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    dispatch(&state, Verb::Get, device_number, &method, Some(&id), Params::new(params)).await
}

pub async fn put_method(
    State(state): State<Arc<AppState>>,
    Path((device_number, method)): Path<(u32, String)>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    dispatch(&state, Verb::Put, device_number, &method, None, Params::new(params)).await
}

pub async fn put_method_id(
    State(state): State<Arc<AppState>>,
    Path((device_number, method, id)): Path<(u32, String, String)>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    dispatch(&state, Verb::Put, device_number, &method, Some(&id), Params::new(params)).await
}

async fn dispatch(
    state: &AppState,
    verb: Verb,
    device_number: u32,
    method: &str,
    path_id: Option<&str>,
    params: Params,
) -> Response {
    if device_number != 0 {
        return BadRequest(format!("Switch device number {} does not exist", device_number))
            .into_response();
    }

    let client_id = params.client_id();
    let client_tx = params.client_transaction_id();
    state.sessions.touch(client_id, client_tx);

    let method = method.to_ascii_lowercase();
    let result = handle(state, verb, &method, path_id, &params, client_id, client_tx).await;

    match result {
        Ok(value) => AlpacaResponse::ok(value, client_tx, state.next_transaction()).into_response(),
        Err(Failure::Alpaca(err)) => {
            debug!(method = %method, client = client_id, error = %err, "Alpaca error");
            AlpacaResponse::error(&err, client_tx, state.next_transaction()).into_response()
        }
        Err(Failure::BadRequest(err)) => {
            debug!(method = %method, client = client_id, error = %err, "Bad request");
            err.into_response()
        }
    }
}

async fn handle(
    state: &AppState,
    verb: Verb,
    method: &str,
    path_id: Option<&str>,
    params: &Params,
    client_id: u32,
    client_tx: u32,
) -> Result<Option<Value>, Failure> {
    // Common device methods
    match (verb, method) {
        (Verb::Get, "connected") => return Ok(Some(json!(state.sessions.is_connected(client_id)))),
        (Verb::Put, "connected") => {
            if params.bool("Connected")? {
                state.sessions.connect(client_id, client_tx);
            } else {
                state.sessions.disconnect(client_id, client_tx);
            }
            return Ok(None);
        }
        (Verb::Put, "connect") => {
            state.sessions.connect(client_id, client_tx);
            return Ok(None);
        }
        (Verb::Put, "disconnect") => {
            state.sessions.disconnect(client_id, client_tx);
            return Ok(None);
        }
        (Verb::Get, "connecting") => return Ok(Some(json!(false))),
        (Verb::Get, "name") => return Ok(Some(json!(DRIVER_NAME))),
        (Verb::Get, "description") => return Ok(Some(json!(DRIVER_DESCRIPTION))),
        (Verb::Get, "driverinfo") => {
            return Ok(Some(json!(format!(
                "{} v{}",
                DRIVER_DESCRIPTION,
                env!("CARGO_PKG_VERSION")
            ))))
        }
        (Verb::Get, "driverversion") => return Ok(Some(json!(env!("CARGO_PKG_VERSION")))),
        (Verb::Get, "interfaceversion") => return Ok(Some(json!(INTERFACE_VERSION))),
        (Verb::Get, "supportedactions") => return Ok(Some(json!([]))),
        (Verb::Put, "action") => {
            let name = params.get("Action").unwrap_or_default().to_string();
            return Err(AlpacaError::ActionNotImplemented(name).into());
        }
        (Verb::Put, "commandblind" | "commandbool" | "commandstring") => {
            return Err(AlpacaError::NotImplemented(method.to_string()).into());
        }
        _ => {}
    }

    if !is_switch_method(verb, method) {
        return Err(BadRequest(format!("Unknown method {} {}", verb_name(verb), method)).into());
    }

    if method == "maxswitch" {
        ensure_connected(state, client_id)?;
        return Ok(Some(json!(state.registry.switch_count().await)));
    }

    // Per-switch methods: parse everything first so malformed input is a 400
    let id = switch_id(path_id, params)?;
    let requested = match method {
        "setswitch" => Some(if params.bool("State")? { 1.0 } else { 0.0 }),
        "setswitchvalue" => Some(params.f64("Value")?),
        _ => None,
    };

    ensure_connected(state, client_id)?;
    let descriptor = state
        .registry
        .descriptor(id)
        .await
        .ok_or(AlpacaError::InvalidDeviceNumber(id))?;

    match method {
        "canwrite" => Ok(Some(json!(descriptor.can_write()))),
        "getswitch" => {
            let value = state.cache.get(id).await.map_err(AlpacaError::from)?;
            Ok(Some(json!(value.value > descriptor.min_value)))
        }
        "getswitchvalue" => {
            let value = state.cache.get(id).await.map_err(AlpacaError::from)?;
            Ok(Some(json!(value.value)))
        }
        "getswitchname" => Ok(Some(json!(descriptor.name))),
        "getswitchdescription" => Ok(Some(json!(describe(state, &descriptor).await))),
        "minswitchvalue" => Ok(Some(json!(descriptor.min_value))),
        "maxswitchvalue" => Ok(Some(json!(descriptor.max_value))),
        "switchstep" => Ok(Some(json!(descriptor.step))),
        "setswitchname" => Err(AlpacaError::NotImplemented("SetSwitchName".to_string()).into()),
        "setswitch" | "setswitchvalue" => {
            let value = requested.unwrap_or_default();
            set_switch(state, &descriptor, value).await?;
            Ok(None)
        }
        _ => Err(BadRequest(format!("Unknown method {}", method)).into()),
    }
}

fn is_switch_method(verb: Verb, method: &str) -> bool {
    match verb {
        Verb::Get => matches!(
            method,
            "maxswitch"
                | "canwrite"
                | "getswitch"
                | "getswitchvalue"
                | "getswitchname"
                | "getswitchdescription"
                | "minswitchvalue"
                | "maxswitchvalue"
                | "switchstep"
        ),
        Verb::Put => matches!(method, "setswitch" | "setswitchvalue" | "setswitchname"),
    }
}

fn verb_name(verb: Verb) -> &'static str {
    match verb {
        Verb::Get => "GET",
        Verb::Put => "PUT",
    }
}

fn ensure_connected(state: &AppState, client_id: u32) -> Result<(), AlpacaError> {
    if state.config.server.require_connection && !state.sessions.is_connected(client_id) {
        return Err(AlpacaError::NotConnected(format!(
            "Client {} must connect first",
            client_id
        )));
    }
    Ok(())
}

/// Description with the owning device's health appended when degraded
async fn describe(state: &AppState, descriptor: &SwitchDescriptor) -> String {
    let Some(device) = state.registry.device(&descriptor.device).await else {
        return descriptor.description.clone();
    };
    if device.status == DeviceStatus::Unavailable {
        format!("{} [unavailable since {}]", descriptor.description, device.last_seen.to_rfc3339())
    } else if let Some(error) = &device.last_error {
        format!("{} [last poll failed: {}]", descriptor.description, error)
    } else {
        descriptor.description.clone()
    }
}

async fn set_switch(
    state: &AppState,
    descriptor: &SwitchDescriptor,
    value: f64,
) -> Result<(), AlpacaError> {
    if !descriptor.can_write() {
        return Err(AlpacaError::InvalidOperation(format!(
            "Switch {} is read-only",
            descriptor.id
        )));
    }
    if !descriptor.accepts(value) {
        return Err(AlpacaError::InvalidOperation(format!(
            "Value {} is outside {}..={} or not a multiple of {}",
            value, descriptor.min_value, descriptor.max_value, descriptor.step
        )));
    }
    state
        .registry
        .set_actuator(descriptor.id, value > descriptor.min_value)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::router;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        Router,
    };
    use plugswitch_control::{MemoryController, SimulatedPlug};
    use plugswitch_core::{DeviceId, TelemetryChannel};
    use std::time::Duration;
    use tokio::task::JoinSet;
    use tower::ServiceExt;

    async fn setup(config: Config) -> (Router, Arc<AppState>, Arc<MemoryController>) {
        let controller = Arc::new(MemoryController::new([
            SimulatedPlug::new("p1", "Plug1"),
            SimulatedPlug::new("p2", "Plug2").with_channels([TelemetryChannel::Power]),
        ]));
        let state = AppState::new(config, controller.clone());
        state.registry.refresh().await.unwrap();
        (router(state.clone()), state, controller)
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        send(app, req).await
    }

    async fn put(app: &Router, uri: &str, form: &str) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("PUT")
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(form.to_string()))
            .unwrap();
        send(app, req).await
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, body)
    }

    #[tokio::test]
    async fn test_maxswitch_and_ids() {
        let (app, _, _) = setup(Config::default()).await;

        let (status, body) = get(&app, "/api/v1/switch/0/maxswitch").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["Value"], 3);
        assert_eq!(body["ErrorNumber"], 0);

        for method in ["getswitchname", "getswitch", "getswitchvalue"] {
            for id in 0..3 {
                let (status, body) = get(&app, &format!("/api/v1/switch/0/{}/{}", method, id)).await;
                assert_eq!(status, StatusCode::OK);
                assert_eq!(body["ErrorNumber"], 0, "{} {}", method, id);
            }

            // MaxSwitch itself is out of range
            let (status, body) = get(&app, &format!("/api/v1/switch/0/{}/3", method)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["ErrorNumber"], 0x401, "{}", method);
        }

        let (_, body) = get(&app, "/api/v1/switch/0/getswitch?Id=-1").await;
        assert_eq!(body["ErrorNumber"], 0x401);
    }

    #[tokio::test]
    async fn test_descriptor_values() {
        let (app, _, _) = setup(Config::default()).await;

        let (_, body) = get(&app, "/api/v1/switch/0/getswitchname/2").await;
        assert_eq!(body["Value"], "Plug2 Power");
        let (_, body) = get(&app, "/api/v1/switch/0/canwrite/2").await;
        assert_eq!(body["Value"], false);
        let (_, body) = get(&app, "/api/v1/switch/0/canwrite?id=1").await;
        assert_eq!(body["Value"], true);
        let (_, body) = get(&app, "/api/v1/switch/0/maxswitchvalue/0").await;
        assert_eq!(body["Value"], 1.0);
        let (_, body) = get(&app, "/api/v1/switch/0/switchstep/0").await;
        assert_eq!(body["Value"], 1.0);
        let (_, body) = get(&app, "/api/v1/switch/0/getswitchdescription/0").await;
        assert!(body["Value"].as_str().unwrap().starts_with("Plug1 (GUID: "));

        let (_, body) = get(&app, "/api/v1/switch/0/minswitchvalue/2").await;
        assert_eq!(body["Value"], 0.0);
        let (_, body) = get(&app, "/api/v1/switch/0/maxswitchvalue/2").await;
        assert_eq!(body["Value"].as_f64(), Some(f64::MAX));
    }

    #[tokio::test]
    async fn test_set_then_read() {
        let (app, _, controller) = setup(Config::default()).await;

        let (status, body) = put(
            &app,
            "/api/v1/switch/0/setswitch/0",
            "State=true&ClientID=1&ClientTransactionID=5",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ErrorNumber"], 0);
        assert_eq!(body["ClientTransactionID"], 5);

        let (_, body) = get(&app, "/api/v1/switch/0/getswitch/0").await;
        assert_eq!(body["Value"], true);
        let (_, body) = get(&app, "/api/v1/switch/0/getswitchvalue/0").await;
        assert_eq!(body["Value"], 1.0);
        assert_eq!(controller.command_count(&DeviceId::new("p1")), 1);

        // Same value again still reaches the device
        put(&app, "/api/v1/switch/0/setswitchvalue/0", "Value=1").await;
        assert_eq!(controller.command_count(&DeviceId::new("p1")), 2);

        let (_, body) = put(&app, "/api/v1/switch/0/setswitchvalue/0", "Value=0").await;
        assert_eq!(body["ErrorNumber"], 0);
        let (_, body) = get(&app, "/api/v1/switch/0/getswitchvalue/0").await;
        assert_eq!(body["Value"], 0.0);
        let (_, body) = get(&app, "/api/v1/switch/0/getswitch/0").await;
        assert_eq!(body["Value"], false);
        assert_eq!(controller.is_on(&DeviceId::new("p1")), Some(false));
    }

    #[tokio::test]
    async fn test_concurrent_setswitch() {
        let (app, state, controller) = setup(Config::default()).await;
        controller.set_delay(Some(Duration::from_millis(5)));

        let mut tasks = JoinSet::new();
        for i in 0..16 {
            let app = app.clone();
            let form = format!("State={}&ClientID={}", i % 2 == 0, i);
            tasks.spawn(async move { put(&app, "/api/v1/switch/0/setswitch/0", &form).await });
        }
        while let Some(result) = tasks.join_next().await {
            let (status, body) = result.unwrap();
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["ErrorNumber"], 0);
        }

        let p1 = DeviceId::new("p1");
        assert_eq!(controller.command_count(&p1), 16);
        let cached = state.cache.get(0).await.unwrap().as_bool();
        assert_eq!(Some(cached), controller.is_on(&p1));

        let (_, body) = get(&app, "/api/v1/switch/0/getswitch/0").await;
        assert_eq!(body["Value"], cached);
    }

    #[tokio::test]
    async fn test_out_of_range_value_rejected() {
        let (app, state, controller) = setup(Config::default()).await;

        let (status, body) = put(&app, "/api/v1/switch/0/setswitchvalue/0", "Value=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ErrorNumber"], 0x40B);

        let (_, body) = put(&app, "/api/v1/switch/0/setswitchvalue/0", "Value=0.5").await;
        assert_eq!(body["ErrorNumber"], 0x40B);

        assert_eq!(state.cache.get(0).await.unwrap().value, 0.0);
        assert_eq!(controller.command_count(&DeviceId::new("p1")), 0);
    }

    #[tokio::test]
    async fn test_gauge_write_rejected() {
        let (app, _, _) = setup(Config::default()).await;
        let (_, body) = put(&app, "/api/v1/switch/0/setswitch/2", "State=true").await;
        assert_eq!(body["ErrorNumber"], 0x40B);
        let (_, body) = put(&app, "/api/v1/switch/0/setswitch/9", "State=true").await;
        assert_eq!(body["ErrorNumber"], 0x401);
    }

    #[tokio::test]
    async fn test_device_failure_is_driver_error() {
        let (app, state, controller) = setup(Config::default()).await;
        controller.set_command_error(&DeviceId::new("p2"), Some("relay stuck"));

        let (_, body) = put(&app, "/api/v1/switch/0/setswitch/1", "State=true").await;
        assert_eq!(body["ErrorNumber"], 0x500);
        assert!(body["ErrorMessage"].as_str().unwrap().contains("relay stuck"));
        assert_eq!(state.cache.get(1).await.unwrap().value, 0.0);
    }

    #[tokio::test]
    async fn test_malformed_requests() {
        let (app, _, _) = setup(Config::default()).await;

        let (status, _) = get(&app, "/api/v1/switch/1/maxswitch").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get(&app, "/api/v1/switch/abc/maxswitch").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get(&app, "/api/v1/switch/0/getswitch/one").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = put(&app, "/api/v1/switch/0/setswitch/0", "State=maybe").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = put(&app, "/api/v1/switch/0/setswitchvalue/0", "").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = get(&app, "/api/v1/switch/0/frobnicate").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_transaction_ids() {
        let (app, _, _) = setup(Config::default()).await;

        let (_, first) = get(&app, "/api/v1/switch/0/maxswitch?ClientTransactionID=42").await;
        let (_, second) = get(&app, "/api/v1/switch/0/maxswitch?clienttransactionid=bogus").await;
        assert_eq!(first["ClientTransactionID"], 42);
        assert_eq!(second["ClientTransactionID"], 0);
        assert!(second["ServerTransactionID"].as_u64() > first["ServerTransactionID"].as_u64());
    }

    #[tokio::test]
    async fn test_connect_lifecycle() {
        let (app, state, _) = setup(Config::default()).await;

        put(&app, "/api/v1/switch/0/connected", "Connected=true&ClientID=1").await;
        put(&app, "/api/v1/switch/0/connect", "ClientID=2").await;
        let (_, body) = get(&app, "/api/v1/switch/0/connected?ClientID=2").await;
        assert_eq!(body["Value"], true);

        put(&app, "/api/v1/switch/0/connected", "Connected=false&ClientID=1").await;
        assert!(!state.shutdown.is_cancelled());

        put(&app, "/api/v1/switch/0/disconnect", "ClientID=2").await;
        assert!(state.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_concurrent_connect_and_disconnect() {
        let (app, state, _) = setup(Config::default()).await;
        let clients: Vec<u32> = (1..=12).collect();

        let mut tasks = JoinSet::new();
        for id in clients.clone() {
            let app = app.clone();
            tasks.spawn(async move {
                put(&app, "/api/v1/switch/0/connected", &format!("Connected=true&ClientID={}", id))
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap().1["ErrorNumber"], 0);
        }
        for id in &clients {
            let (_, body) = get(&app, &format!("/api/v1/switch/0/connected?ClientID={}", id)).await;
            assert_eq!(body["Value"], true);
        }

        // Everyone but the last client leaves at once
        let mut tasks = JoinSet::new();
        for id in clients[1..].iter().copied() {
            let app = app.clone();
            tasks.spawn(async move {
                put(&app, "/api/v1/switch/0/disconnect", &format!("ClientID={}", id)).await
            });
        }
        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap().1["ErrorNumber"], 0);
        }
        assert!(!state.shutdown.is_cancelled());
        assert!(state.sessions.any_connected());

        put(&app, "/api/v1/switch/0/disconnect", "ClientID=1").await;
        assert!(state.shutdown.is_cancelled());
        assert!(!state.sessions.any_connected());
    }

    #[tokio::test]
    async fn test_require_connection() {
        let mut config = Config::default();
        config.server.require_connection = true;
        let (app, _, _) = setup(config).await;

        let (_, body) = get(&app, "/api/v1/switch/0/getswitch/0?ClientID=3").await;
        assert_eq!(body["ErrorNumber"], 0x407);

        put(&app, "/api/v1/switch/0/connected", "Connected=true&ClientID=3").await;
        let (_, body) = get(&app, "/api/v1/switch/0/getswitch/0?ClientID=3").await;
        assert_eq!(body["ErrorNumber"], 0);
    }

    #[tokio::test]
    async fn test_unsupported_commands() {
        let (app, _, _) = setup(Config::default()).await;

        let (_, body) = put(&app, "/api/v1/switch/0/action", "Action=Foo&Parameters=").await;
        assert_eq!(body["ErrorNumber"], 0x40C);
        let (_, body) = put(&app, "/api/v1/switch/0/commandblind", "Command=x&Raw=true").await;
        assert_eq!(body["ErrorNumber"], 0x400);
        let (_, body) = put(&app, "/api/v1/switch/0/setswitchname/0", "Name=Heater").await;
        assert_eq!(body["ErrorNumber"], 0x400);
        let (_, body) = get(&app, "/api/v1/switch/0/interfaceversion").await;
        assert_eq!(body["Value"], 3);
    }
}
