//! Alpaca request parameters and response envelope

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use plugswitch_core::AlpacaError;
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

/// Malformed request, answered with HTTP 400 and a plain-text reason
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct BadRequest(pub String);

impl IntoResponse for BadRequest {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, self.0).into_response()
    }
}

/// Why an Alpaca method did not produce a value
#[derive(Debug)]
pub enum Failure {
    /// HTTP 400
    BadRequest(BadRequest),
    /// HTTP 200 with a non-zero ErrorNumber
    Alpaca(AlpacaError),
}

impl From<BadRequest> for Failure {
    fn from(err: BadRequest) -> Self {
        Self::BadRequest(err)
    }
}

impl From<AlpacaError> for Failure {
    fn from(err: AlpacaError) -> Self {
        Self::Alpaca(err)
    }
}

/// Request parameters with case-insensitive names
#[derive(Debug, Clone, Default)]
pub struct Params(HashMap<String, String>);

impl Params {
    pub fn new(raw: HashMap<String, String>) -> Self {
        Self(
            raw.into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(|v| v.trim())
    }

    /// `ClientID`, 0 when missing or invalid
    pub fn client_id(&self) -> u32 {
        self.lenient_u32("ClientID")
    }

    /// `ClientTransactionID`, 0 when missing or invalid
    pub fn client_transaction_id(&self) -> u32 {
        self.lenient_u32("ClientTransactionID")
    }

    fn lenient_u32(&self, name: &str) -> u32 {
        self.get(name).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    /// Required boolean parameter (`true`/`false`, any case)
    pub fn bool(&self, name: &str) -> Result<bool, BadRequest> {
        let raw = self.required(name)?;
        match raw.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(BadRequest(format!("{} must be true or false, got '{}'", name, raw))),
        }
    }

    /// Required numeric parameter
    pub fn f64(&self, name: &str) -> Result<f64, BadRequest> {
        let raw = self.required(name)?;
        raw.parse()
            .map_err(|_| BadRequest(format!("{} must be a number, got '{}'", name, raw)))
    }

    fn required(&self, name: &str) -> Result<&str, BadRequest> {
        self.get(name)
            .ok_or_else(|| BadRequest(format!("Missing parameter {}", name)))
    }
}

/// Switch number from the path segment or the `Id` parameter
///
/// Non-integers are malformed; negative numbers are well-formed but invalid.
pub fn switch_id(path_id: Option<&str>, params: &Params) -> Result<usize, Failure> {
    let raw = path_id
        .map(str::trim)
        .or_else(|| params.get("Id"))
        .ok_or_else(|| BadRequest("Missing switch id".to_string()))?;
    let id: i64 = raw
        .parse()
        .map_err(|_| BadRequest(format!("Switch id must be an integer, got '{}'", raw)))?;
    if id < 0 {
        return Err(AlpacaError::InvalidValue(format!("Switch {} does not exist", id)).into());
    }
    usize::try_from(id).map_err(|_| AlpacaError::InvalidValue(format!("Switch {} does not exist", id)).into())
}

/// Standard Alpaca response body
#[derive(Debug, Serialize)]
pub struct AlpacaResponse {
    #[serde(rename = "Value", skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(rename = "ClientTransactionID")]
    pub client_transaction_id: u32,
    #[serde(rename = "ServerTransactionID")]
    pub server_transaction_id: u32,
    #[serde(rename = "ErrorNumber")]
    pub error_number: i32,
    #[serde(rename = "ErrorMessage")]
    pub error_message: String,
}

impl AlpacaResponse {
    pub fn ok(value: Option<serde_json::Value>, client_tx: u32, server_tx: u32) -> Self {
        Self {
            value,
            client_transaction_id: client_tx,
            server_transaction_id: server_tx,
            error_number: 0,
            error_message: String::new(),
        }
    }

    pub fn error(err: &AlpacaError, client_tx: u32, server_tx: u32) -> Self {
        Self {
            value: None,
            client_transaction_id: client_tx,
            server_transaction_id: server_tx,
            error_number: err.error_number(),
            error_message: err.to_string(),
        }
    }
}

impl IntoResponse for AlpacaResponse {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}
