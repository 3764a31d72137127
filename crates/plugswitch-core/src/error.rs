//! Alpaca error taxonomy
//!
//! Protocol failures are reported in the response body as an
//! `ErrorNumber`/`ErrorMessage` pair, not as HTTP status codes.

use thiserror::Error;

use crate::cache::CacheError;

/// Alpaca error numbers
pub mod codes {
    pub const NOT_IMPLEMENTED: i32 = 0x400;
    pub const INVALID_VALUE: i32 = 0x401;
    pub const NOT_CONNECTED: i32 = 0x407;
    pub const INVALID_OPERATION: i32 = 0x40B;
    pub const ACTION_NOT_IMPLEMENTED: i32 = 0x40C;
    pub const DRIVER_ERROR: i32 = 0x500;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlpacaError {
    #[error("{0} is not implemented")]
    NotImplemented(String),
    #[error("Switch {0} does not exist")]
    InvalidDeviceNumber(usize),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Not connected: {0}")]
    NotConnected(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Action {0} is not implemented")]
    ActionNotImplemented(String),
    #[error("{0}")]
    DriverError(String),
}

impl AlpacaError {
    pub fn error_number(&self) -> i32 {
        match self {
            Self::NotImplemented(_) => codes::NOT_IMPLEMENTED,
            Self::InvalidDeviceNumber(_) | Self::InvalidValue(_) => codes::INVALID_VALUE,
            Self::NotConnected(_) => codes::NOT_CONNECTED,
            Self::InvalidOperation(_) => codes::INVALID_OPERATION,
            Self::ActionNotImplemented(_) => codes::ACTION_NOT_IMPLEMENTED,
            Self::DriverError(_) => codes::DRIVER_ERROR,
        }
    }
}

impl From<CacheError> for AlpacaError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::NotFound(id) => Self::InvalidDeviceNumber(id),
            CacheError::InvalidOperation(id) => {
                Self::InvalidOperation(format!("Switch {} is read-only", id))
            }
            e @ CacheError::OutOfOrder { .. } => Self::DriverError(e.to_string()),
        }
    }
}
