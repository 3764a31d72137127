//! Plugswitch Control - Vendor-facing capabilities
//!
//! This crate wraps the smart-plug vendor tooling behind the
//! [`DeviceController`] trait and provides credential storage for the
//! vendor account.

pub mod controller;
pub mod credentials;
pub mod kasacmd;
pub mod memory;

pub use controller::{ControllerError, DeviceController, DEFAULT_TIMEOUT};
pub use credentials::{CredentialError, CredentialProvider, Credentials, KeyringCredentials, MemoryCredentials};
pub use kasacmd::KasaCmdController;
pub use memory::{MemoryController, SimulatedPlug};
