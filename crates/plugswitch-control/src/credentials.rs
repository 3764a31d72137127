//! Vendor account credential storage

use secrecy::{ExposeSecret, SecretString};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

/// Keyring service the credentials are stored under
pub const KEYRING_SERVICE: &str = "kasa-alpaca";

const USERNAME_KEY: &str = "email";
const SECRET_KEY: &str = "password";

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("No credentials stored")]
    NotFound,
    #[error("Secret store error: {0}")]
    Store(String),
}

impl From<keyring::Error> for CredentialError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::NoEntry => Self::NotFound,
            other => Self::Store(other.to_string()),
        }
    }
}

/// Vendor account username and secret
pub struct Credentials {
    pub username: String,
    pub secret: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: SecretString::from(secret.into()),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Capability for reading and storing vendor account credentials
pub trait CredentialProvider: Send + Sync {
    fn get(&self) -> Result<Credentials, CredentialError>;
    fn set(&self, username: &str, secret: &str) -> Result<(), CredentialError>;
}

/// Credentials kept in the platform secret store
#[derive(Debug, Clone)]
pub struct KeyringCredentials {
    service: String,
}

impl KeyringCredentials {
    pub fn new() -> Self {
        Self::with_service(KEYRING_SERVICE)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, CredentialError> {
        Ok(keyring::Entry::new(&self.service, key)?)
    }
}

impl Default for KeyringCredentials {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialProvider for KeyringCredentials {
    fn get(&self) -> Result<Credentials, CredentialError> {
        let username = self.entry(USERNAME_KEY)?.get_password()?;
        let secret = self.entry(SECRET_KEY)?.get_password()?;
        if username.is_empty() || secret.is_empty() {
            return Err(CredentialError::NotFound);
        }
        debug!(service = %self.service, "Loaded credentials from keyring");
        Ok(Credentials::new(username, secret))
    }

    fn set(&self, username: &str, secret: &str) -> Result<(), CredentialError> {
        self.entry(USERNAME_KEY)?.set_password(username)?;
        self.entry(SECRET_KEY)?.set_password(secret)?;
        info!(service = %self.service, "Stored credentials in keyring");
        Ok(())
    }
}

/// Credentials held in memory, for tests and ephemeral setups
#[derive(Debug, Default)]
pub struct MemoryCredentials {
    stored: Mutex<Option<(String, String)>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialProvider for MemoryCredentials {
    fn get(&self) -> Result<Credentials, CredentialError> {
        let stored = self.stored.lock().unwrap_or_else(|e| e.into_inner());
        stored
            .as_ref()
            .map(|(username, secret)| Credentials::new(username.clone(), secret.clone()))
            .ok_or(CredentialError::NotFound)
    }

    fn set(&self, username: &str, secret: &str) -> Result<(), CredentialError> {
        let mut stored = self.stored.lock().unwrap_or_else(|e| e.into_inner());
        *stored = Some((username.to_string(), secret.to_string()));
        Ok(())
    }
}

/// Secret text for handing to the vendor tool
pub fn expose(credentials: &Credentials) -> &str {
    credentials.secret.expose_secret()
}
