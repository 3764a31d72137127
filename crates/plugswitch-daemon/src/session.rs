//! Client connection tracking and auto-shutdown
//!
//! Alpaca clients announce themselves with `PUT connected`. The server stays
//! up while at least one client is connected; when the last one disconnects
//! the shutdown token is cancelled (unless auto-shutdown is disabled).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Connection state of one Alpaca client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSession {
    pub client_id: u32,
    pub connected: bool,
    /// Last ClientTransactionID seen from this client
    pub last_transaction: u32,
    pub connected_at: Option<DateTime<Utc>>,
}

impl ClientSession {
    fn new(client_id: u32) -> Self {
        Self {
            client_id,
            connected: false,
            last_transaction: 0,
            connected_at: None,
        }
    }
}

/// Change of the aggregate "any client connected" flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    FirstConnected,
    LastDisconnected,
}

pub struct SessionLifecycleManager {
    sessions: Mutex<HashMap<u32, ClientSession>>,
    auto_shutdown: bool,
    shutdown: CancellationToken,
}

impl SessionLifecycleManager {
    pub fn new(auto_shutdown: bool, shutdown: CancellationToken) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            auto_shutdown,
            shutdown,
        }
    }

    fn with_sessions<T>(&self, f: impl FnOnce(&mut HashMap<u32, ClientSession>) -> T) -> T {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut sessions)
    }

    /// Mark a client connected
    pub fn connect(&self, client_id: u32, transaction: u32) -> Transition {
        let transition = self.with_sessions(|sessions| {
            let was_any = sessions.values().any(|s| s.connected);
            let session = sessions
                .entry(client_id)
                .or_insert_with(|| ClientSession::new(client_id));
            session.last_transaction = transaction;
            if !session.connected {
                session.connected = true;
                session.connected_at = Some(Utc::now());
            }
            if was_any {
                Transition::Unchanged
            } else {
                Transition::FirstConnected
            }
        });

        info!(client = client_id, "Client connected");
        if transition == Transition::FirstConnected {
            debug!("First client connected");
        }
        transition
    }

    /// Mark a client disconnected, shutting down after the last one
    pub fn disconnect(&self, client_id: u32, transaction: u32) -> Transition {
        let transition = self.with_sessions(|sessions| {
            let Some(session) = sessions.get_mut(&client_id) else {
                return Transition::Unchanged;
            };
            session.last_transaction = transaction;
            if !session.connected {
                return Transition::Unchanged;
            }
            session.connected = false;
            session.connected_at = None;
            if sessions.values().any(|s| s.connected) {
                Transition::Unchanged
            } else {
                Transition::LastDisconnected
            }
        });

        info!(client = client_id, "Client disconnected");
        if transition == Transition::LastDisconnected {
            if self.auto_shutdown {
                info!("Last client disconnected, shutting down");
                self.shutdown.cancel();
            } else {
                info!("Last client disconnected, auto-shutdown disabled");
            }
        }
        transition
    }

    /// Record a request from a known client
    pub fn touch(&self, client_id: u32, transaction: u32) {
        self.with_sessions(|sessions| {
            if let Some(session) = sessions.get_mut(&client_id) {
                session.last_transaction = transaction;
            }
        });
    }

    pub fn is_connected(&self, client_id: u32) -> bool {
        self.with_sessions(|sessions| sessions.get(&client_id).is_some_and(|s| s.connected))
    }

    /// Aggregate flag over all sessions
    pub fn any_connected(&self) -> bool {
        self.with_sessions(|sessions| sessions.values().any(|s| s.connected))
    }

    pub fn sessions(&self) -> Vec<ClientSession> {
        let mut sessions: Vec<_> = self.with_sessions(|s| s.values().cloned().collect());
        sessions.sort_by_key(|s| s.client_id);
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_clients_lifecycle() {
        let token = CancellationToken::new();
        let manager = SessionLifecycleManager::new(true, token.clone());

        assert_eq!(manager.connect(1, 10), Transition::FirstConnected);
        assert_eq!(manager.connect(2, 20), Transition::Unchanged);
        assert!(manager.any_connected());

        assert_eq!(manager.disconnect(1, 11), Transition::Unchanged);
        assert!(!token.is_cancelled());
        assert!(!manager.is_connected(1));
        assert!(manager.is_connected(2));

        assert_eq!(manager.disconnect(2, 21), Transition::LastDisconnected);
        assert!(token.is_cancelled());
        assert!(!manager.any_connected());
    }

    #[test]
    fn test_auto_shutdown_disabled() {
        let token = CancellationToken::new();
        let manager = SessionLifecycleManager::new(false, token.clone());

        manager.connect(1, 1);
        assert_eq!(manager.disconnect(1, 2), Transition::LastDisconnected);
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_disconnect_without_connect() {
        let token = CancellationToken::new();
        let manager = SessionLifecycleManager::new(true, token.clone());

        assert_eq!(manager.disconnect(7, 1), Transition::Unchanged);
        manager.connect(7, 2);
        manager.disconnect(7, 3);
        assert_eq!(manager.disconnect(7, 4), Transition::Unchanged);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_reconnect_is_idempotent() {
        let manager = SessionLifecycleManager::new(true, CancellationToken::new());
        assert_eq!(manager.connect(3, 1), Transition::FirstConnected);
        assert_eq!(manager.connect(3, 2), Transition::Unchanged);
        manager.touch(3, 9);

        let sessions = manager.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].last_transaction, 9);
        assert!(sessions[0].connected_at.is_some());
    }
}
