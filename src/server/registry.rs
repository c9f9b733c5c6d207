//! Connection registry
//!
//! Maps each client role to at most one live connection. Registering a role
//! that is already bound replaces the old binding; the displaced connection
//! stays open but stops receiving routed traffic.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors raised when pushing a message onto a connection
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection {0} is closed")]
    Closed(Uuid),

    #[error("send to connection {0} timed out after {1:?}")]
    Timeout(Uuid, Duration),
}

/// Logical identity of a connected party
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Viewer/UI client issuing commands and receiving frames
    Control,
    /// Rendering tool agent executing relayed commands
    Execution,
}

impl Role {
    /// All roles, in a stable order
    pub const ALL: [Role; 2] = [Role::Control, Role::Execution];

    /// Wire name of the role
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Control => "control",
            Role::Execution => "execution",
        }
    }

    /// Derive a role from the last non-empty segment of a request path
    ///
    /// `/control`, `/ws/control/` and `/execution` are accepted; anything
    /// else yields `None`.
    pub fn from_path(path: &str) -> Option<Self> {
        let segment = path.split('/').rev().find(|s| !s.is_empty())?;
        Self::ALL.into_iter().find(|role| role.as_str() == segment)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cloneable handle used to push messages to one connection
///
/// Messages are queued for the connection's writer task, which owns the
/// socket sink.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    role: Role,
    tx: mpsc::Sender<Message>,
    send_timeout: Duration,
}

impl ConnectionHandle {
    /// Create a handle over a connection's outbound queue
    pub fn new(role: Role, tx: mpsc::Sender<Message>, send_timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            tx,
            send_timeout,
        }
    }

    /// Connection identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Role this connection was accepted as
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the writer side is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a text message, waiting at most the configured send timeout
    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.send(Message::Text(text)).await
    }

    /// Queue a raw transport message
    pub async fn send(&self, message: Message) -> Result<(), TransportError> {
        match self.tx.send_timeout(message, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => Err(TransportError::Closed(self.id)),
            Err(SendTimeoutError::Timeout(_)) => {
                Err(TransportError::Timeout(self.id, self.send_timeout))
            }
        }
    }
}

/// A registered connection
#[derive(Debug, Clone)]
pub struct Connection {
    /// Role the connection is bound to
    pub role: Role,
    /// Handle for routing traffic to it
    pub handle: ConnectionHandle,
    /// When the connection was accepted
    pub established_at: Instant,
}

impl Connection {
    /// Wrap a handle as a freshly established connection
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            role: handle.role(),
            handle,
            established_at: Instant::now(),
        }
    }
}

/// Role → connection table shared by the connection handlers, relay
/// handlers and the broadcast loop
///
/// The lock is never held across an await point.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Role, Connection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to its role, returning any displaced binding
    pub fn register(&self, connection: Connection) -> Option<Connection> {
        let role = connection.role;
        let id = connection.handle.id();
        let previous = self.connections.write().insert(role, connection);

        match &previous {
            Some(old) => warn!(
                "Replacing {} connection {} with {}",
                role,
                old.handle.id(),
                id
            ),
            None => info!("Registered {} connection {}", role, id),
        }
        previous
    }

    /// Remove the binding for a role; no-op when nothing is bound
    #[allow(dead_code)]
    pub fn unregister(&self, role: Role) -> Option<Connection> {
        let removed = self.connections.write().remove(&role);
        if let Some(conn) = &removed {
            info!("Unregistered {} connection {}", role, conn.handle.id());
        }
        removed
    }

    /// Remove the binding only if it still belongs to `connection_id`
    ///
    /// A replaced connection that closes late must not evict its successor.
    pub fn unregister_connection(&self, role: Role, connection_id: Uuid) -> bool {
        let mut connections = self.connections.write();
        match connections.get(&role) {
            Some(conn) if conn.handle.id() == connection_id => {
                connections.remove(&role);
                info!("Unregistered {} connection {}", role, connection_id);
                true
            }
            Some(_) => {
                debug!(
                    "Connection {} no longer bound to {}, leaving registry unchanged",
                    connection_id, role
                );
                false
            }
            None => false,
        }
    }

    /// Current handle for a role; `None` means the counterpart is unavailable
    pub fn get(&self, role: Role) -> Option<ConnectionHandle> {
        self.connections
            .read()
            .get(&role)
            .map(|conn| conn.handle.clone())
    }

    /// Whether `role` is now bound to a connection other than `connection_id`
    pub fn is_superseded(&self, role: Role, connection_id: Uuid) -> bool {
        self.connections
            .read()
            .get(&role)
            .is_some_and(|conn| conn.handle.id() != connection_id)
    }

    /// Whether a role currently has a connection
    pub fn is_connected(&self, role: Role) -> bool {
        self.connections.read().contains_key(&role)
    }

    /// Roles with a live binding
    pub fn connected_roles(&self) -> Vec<Role> {
        let connections = self.connections.read();
        Role::ALL
            .into_iter()
            .filter(|role| connections.contains_key(role))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(role: Role) -> (ConnectionHandle, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(4);
        (
            ConnectionHandle::new(role, tx, Duration::from_millis(50)),
            rx,
        )
    }

    #[test]
    fn test_role_from_path() {
        assert_eq!(Role::from_path("/control"), Some(Role::Control));
        assert_eq!(Role::from_path("/ws/execution"), Some(Role::Execution));
        assert_eq!(Role::from_path("/ws/control/"), Some(Role::Control));
        assert_eq!(Role::from_path("/ws/viewer"), None);
        assert_eq!(Role::from_path("/"), None);
        assert_eq!(Role::from_path(""), None);
    }

    #[test]
    fn test_register_and_get() {
        let registry = ConnectionRegistry::new();
        assert!(registry.get(Role::Control).is_none());

        let (h, _rx) = handle(Role::Control);
        let id = h.id();
        assert!(registry.register(Connection::new(h)).is_none());

        assert_eq!(registry.get(Role::Control).unwrap().id(), id);
        assert!(registry.get(Role::Execution).is_none());
        assert_eq!(registry.connected_roles(), vec![Role::Control]);
    }

    #[test]
    fn test_register_replaces_existing_binding() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle(Role::Control);
        let (second, _rx2) = handle(Role::Control);
        let first_id = first.id();
        let second_id = second.id();

        registry.register(Connection::new(first));
        let displaced = registry.register(Connection::new(second)).unwrap();

        assert_eq!(displaced.handle.id(), first_id);
        assert_eq!(registry.get(Role::Control).unwrap().id(), second_id);
    }

    #[test]
    fn test_unregister_is_noop_when_absent() {
        let registry = ConnectionRegistry::new();
        assert!(registry.unregister(Role::Execution).is_none());

        let (h, _rx) = handle(Role::Execution);
        registry.register(Connection::new(h));
        assert!(registry.unregister(Role::Execution).is_some());
        assert!(!registry.is_connected(Role::Execution));
        assert!(registry.unregister(Role::Execution).is_none());
    }

    #[test]
    fn test_stale_connection_does_not_evict_successor() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle(Role::Control);
        let (second, _rx2) = handle(Role::Control);
        let first_id = first.id();
        let second_id = second.id();

        registry.register(Connection::new(first));
        registry.register(Connection::new(second));

        assert!(registry.is_superseded(Role::Control, first_id));
        assert!(!registry.is_superseded(Role::Control, second_id));
        assert!(!registry.is_superseded(Role::Execution, second_id));

        assert!(!registry.unregister_connection(Role::Control, first_id));
        assert_eq!(registry.get(Role::Control).unwrap().id(), second_id);

        assert!(registry.unregister_connection(Role::Control, second_id));
        assert!(registry.get(Role::Control).is_none());
    }

    #[tokio::test]
    async fn test_send_to_closed_connection() {
        let (h, rx) = handle(Role::Execution);
        drop(rx);
        assert!(h.is_closed());

        let result = h.send_text("hello".to_string()).await;
        assert!(matches!(result, Err(TransportError::Closed(_))));
    }

    #[tokio::test]
    async fn test_send_times_out_on_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let h = ConnectionHandle::new(Role::Execution, tx, Duration::from_millis(20));

        h.send_text("first".to_string()).await.unwrap();
        let result = h.send_text("second".to_string()).await;
        assert!(matches!(result, Err(TransportError::Timeout(_, _))));
    }

    #[tokio::test]
    async fn test_send_delivers_text() {
        let (h, mut rx) = handle(Role::Control);
        h.send_text("frame".to_string()).await.unwrap();

        match rx.recv().await {
            Some(Message::Text(text)) => assert_eq!(text, "frame"),
            other => panic!("Expected text message, got {:?}", other),
        }
    }
}
