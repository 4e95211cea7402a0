//! Connection tracking for the session server
//!
//! This module handles the server-side view of connected clients, including:
//! - One [`Connection`] per live WebSocket, identified by its token
//! - A bounded outbound queue per connection that never blocks the sender
//! - The connection's binding to at most one session
//! - The process-wide token → connection directory
//!
//! Connections are not owned by sessions. Participants only hold a weak
//! reference, so a participant survives the connection it joined with.

use log::{info, warn};
use parking_lot::Mutex;
use shared::Envelope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Lifetime dropped messages after which a slow client is disconnected.
pub const MAX_TOTAL_DROPS: u64 = 32;

/// One participant's transport connection.
#[derive(Debug)]
pub struct Connection {
    /// Opaque identity, stable across reconnects when the client sends it back
    pub token: String,
    /// Serialized envelopes waiting for the socket writer
    sender: mpsc::Sender<Arc<String>>,
    /// Session this connection joined, if any
    session_id: Mutex<Option<String>>,
    drops: AtomicU64,
    closed: CancellationToken,
    pub connected_at: Instant,
}

impl Connection {
    pub fn new(token: impl Into<String>, sender: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            token: token.into(),
            sender,
            session_id: Mutex::new(None),
            drops: AtomicU64::new(0),
            closed: CancellationToken::new(),
            connected_at: Instant::now(),
        }
    }

    /// Queues a serialized message without waiting.
    ///
    /// Returns false if the message was dropped. A full queue counts toward
    /// [`MAX_TOTAL_DROPS`]; crossing it closes the connection.
    pub fn send(&self, message: Arc<String>) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let drops = self.drops.fetch_add(1, Ordering::Relaxed) + 1;
                if drops >= MAX_TOTAL_DROPS {
                    warn!("Disconnecting slow client {} after {} drops", self.token, drops);
                    self.close();
                } else {
                    warn!("Outbound queue full for client {} ({} drops)", self.token, drops);
                }
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.to_json() {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                warn!("Failed to serialize {} envelope: {}", envelope.kind, e);
                false
            }
        }
    }

    pub fn bind_session(&self, session_id: &str) {
        *self.session_id.lock() = Some(session_id.to_string());
    }

    pub fn unbind_session(&self) {
        *self.session_id.lock() = None;
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Asks the socket tasks to shut this connection down.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`Connection::close`] has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Directory of live connections keyed by token.
#[derive(Debug, Default)]
pub struct ClientManager {
    connections: HashMap<String, Arc<Connection>>,
}

impl ClientManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection.
    ///
    /// If another live connection already used this token it is returned so
    /// the caller can close it; the newest connection always wins.
    pub fn add_client(&mut self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        info!("Client {} connected", connection.token);
        self.connections
            .insert(connection.token.clone(), connection)
            .filter(|previous| !previous.is_closed())
    }

    /// Removes the entry for this connection's token, but only if the entry is
    /// still this exact connection. A reconnect may already have replaced it.
    pub fn remove_client(&mut self, connection: &Arc<Connection>) -> bool {
        match self.connections.get(&connection.token) {
            Some(current) if Arc::ptr_eq(current, connection) => {
                self.connections.remove(&connection.token);
                info!("Client {} disconnected", connection.token);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, token: &str) -> Option<Arc<Connection>> {
        self.connections.get(token).cloned()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.connections.contains_key(token)
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns true if no clients are currently connected
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
