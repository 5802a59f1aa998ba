//! Client Connection Registry
//!
//! Tracks connected clients and their outbound channels, enabling targeted
//! sends and forced hangups. Extensions keep their own per-client state
//! keyed by the [`ClientId`] minted here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use databridge_protocol::Packet;

/// Unique client identifier
///
/// Minted from a monotonic counter; never reused for the lifetime of the
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Create a ClientId from a raw value (mainly for testing)
    #[cfg(test)]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Client({})", self.0)
    }
}

/// Message pushed to a connection's writer task
#[derive(Debug)]
pub enum Outgoing {
    /// Deliver a packet to the peer
    Packet(Packet),
    /// Close the connection from the server side
    ///
    /// Teardown always runs in the connection's own task, so watchdog kills
    /// and protocol violations cannot race packet handling.
    Hangup,
}

/// Entry for a connected client
pub struct ClientEntry {
    /// Channel into this client's writer task
    pub sender: mpsc::Sender<Outgoing>,
    /// When the connection was accepted
    pub connected_at: Instant,
    /// When the last packet arrived from this client
    pub last_activity: Instant,
}

impl std::fmt::Debug for ClientEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEntry")
            .field("connected_at", &self.connected_at)
            .field("last_activity", &self.last_activity)
            .field("sender_closed", &self.sender.is_closed())
            .finish()
    }
}

/// Registry tracking all connected clients
///
/// Thread-safe for concurrent access from connection tasks, extensions, and
/// the watchdog sweep.
pub struct ClientRegistry {
    /// Client ID -> Client entry
    clients: DashMap<ClientId, ClientEntry>,
    /// Counter for generating unique client IDs
    next_client_id: AtomicU64,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    /// Create a new empty client registry
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            next_client_id: AtomicU64::new(1),
        }
    }

    /// Register a new client connection
    ///
    /// Returns the assigned ClientId for this connection.
    pub fn register_client(&self, sender: mpsc::Sender<Outgoing>) -> ClientId {
        let id = ClientId(self.next_client_id.fetch_add(1, Ordering::SeqCst));
        let now = Instant::now();

        self.clients.insert(
            id,
            ClientEntry {
                sender,
                connected_at: now,
                last_activity: now,
            },
        );
        debug!("Registered client {}", id);

        id
    }

    /// Unregister a client connection
    pub fn unregister_client(&self, client_id: ClientId) {
        if self.clients.remove(&client_id).is_some() {
            debug!("Unregistered client {}", client_id);
        }
    }

    /// Get the number of connected clients
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Stamp a client's last-activity time
    pub fn touch(&self, client_id: ClientId) {
        if let Some(mut entry) = self.clients.get_mut(&client_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Connection age and idle time, for teardown diagnostics
    pub fn connection_stats(
        &self,
        client_id: ClientId,
    ) -> Option<(std::time::Duration, std::time::Duration)> {
        let entry = self.clients.get(&client_id)?;
        Some((entry.connected_at.elapsed(), entry.last_activity.elapsed()))
    }

    /// Send a packet to a specific client
    ///
    /// Returns `true` if the packet was queued, `false` if the client does
    /// not exist or its channel is closed. A closed channel means the
    /// connection task already died, so the client is unregistered.
    pub async fn send_to(&self, client_id: ClientId, packet: Packet) -> bool {
        // Clone the sender to avoid holding the map lock during send
        let sender = match self.clients.get(&client_id) {
            Some(entry) => entry.sender.clone(),
            None => return false,
        };

        match sender.send(Outgoing::Packet(packet)).await {
            Ok(()) => true,
            Err(_) => {
                warn!("Client {} channel closed, removing from registry", client_id);
                self.unregister_client(client_id);
                false
            }
        }
    }

    /// Send a packet to a specific client (non-blocking)
    ///
    /// Returns `true` if the packet was queued. Drops the packet when the
    /// client's channel is full (slow consumer).
    pub fn try_send_to(&self, client_id: ClientId, packet: Packet) -> bool {
        let sender = match self.clients.get(&client_id) {
            Some(entry) => entry.sender.clone(),
            None => return false,
        };

        match sender.try_send(Outgoing::Packet(packet)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Client {} channel closed, removing from registry", client_id);
                self.unregister_client(client_id);
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Client {} channel full, packet dropped", client_id);
                false
            }
        }
    }

    /// Force-close a client connection
    ///
    /// The hangup is delivered through the connection's own writer task;
    /// registry cleanup happens when that task exits. Returns `true` if the
    /// hangup was queued.
    pub fn hangup(&self, client_id: ClientId) -> bool {
        let sender = match self.clients.get(&client_id) {
            Some(entry) => entry.sender.clone(),
            None => return false,
        };

        match sender.try_send(Outgoing::Hangup) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister_client(client_id);
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Channel full: drop the entry so the writer task sees the
                // closed channel and exits on its next recv.
                self.unregister_client(client_id);
                false
            }
        }
    }
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("client_count", &self.clients.len())
            .field("next_client_id", &self.next_client_id.load(Ordering::SeqCst))
            .finish()
    }
}
