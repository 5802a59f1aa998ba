//! Remote-console extension
//!
//! Turns an authenticated connection into a privileged command channel with
//! live log tailing. Per-client console state (authenticated flag, event
//! subscriptions, keepalive bookkeeping) lives here, keyed by the transport
//! registry's [`ClientId`]; the transport layer itself is never mutated.

pub mod executor;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use databridge_protocol::{CommandResult, LogEntry, Packet, PacketKind, LOG_EVENT_NAME};

use crate::registry::{ClientId, ClientRegistry};
use executor::CommandExecutor;

/// Per-client console state
#[derive(Debug)]
pub struct ConsoleClient {
    pub authenticated: bool,
    /// Event names this client subscribed to
    pub events: HashSet<String>,
    pub connected_at: Instant,
    pub last_keepalive: Instant,
}

impl ConsoleClient {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            authenticated: false,
            events: HashSet::new(),
            connected_at: now,
            last_keepalive: now,
        }
    }
}

pub struct ConsoleExtension {
    registry: Arc<ClientRegistry>,
    /// Client ID -> console state
    clients: DashMap<ClientId, ConsoleClient>,
    /// Shared secret presented by connecting clients
    secret: String,
    /// Injected command execution strategy
    executor: Arc<dyn CommandExecutor>,
}

impl ConsoleExtension {
    pub fn new(
        registry: Arc<ClientRegistry>,
        secret: impl Into<String>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            registry,
            clients: DashMap::new(),
            secret: secret.into(),
            executor,
        }
    }

    /// Track a newly accepted connection (unauthenticated)
    pub fn client_connected(&self, client_id: ClientId) {
        self.clients.insert(client_id, ConsoleClient::new());
    }

    /// Drop console state when a connection goes away
    pub fn client_disconnected(&self, client_id: ClientId) {
        self.clients.remove(&client_id);
    }

    pub fn is_authenticated(&self, client_id: ClientId) -> bool {
        self.clients
            .get(&client_id)
            .map(|c| c.authenticated)
            .unwrap_or(false)
    }

    /// Handle `AUTHENTICATION.REQUEST`
    ///
    /// Returns the success reply, or `None` when the secret does not match;
    /// the caller closes the connection without replying so a peer cannot
    /// distinguish a bad secret from a malformed request.
    pub fn handle_auth(&self, client_id: ClientId, secret: &str) -> Option<Packet> {
        if !secrets_match(secret, &self.secret) {
            info!("{} failed authentication", client_id);
            return None;
        }

        match self.clients.get_mut(&client_id) {
            Some(mut client) => {
                client.authenticated = true;
                client.last_keepalive = Instant::now();
            }
            None => return None,
        }

        info!("{} authenticated", client_id);
        Some(Packet::empty(PacketKind::AuthSuccess))
    }

    /// Handle `KEEPALIVE`: stamp the liveness clock, no reply
    pub fn handle_keepalive(&self, client_id: ClientId) {
        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.last_keepalive = Instant::now();
        }
    }

    /// Handle `EVENT.REGISTER`
    pub fn handle_register(&self, client_id: ClientId, event_name: String) {
        if let Some(mut client) = self.clients.get_mut(&client_id) {
            debug!("{} subscribed to {:?}", client_id, event_name);
            client.events.insert(event_name);
        }
    }

    /// Handle `EVENT.UNREGISTER`
    pub fn handle_unregister(&self, client_id: ClientId, event_name: &str) {
        if let Some(mut client) = self.clients.get_mut(&client_id) {
            debug!("{} unsubscribed from {:?}", client_id, event_name);
            client.events.remove(event_name);
        }
    }

    /// Handle `COMMAND.RUN`: execute off the dispatch path
    ///
    /// The executor runs on its own task so other clients' packets keep
    /// flowing while a command is in flight. Executor failures become a
    /// normal result payload. If the client disconnects mid-command the
    /// result send quietly hits a missing registry entry.
    pub fn spawn_command(&self, client_id: ClientId, command_line: String) {
        let executor = Arc::clone(&self.executor);
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            debug!("{} running command: {}", client_id, command_line);

            let payload = match executor.execute(&command_line).await {
                Ok(outcome) => CommandResult {
                    result: outcome.result,
                    log: outcome.log,
                },
                Err(e) => CommandResult {
                    result: json!({"error": e.to_string()}),
                    log: Vec::new(),
                },
            };

            let packet = match Packet::from_payload(PacketKind::CommandResult, &payload) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("Failed to encode command result: {}", e);
                    return;
                }
            };

            registry.send_to(client_id, packet).await;
        });
    }

    /// Push one log entry to every authenticated subscriber of `"LOG"`
    pub async fn emit_log(&self, entry: LogEntry) {
        let recipients = self.subscribers(LOG_EVENT_NAME);
        if recipients.is_empty() {
            return;
        }

        let packet = match Packet::from_payload(PacketKind::EventLog, &entry) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Failed to encode log entry: {}", e);
                return;
            }
        };

        for client_id in recipients {
            self.registry.send_to(client_id, packet.clone()).await;
        }
    }

    /// Pump an external log-emission stream into [`emit_log`]
    ///
    /// This is the seam collaborators (logger backends, application code)
    /// use to feed the console's live tail.
    pub fn attach_log_stream(self: Arc<Self>, mut rx: mpsc::Receiver<LogEntry>) {
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                self.emit_log(entry).await;
            }
            debug!("Log stream closed");
        });
    }

    /// Close every client whose keepalive clock exceeded `timeout`
    ///
    /// Returns the number of connections hung up.
    pub fn sweep(&self, timeout: Duration) -> usize {
        let now = Instant::now();

        let stale: Vec<(ClientId, Duration)> = self
            .clients
            .iter()
            .filter(|entry| now.duration_since(entry.last_keepalive) > timeout)
            .map(|entry| (*entry.key(), now.duration_since(entry.connected_at)))
            .collect();

        for (client_id, connected_for) in &stale {
            warn!(
                "{} missed keepalive window after {:?} connected, closing",
                client_id, connected_for
            );
            self.registry.hangup(*client_id);
        }

        stale.len()
    }

    /// Authenticated clients subscribed to an event name
    fn subscribers(&self, event_name: &str) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|entry| entry.authenticated && entry.events.contains(event_name))
            .map(|entry| *entry.key())
            .collect()
    }

    #[cfg(test)]
    pub fn subscription_count(&self, client_id: ClientId) -> usize {
        self.clients
            .get(&client_id)
            .map(|c| c.events.len())
            .unwrap_or(0)
    }
}

/// Compare secrets without short-circuiting on the first mismatched byte
fn secrets_match(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();

    if provided.len() != expected.len() {
        return false;
    }

    let mut diff = 0u8;
    for (a, b) in provided.iter().zip(expected.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}
