//! TCP listener and per-connection tasks
//!
//! The accept loop wraps each connection in a framed codec and spawns a task
//! that owns the socket for its lifetime. All teardown (peer close, framing
//! error, watchdog hangup, server shutdown) funnels into the tail of that
//! task, so the disconnect cleanup runs exactly once per connection.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use databridge_protocol::PacketCodec;

use crate::console::ConsoleExtension;
use crate::dispatch::{Dispatch, HandlerContext};
use crate::registry::{ClientRegistry, Outgoing};
use crate::sync::SyncExtension;

/// Outbound queue depth per connection
const OUTBOUND_BUFFER: usize = 100;

/// Connection lifecycle notifications for external collaborators
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientConnected(crate::registry::ClientId),
    ClientDisconnected(crate::registry::ClientId),
}

/// Shared collaborators handed to every connection task
#[derive(Clone)]
pub struct SharedState {
    pub registry: Arc<ClientRegistry>,
    pub console: Option<Arc<ConsoleExtension>>,
    pub sync: Option<Arc<SyncExtension>>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub events: broadcast::Sender<ServerEvent>,
}

impl SharedState {
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }
}

/// Run the accept loop on a bound listener
///
/// Exits when the shutdown channel fires; active connections observe the
/// same channel and close themselves.
pub async fn run_listener(listener: TcpListener, state: SharedState) {
    match listener.local_addr() {
        Ok(addr) => info!("Listening on {}", addr),
        Err(e) => warn!("Listener has no local addr: {}", e),
    }

    let mut shutdown_rx = state.subscribe_shutdown();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        debug!("New connection from {}", peer_addr);
                        let state_clone = state.clone();
                        tokio::spawn(async move {
                            handle_client(stream, state_clone).await;
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping accept loop");
                break;
            }
        }
    }
}

/// Own one connection: frame packets, route inbound, drain outbound
pub async fn handle_client(stream: TcpStream, state: SharedState) {
    let framed = Framed::new(stream, PacketCodec::new());
    let (mut sink, mut packets) = framed.split();

    let (tx, mut outbound) = mpsc::channel::<Outgoing>(OUTBOUND_BUFFER);
    let client_id = state.registry.register_client(tx);

    if let Some(console) = &state.console {
        console.client_connected(client_id);
    }
    let _ = state.events.send(ServerEvent::ClientConnected(client_id));
    info!("{} connected", client_id);

    let ctx = HandlerContext {
        registry: Arc::clone(&state.registry),
        console: state.console.clone(),
        sync: state.sync.clone(),
        client_id,
    };

    let mut shutdown_rx = state.subscribe_shutdown();

    loop {
        tokio::select! {
            // Drain the outbound queue into the socket
            maybe = outbound.recv() => {
                match maybe {
                    Some(Outgoing::Packet(packet)) => {
                        if let Err(e) = sink.send(packet).await {
                            debug!("{} write failed: {}", client_id, e);
                            break;
                        }
                    }
                    Some(Outgoing::Hangup) => {
                        debug!("{} hangup requested", client_id);
                        break;
                    }
                    // Registry dropped the entry
                    None => break,
                }
            }

            // Route inbound packets
            inbound = packets.next() => {
                match inbound {
                    Some(Ok(packet)) => {
                        match ctx.route_packet(packet).await {
                            Dispatch::Reply(reply) => {
                                if let Err(e) = sink.send(reply).await {
                                    debug!("{} reply failed: {}", client_id, e);
                                    break;
                                }
                            }
                            Dispatch::None => {}
                            Dispatch::Close => break,
                        }
                    }
                    Some(Err(e)) => {
                        // Malformed or oversized frame: the stream is no
                        // longer frame-aligned
                        warn!("{} framing error: {}", client_id, e);
                        break;
                    }
                    None => {
                        debug!("{} closed by peer", client_id);
                        break;
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                debug!("{} closing for server shutdown", client_id);
                break;
            }
        }
    }

    // Single teardown point: the disconnect is observed exactly once
    if let Some((age, idle)) = state.registry.connection_stats(client_id) {
        debug!("{} closing after {:?} (idle {:?})", client_id, age, idle);
    }
    state.registry.unregister_client(client_id);
    if let Some(console) = &state.console {
        console.client_disconnected(client_id);
    }
    if let Some(sync) = &state.sync {
        sync.client_disconnected(client_id);
    }
    let _ = state.events.send(ServerEvent::ClientDisconnected(client_id));
    info!("{} disconnected", client_id);
}
