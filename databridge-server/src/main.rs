//! databridge server - Bridge daemon

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use databridge_protocol::{LogEntry, LogLevel};
use databridge_utils::Result;

mod config;
mod console;
mod dispatch;
mod listener;
mod registry;
mod sync;
mod watchdog;

use config::{AppConfig, ConfigLoader};
use console::executor::ShellExecutor;
use console::ConsoleExtension;
use listener::{ServerEvent, SharedState};
use registry::ClientRegistry;
use sync::SyncExtension;
use watchdog::{spawn_watchdog, WatchdogHandle};

/// Server state container
pub struct Server {
    state: SharedState,
    watchdog: Option<WatchdogHandle>,
}

impl Server {
    /// Wire up registries and extensions from configuration
    pub fn new(config: &AppConfig) -> Self {
        let registry = Arc::new(ClientRegistry::new());

        let console = config.console.secret.as_ref().map(|secret| {
            Arc::new(ConsoleExtension::new(
                Arc::clone(&registry),
                secret.clone(),
                Arc::new(ShellExecutor::new()),
            ))
        });

        let sync = if config.sync.enabled {
            Some(Arc::new(SyncExtension::new(Arc::clone(&registry))))
        } else {
            None
        };

        match (&console, &sync) {
            (Some(_), Some(_)) => info!("Console and sync extensions enabled"),
            (Some(_), None) => info!("Console extension enabled"),
            (None, Some(_)) => info!("Sync extension enabled, console disabled (no secret)"),
            (None, None) => warn!("No extensions enabled; every packet will close its sender"),
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let (events, _) = broadcast::channel(64);

        let watchdog = console.as_ref().map(|console| {
            spawn_watchdog(
                Arc::clone(console),
                Duration::from_secs(config.console.sweep_interval_secs),
                Duration::from_secs(config.console.keepalive_timeout_secs),
            )
        });

        Self {
            state: SharedState {
                registry,
                console,
                sync,
                shutdown_tx,
                events,
            },
            watchdog,
        }
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Subscribe to connection lifecycle events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.state.subscribe_events()
    }

    /// Mirror connection lifecycle events into the console's log tail
    ///
    /// Console clients subscribed to `"LOG"` see peers come and go. No-op
    /// when the console extension is disabled.
    pub fn bridge_lifecycle_logs(&self) {
        let Some(console) = &self.state.console else {
            return;
        };

        let (log_tx, log_rx) = mpsc::channel(64);
        Arc::clone(console).attach_log_stream(log_rx);

        let mut events = self.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let message = match event {
                    ServerEvent::ClientConnected(id) => format!("{} connected", id),
                    ServerEvent::ClientDisconnected(id) => format!("{} disconnected", id),
                };
                if log_tx.send(LogEntry::new(LogLevel::Info, message)).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Signal shutdown: stops the accept loop and closes every connection
    pub fn shutdown(&mut self) {
        info!("Server shutting down");
        let _ = self.state.shutdown_tx.send(());
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.stop();
        }
    }
}

/// Run the server daemon until interrupted
async fn run_daemon() -> Result<()> {
    info!("databridge server starting");

    let config = ConfigLoader::load_and_validate()?;

    let mut server = Server::new(&config);
    server.bridge_lifecycle_logs();

    let listener = TcpListener::bind(config.server.bind_addr()).await?;
    let accept = tokio::spawn(listener::run_listener(listener, server.state()));

    // Block until interrupted
    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");

    server.shutdown();
    let _ = accept.await;

    info!("databridge server stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    databridge_utils::init_logging_with_config(databridge_utils::LogConfig::server())?;

    run_daemon().await
}
