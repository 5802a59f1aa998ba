//! Liveness watchdog for console connections
//!
//! Runs a fixed-interval sweep over the console extension's client table and
//! hangs up any connection whose keepalive clock exceeded the timeout. The
//! matching client-side keepalive interval is shorter than the timeout so
//! normal network jitter never trips the sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::console::ConsoleExtension;

/// Handle to a running watchdog task
pub struct WatchdogHandle {
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl WatchdogHandle {
    /// Stop the sweep task
    ///
    /// Returns true if the watchdog was still running.
    pub fn stop(&mut self) -> bool {
        match self.cancel_tx.take() {
            Some(tx) => {
                // Ignore error if the task already exited
                let _ = tx.send(());
                info!("Watchdog stopped");
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.cancel_tx.is_some()
    }
}

/// Spawn the keepalive sweep task
pub fn spawn_watchdog(
    console: Arc<ConsoleExtension>,
    interval: Duration,
    timeout: Duration,
) -> WatchdogHandle {
    let (cancel_tx, cancel_rx) = oneshot::channel();

    tokio::spawn(watchdog_task(console, interval, timeout, cancel_rx));

    info!(
        interval_ms = interval.as_millis() as u64,
        timeout_ms = timeout.as_millis() as u64,
        "Watchdog started"
    );

    WatchdogHandle {
        cancel_tx: Some(cancel_tx),
    }
}

async fn watchdog_task(
    console: Arc<ConsoleExtension>,
    interval: Duration,
    timeout: Duration,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let closed = console.sweep(timeout);
                if closed > 0 {
                    debug!("Watchdog closed {} stale connections", closed);
                }
            }

            _ = &mut cancel_rx => {
                debug!("Watchdog task cancelled");
                break;
            }
        }
    }
}
