//! Remote-console client
//!
//! Wraps a [`Connection`] with the console protocol: authenticate first,
//! then run commands and tail server logs. A spawned keepalive task pings
//! the server more often than the server-side watchdog timeout so healthy
//! clients are never swept.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use databridge_protocol::{
    AuthRequest, CommandResult, CommandRun, EventSubscription, LogEntry, Packet, PacketKind,
    LOG_EVENT_NAME,
};
use databridge_utils::{BridgeError, Result};

use crate::connection::{Connection, ConnectionState};

/// Default keepalive send interval
///
/// Shorter than the server's 10s watchdog timeout so normal network jitter
/// never trips the sweep.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(8);

/// Authenticated console session against a bridge server
pub struct ConsoleClient {
    conn: Connection,
    authenticated: bool,
    /// Log entries that arrived while awaiting another reply
    pending_logs: VecDeque<LogEntry>,
    keepalive: Option<JoinHandle<()>>,
}

impl ConsoleClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            conn: Connection::new(addr),
            authenticated: false,
            pending_logs: VecDeque::new(),
            keepalive: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Connect the underlying transport
    pub async fn connect(&mut self) -> Result<()> {
        self.conn.connect().await
    }

    /// Present the shared secret and await the success reply
    ///
    /// A wrong secret never gets a reply; the server just closes, which
    /// surfaces here as [`BridgeError::AuthenticationFailed`].
    pub async fn authenticate(&mut self, secret: &str) -> Result<()> {
        let request = AuthRequest {
            secret: secret.to_string(),
        };
        self.conn
            .send(packet_from(PacketKind::AuthRequest, &request)?)
            .await?;

        match self.conn.recv().await {
            Some(packet) if packet.kind == PacketKind::AuthSuccess => {
                self.authenticated = true;
                debug!("Authenticated against {}", self.conn.addr());
                Ok(())
            }
            Some(packet) => Err(BridgeError::protocol(format!(
                "expected AUTHENTICATION.SUCCESS, got {}",
                packet.kind
            ))),
            None => Err(BridgeError::AuthenticationFailed),
        }
    }

    /// Start the periodic keepalive task
    ///
    /// Replaces any previously running task.
    pub fn start_keepalive(&mut self, interval: Duration) {
        self.stop_keepalive();

        let sender = self.conn.sender();
        self.keepalive = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if sender.send(Packet::empty(PacketKind::Keepalive)).await.is_err() {
                    debug!("Keepalive task exiting, connection gone");
                    break;
                }
            }
        }));
    }

    /// Stop the keepalive task
    pub fn stop_keepalive(&mut self) {
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
    }

    /// Subscribe to an event stream by name
    pub async fn register_event(&self, event_name: &str) -> Result<()> {
        let sub = EventSubscription {
            event_name: event_name.to_string(),
        };
        self.conn
            .send(packet_from(PacketKind::EventRegister, &sub)?)
            .await
    }

    /// Unsubscribe from an event stream
    pub async fn unregister_event(&self, event_name: &str) -> Result<()> {
        let sub = EventSubscription {
            event_name: event_name.to_string(),
        };
        self.conn
            .send(packet_from(PacketKind::EventUnregister, &sub)?)
            .await
    }

    /// Subscribe to the server's live log tail
    pub async fn subscribe_logs(&self) -> Result<()> {
        self.register_event(LOG_EVENT_NAME).await
    }

    /// Run a command and await its result
    ///
    /// Log entries that arrive while waiting are buffered and drained later
    /// via [`poll_log`](Self::poll_log) or [`next_log`](Self::next_log).
    pub async fn run_command(&mut self, command_line: &str) -> Result<CommandResult> {
        let run = CommandRun {
            command_line: command_line.to_string(),
        };
        self.conn
            .send(packet_from(PacketKind::CommandRun, &run)?)
            .await?;

        loop {
            match self.conn.recv().await {
                Some(packet) if packet.kind == PacketKind::CommandResult => {
                    return packet
                        .data_as::<CommandResult>()
                        .map_err(|e| BridgeError::InvalidPacket(e.to_string()));
                }
                Some(packet) if packet.kind == PacketKind::EventLog => {
                    self.buffer_log(&packet);
                }
                Some(packet) => {
                    debug!("Ignoring {} while awaiting command result", packet.kind);
                }
                None => return Err(BridgeError::ConnectionClosed),
            }
        }
    }

    /// Take the oldest buffered log entry, if any
    pub fn poll_log(&mut self) -> Option<LogEntry> {
        if let Some(entry) = self.pending_logs.pop_front() {
            return Some(entry);
        }

        // Drain anything already queued on the transport
        while let Some(packet) = self.conn.try_recv() {
            if packet.kind == PacketKind::EventLog {
                self.buffer_log(&packet);
            }
        }
        self.pending_logs.pop_front()
    }

    /// Await the next log entry
    pub async fn next_log(&mut self) -> Result<LogEntry> {
        if let Some(entry) = self.poll_log() {
            return Ok(entry);
        }

        loop {
            match self.conn.recv().await {
                Some(packet) if packet.kind == PacketKind::EventLog => {
                    return packet
                        .data_as::<LogEntry>()
                        .map_err(|e| BridgeError::InvalidPacket(e.to_string()));
                }
                Some(packet) => {
                    debug!("Ignoring {} while awaiting log entry", packet.kind);
                }
                None => return Err(BridgeError::ConnectionClosed),
            }
        }
    }

    /// Tear down the session
    pub async fn disconnect(&mut self) {
        self.stop_keepalive();
        self.conn.disconnect().await;
        self.authenticated = false;
    }

    fn buffer_log(&mut self, packet: &Packet) {
        match packet.data_as::<LogEntry>() {
            Ok(entry) => self.pending_logs.push_back(entry),
            Err(e) => debug!("Dropping undecodable log entry: {}", e),
        }
    }
}

fn packet_from<T: serde::Serialize>(kind: PacketKind, payload: &T) -> Result<Packet> {
    Packet::from_payload(kind, payload).map_err(|e| BridgeError::InvalidPacket(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use databridge_protocol::{LogLevel, PacketCodec};
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::Framed;

    type ServerFramed = Framed<TcpStream, PacketCodec>;

    /// Accept one connection and hand its framed socket to a script
    async fn scripted_server<F, Fut>(script: F) -> String
    where
        F: FnOnce(ServerFramed) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            script(Framed::new(stream, PacketCodec::new())).await;
        });

        addr
    }

    #[tokio::test]
    async fn test_authenticate_success() {
        let addr = scripted_server(|mut framed| async move {
            let packet = framed.next().await.unwrap().unwrap();
            assert_eq!(packet.kind, PacketKind::AuthRequest);
            assert_eq!(packet.data, json!({"secret": "s3cr3t"}));
            framed
                .send(Packet::empty(PacketKind::AuthSuccess))
                .await
                .unwrap();
        })
        .await;

        let mut client = ConsoleClient::new(addr);
        client.connect().await.unwrap();
        client.authenticate("s3cr3t").await.unwrap();
        assert!(client.is_authenticated());
    }

    #[tokio::test]
    async fn test_authenticate_rejected_on_close() {
        let addr = scripted_server(|mut framed| async move {
            // Server closes without replying, like a real secret mismatch
            let _ = framed.next().await;
        })
        .await;

        let mut client = ConsoleClient::new(addr);
        client.connect().await.unwrap();

        let result = client.authenticate("wrong").await;
        assert!(matches!(result, Err(BridgeError::AuthenticationFailed)));
        assert!(!client.is_authenticated());
    }

    #[tokio::test]
    async fn test_run_command_returns_result() {
        let addr = scripted_server(|mut framed| async move {
            let packet = framed.next().await.unwrap().unwrap();
            assert_eq!(packet.kind, PacketKind::CommandRun);
            assert_eq!(packet.data, json!({"commandLine": "echo hi"}));
            framed
                .send(Packet::new(
                    PacketKind::CommandResult,
                    json!({"result": "hi", "log": []}),
                ))
                .await
                .unwrap();
        })
        .await;

        let mut client = ConsoleClient::new(addr);
        client.connect().await.unwrap();

        let result = client.run_command("echo hi").await.unwrap();
        assert_eq!(result.result, json!("hi"));
        assert!(result.log.is_empty());
    }

    #[tokio::test]
    async fn test_interleaved_log_buffered_during_command() {
        let addr = scripted_server(|mut framed| async move {
            let _run = framed.next().await.unwrap().unwrap();

            // A log entry lands before the command result
            let entry = LogEntry::new(LogLevel::Info, "mid-command");
            framed
                .send(Packet::from_payload(PacketKind::EventLog, &entry).unwrap())
                .await
                .unwrap();
            framed
                .send(Packet::new(
                    PacketKind::CommandResult,
                    json!({"result": null, "log": []}),
                ))
                .await
                .unwrap();
        })
        .await;

        let mut client = ConsoleClient::new(addr);
        client.connect().await.unwrap();

        let result = client.run_command("noop").await.unwrap();
        assert_eq!(result.result, json!(null));

        let entry = client.poll_log().expect("buffered log entry");
        assert_eq!(entry.message, "mid-command");
        assert!(client.poll_log().is_none());
    }

    #[tokio::test]
    async fn test_next_log_awaits_entry() {
        let addr = scripted_server(|mut framed| async move {
            let entry = LogEntry::new(LogLevel::Error, "pushed");
            framed
                .send(Packet::from_payload(PacketKind::EventLog, &entry).unwrap())
                .await
                .unwrap();
            // Keep the socket open until the client is done
            let _ = framed.next().await;
        })
        .await;

        let mut client = ConsoleClient::new(addr);
        client.connect().await.unwrap();

        let entry = client.next_log().await.unwrap();
        assert_eq!(entry.message, "pushed");
        assert_eq!(entry.level, LogLevel::Error);
    }

    #[tokio::test]
    async fn test_subscribe_logs_sends_register() {
        let addr = scripted_server(|mut framed| async move {
            let packet = framed.next().await.unwrap().unwrap();
            assert_eq!(packet.kind, PacketKind::EventRegister);
            assert_eq!(packet.data, json!({"eventName": "LOG"}));
        })
        .await;

        let mut client = ConsoleClient::new(addr);
        client.connect().await.unwrap();
        client.subscribe_logs().await.unwrap();

        // Give the server script time to assert
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_task_sends_periodically() {
        let addr = scripted_server(|mut framed| async move {
            for _ in 0..3 {
                let packet = framed.next().await.unwrap().unwrap();
                assert_eq!(packet.kind, PacketKind::Keepalive);
            }
            // Confirm back to the client so the test can observe completion
            let entry = LogEntry::new(LogLevel::Info, "saw three keepalives");
            framed
                .send(Packet::from_payload(PacketKind::EventLog, &entry).unwrap())
                .await
                .unwrap();
            let _ = framed.next().await;
        })
        .await;

        let mut client = ConsoleClient::new(addr);
        client.connect().await.unwrap();
        client.start_keepalive(Duration::from_secs(8));

        // Paused clock: the keepalive sleeps auto-advance while we wait
        let entry = client.next_log().await.unwrap();
        assert_eq!(entry.message, "saw three keepalives");

        client.stop_keepalive();
    }

    #[tokio::test]
    async fn test_disconnect_resets_auth() {
        let addr = scripted_server(|mut framed| async move {
            let _ = framed.next().await;
            let _ = framed.send(Packet::empty(PacketKind::AuthSuccess)).await;
            let _ = framed.next().await;
        })
        .await;

        let mut client = ConsoleClient::new(addr);
        client.connect().await.unwrap();
        client.authenticate("s3cr3t").await.unwrap();

        client.disconnect().await;
        assert!(!client.is_authenticated());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
