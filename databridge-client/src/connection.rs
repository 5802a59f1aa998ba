//! Outbound connection to a bridge server

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use databridge_protocol::{Packet, PacketCodec};
use databridge_utils::{BridgeError, Result};

use crate::sender::PacketSender;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client connection to a bridge server
///
/// Owns the socket task for its lifetime; dropping or disconnecting tears
/// the transport down. A `recv` returning `None` means the server side
/// closed the connection.
pub struct Connection {
    /// Server address as host:port
    addr: String,
    /// Current state
    state: ConnectionState,
    /// Channel for outgoing packets
    tx: mpsc::Sender<Packet>,
    /// Channel for received packets
    rx: mpsc::Receiver<Packet>,
    /// Handle to the connection task
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Connection {
    /// Create a new connection (not yet connected)
    pub fn new(addr: impl Into<String>) -> Self {
        let (tx, _) = mpsc::channel(100);
        let (_, rx) = mpsc::channel(100);

        Self {
            addr: addr.into(),
            state: ConnectionState::Disconnected,
            tx,
            rx,
            task_handle: None,
        }
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get the server address
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Connect to the server
    pub async fn connect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;

        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            self.state = ConnectionState::Disconnected;
            BridgeError::Connection(format!("Failed to connect to {}: {}", self.addr, e))
        })?;

        let framed = Framed::new(stream, PacketCodec::new());

        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Packet>(100);
        let (incoming_tx, incoming_rx) = mpsc::channel::<Packet>(100);

        self.tx = outgoing_tx;
        self.rx = incoming_rx;

        let handle = tokio::spawn(Self::connection_task(framed, outgoing_rx, incoming_tx));
        self.task_handle = Some(handle);

        self.state = ConnectionState::Connected;
        Ok(())
    }

    /// Connect with a bounded retry loop
    ///
    /// Retry policy belongs to callers, not the protocol core; this is the
    /// stock policy for launchers that race server startup.
    pub async fn connect_with_retry(&mut self, attempts: u32, delay: Duration) -> Result<()> {
        let mut last_err = BridgeError::connection("no connection attempts made");

        for attempt in 1..=attempts.max(1) {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(
                        "Connect attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        e
                    );
                    last_err = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_err)
    }

    /// Disconnect from the server
    pub async fn disconnect(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Send a packet to the server
    pub async fn send(&self, packet: Packet) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(BridgeError::connection("Not connected"));
        }

        self.tx
            .send(packet)
            .await
            .map_err(|_| BridgeError::ConnectionClosed)?;

        Ok(())
    }

    /// Receive the next packet from the server (blocking)
    ///
    /// Returns `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    /// Try to receive without blocking
    pub fn try_recv(&mut self) -> Option<Packet> {
        self.rx.try_recv().ok()
    }

    /// Get a clonable packet sender
    pub fn sender(&self) -> PacketSender {
        PacketSender::new(self.tx.clone())
    }

    /// Background task that handles the actual socket I/O
    async fn connection_task(
        mut framed: Framed<TcpStream, PacketCodec>,
        mut outgoing: mpsc::Receiver<Packet>,
        incoming: mpsc::Sender<Packet>,
    ) {
        loop {
            tokio::select! {
                // Handle outgoing packets
                Some(packet) = outgoing.recv() => {
                    if let Err(e) = framed.send(packet).await {
                        tracing::error!("Failed to send packet: {}", e);
                        break;
                    }
                }

                // Handle incoming packets
                result = framed.next() => {
                    match result {
                        Some(Ok(packet)) => {
                            tracing::debug!(kind = %packet.kind, "Received packet");
                            if incoming.send(packet).await.is_err() {
                                tracing::debug!("Incoming channel closed, receiver dropped");
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!("Failed to receive packet: {}", e);
                            break;
                        }
                        None => {
                            tracing::info!("Server closed connection");
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use databridge_protocol::PacketKind;
    use tokio::net::TcpListener;

    async fn mock_server() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_connection_state_initial() {
        let conn = Connection::new("127.0.0.1:1");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_no_server() {
        // Port 1 is never listening
        let mut conn = Connection::new("127.0.0.1:1");
        let result = conn.connect().await;
        assert!(result.is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_to_server() {
        let (listener, addr) = mock_server().await;
        let accept_handle = tokio::spawn(async move { listener.accept().await.unwrap() });

        let mut conn = Connection::new(addr);
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.disconnect().await;
        accept_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_already_connected() {
        let (listener, addr) = mock_server().await;
        let accept_handle = tokio::spawn(async move { listener.accept().await.unwrap() });

        let mut conn = Connection::new(addr);
        conn.connect().await.unwrap();

        // Connect again should be a no-op
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.disconnect().await;
        accept_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_with_retry_eventually_fails() {
        let mut conn = Connection::new("127.0.0.1:1");
        let result = conn
            .connect_with_retry(3, Duration::from_millis(1))
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_send_not_connected() {
        let conn = Connection::new("127.0.0.1:1");
        let result = conn.send(Packet::empty(PacketKind::Keepalive)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_roundtrip_through_mock_server() {
        let (listener, addr) = mock_server().await;

        // Echo server: frames one packet back
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, PacketCodec::new());
            let packet = framed.next().await.unwrap().unwrap();
            framed.send(packet).await.unwrap();
        });

        let mut conn = Connection::new(addr);
        conn.connect().await.unwrap();

        let sent = Packet::new(
            PacketKind::ChannelJoin,
            serde_json::json!({"channelId": "c1"}),
        );
        conn.send(sent.clone()).await.unwrap();

        let received = conn.recv().await.unwrap();
        assert_eq!(received, sent);

        server.await.unwrap();
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_recv_none_after_server_close() {
        let (listener, addr) = mock_server().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let mut conn = Connection::new(addr);
        conn.connect().await.unwrap();
        server.await.unwrap();

        assert!(conn.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected() {
        let mut conn = Connection::new("127.0.0.1:1");
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_try_recv_empty() {
        let mut conn = Connection::new("127.0.0.1:1");
        assert!(conn.try_recv().is_none());
    }

    #[test]
    fn test_connection_state_equality() {
        assert_eq!(ConnectionState::Disconnected, ConnectionState::Disconnected);
        assert_ne!(ConnectionState::Connecting, ConnectionState::Connected);
    }
}
