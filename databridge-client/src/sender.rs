//! Clonable packet sender

use tokio::sync::mpsc;

use databridge_protocol::Packet;
use databridge_utils::{BridgeError, Result};

/// Clonable handle for sending packets from spawned tasks
#[derive(Clone)]
pub struct PacketSender {
    tx: mpsc::Sender<Packet>,
}

impl PacketSender {
    pub fn new(tx: mpsc::Sender<Packet>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, packet: Packet) -> Result<()> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| BridgeError::ConnectionClosed)?;
        Ok(())
    }

    /// Send without waiting (fire and forget)
    pub fn send_nowait(&self, packet: Packet) {
        let _ = self.tx.try_send(packet);
    }

    /// True once the connection task is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use databridge_protocol::PacketKind;

    #[tokio::test]
    async fn test_sender_clone_and_send() {
        let (tx, mut rx) = mpsc::channel(10);
        let sender = PacketSender::new(tx);
        let cloned = sender.clone();

        cloned.send(Packet::empty(PacketKind::Keepalive)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, PacketKind::Keepalive);
    }

    #[tokio::test]
    async fn test_send_after_close_errors() {
        let (tx, rx) = mpsc::channel(10);
        let sender = PacketSender::new(tx);
        drop(rx);

        assert!(sender.is_closed());
        let result = sender.send(Packet::empty(PacketKind::Keepalive)).await;
        assert!(matches!(result, Err(BridgeError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_send_nowait_never_panics() {
        let (tx, rx) = mpsc::channel(1);
        let sender = PacketSender::new(tx);
        drop(rx);

        sender.send_nowait(Packet::empty(PacketKind::Keepalive));
    }
}
