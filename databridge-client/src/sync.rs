//! State-sync client
//!
//! Maintains a local mirror of one joined channel. `set` applies locally
//! before sending because the server does not echo an update back to its
//! sender; remote updates fold into the mirror as they arrive.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use databridge_protocol::{ChannelJoin, Packet, PacketKind, StateUpdate};
use databridge_utils::{BridgeError, Result};

use crate::connection::{Connection, ConnectionState};

/// Client half of the state-sync extension
pub struct SyncClient {
    conn: Connection,
    /// Channel this client joined, if any
    channel: Option<String>,
    /// Local mirror of the channel's key/value state
    values: HashMap<String, Value>,
}

impl SyncClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            conn: Connection::new(addr),
            channel: None,
            values: HashMap::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// The channel this client currently belongs to
    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    /// Connect the underlying transport
    pub async fn connect(&mut self) -> Result<()> {
        self.conn.connect().await
    }

    /// Join a channel and await the full snapshot
    ///
    /// Joining a different channel replaces the membership server-side; the
    /// local mirror is reset to the new snapshot either way.
    pub async fn join(&mut self, channel_id: &str) -> Result<()> {
        let join = ChannelJoin {
            channel_id: channel_id.to_string(),
        };
        let packet = Packet::from_payload(PacketKind::ChannelJoin, &join)
            .map_err(|e| BridgeError::InvalidPacket(e.to_string()))?;
        self.conn.send(packet).await?;

        loop {
            match self.conn.recv().await {
                Some(packet) if packet.kind == PacketKind::StateFull => {
                    self.values = packet
                        .data_as::<HashMap<String, Value>>()
                        .map_err(|e| BridgeError::InvalidPacket(e.to_string()))?;
                    self.channel = Some(channel_id.to_string());
                    debug!(
                        "Joined channel {:?} with {} values",
                        channel_id,
                        self.values.len()
                    );
                    return Ok(());
                }
                // Updates for the old channel may still be in flight
                Some(packet) if packet.kind == PacketKind::StateUpdate => {
                    self.apply_packet(&packet)?;
                }
                Some(packet) => {
                    return Err(BridgeError::protocol(format!(
                        "expected STATE.FULL, got {}",
                        packet.kind
                    )));
                }
                None => return Err(BridgeError::ConnectionClosed),
            }
        }
    }

    /// Set a key in the joined channel
    ///
    /// Applies locally first; the server fans the update out to the other
    /// members only.
    pub async fn set(&mut self, key: &str, value: Value) -> Result<()> {
        if self.channel.is_none() {
            return Err(BridgeError::protocol("not joined to a channel"));
        }

        self.values.insert(key.to_string(), value.clone());

        let update = StateUpdate {
            key: key.to_string(),
            value,
        };
        let packet = Packet::from_payload(PacketKind::StateUpdate, &update)
            .map_err(|e| BridgeError::InvalidPacket(e.to_string()))?;
        self.conn.send(packet).await
    }

    /// Current value for a key in the local mirror
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// The full local mirror
    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    /// Fold any queued remote updates into the mirror without blocking
    ///
    /// Returns the number of updates applied.
    pub fn poll_updates(&mut self) -> Result<usize> {
        let mut applied = 0;
        while let Some(packet) = self.conn.try_recv() {
            if packet.kind == PacketKind::StateUpdate {
                self.apply_packet(&packet)?;
                applied += 1;
            } else {
                debug!("Ignoring {} while polling updates", packet.kind);
            }
        }
        Ok(applied)
    }

    /// Await the next remote update and fold it into the mirror
    pub async fn next_update(&mut self) -> Result<StateUpdate> {
        loop {
            match self.conn.recv().await {
                Some(packet) if packet.kind == PacketKind::StateUpdate => {
                    let update = packet
                        .data_as::<StateUpdate>()
                        .map_err(|e| BridgeError::InvalidPacket(e.to_string()))?;
                    self.values
                        .insert(update.key.clone(), update.value.clone());
                    return Ok(update);
                }
                Some(packet) => {
                    debug!("Ignoring {} while awaiting update", packet.kind);
                }
                None => return Err(BridgeError::ConnectionClosed),
            }
        }
    }

    /// Tear down the connection; membership clears server-side on disconnect
    pub async fn disconnect(&mut self) {
        self.conn.disconnect().await;
        self.channel = None;
    }

    fn apply_packet(&mut self, packet: &Packet) -> Result<()> {
        let update = packet
            .data_as::<StateUpdate>()
            .map_err(|e| BridgeError::InvalidPacket(e.to_string()))?;
        self.values.insert(update.key, update.value);
        Ok(())
    }
}
