//! State-sync extension: channelized key/value replication
//!
//! Each channel holds a key->value map shared by its member clients. A
//! client belongs to at most one channel at a time; joining another channel
//! replaces the membership. Updates are last-write-wins per key and fan out
//! to every other member. Channels are created lazily on first join and are
//! never deleted, so a rejoining client sees the last accepted state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tracing::debug;

use databridge_protocol::{Packet, PacketKind, StateUpdate};

use crate::registry::{ClientId, ClientRegistry};

pub struct SyncExtension {
    registry: Arc<ClientRegistry>,
    /// Channel ID -> key/value state
    channels: DashMap<String, HashMap<String, Value>>,
    /// Client ID -> joined channel (at most one)
    membership: DashMap<ClientId, String>,
    /// Channel ID -> member set (reverse index for broadcast)
    members: DashMap<String, HashSet<ClientId>>,
}

impl SyncExtension {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self {
            registry,
            channels: DashMap::new(),
            membership: DashMap::new(),
            members: DashMap::new(),
        }
    }

    /// Handle `CHANNEL.JOIN`: record membership and build the snapshot reply
    ///
    /// Creates the channel empty if it does not exist. Joining a channel
    /// replaces any previous membership.
    pub fn handle_join(&self, client_id: ClientId, channel_id: String) -> Packet {
        // Leave the previous channel, if any
        if let Some((_, old_channel)) = self.membership.remove(&client_id) {
            if let Some(mut set) = self.members.get_mut(&old_channel) {
                set.remove(&client_id);
            }
        }

        let snapshot: Map<String, Value> = self
            .channels
            .entry(channel_id.clone())
            .or_insert_with(HashMap::new)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        self.membership.insert(client_id, channel_id.clone());
        self.members
            .entry(channel_id.clone())
            .or_insert_with(HashSet::new)
            .insert(client_id);

        debug!("{} joined channel {:?}", client_id, channel_id);

        Packet::new(PacketKind::StateFull, Value::Object(snapshot))
    }

    /// Handle `STATE.UPDATE`: apply last-write-wins, fan out to other members
    ///
    /// The sender already holds the value locally, so it is not echoed back.
    /// Returns `false` when the client has not joined a channel; the caller
    /// treats that as a protocol violation.
    pub async fn handle_update(&self, client_id: ClientId, update: StateUpdate) -> bool {
        let channel_id = match self.member_channel(client_id) {
            Some(channel_id) => channel_id,
            None => return false,
        };

        if let Some(mut values) = self.channels.get_mut(&channel_id) {
            values.insert(update.key.clone(), update.value.clone());
        }

        // Collect recipients before sending so no map lock is held across await
        let recipients: Vec<ClientId> = self
            .members
            .get(&channel_id)
            .map(|set| set.iter().copied().filter(|&id| id != client_id).collect())
            .unwrap_or_default();

        if recipients.is_empty() {
            return true;
        }

        debug!(
            "Broadcasting update of {:?} to {} members of channel {:?}",
            update.key,
            recipients.len(),
            channel_id
        );

        let packet = match Packet::from_payload(PacketKind::StateUpdate, &update) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Failed to encode state update: {}", e);
                return true;
            }
        };

        for recipient in recipients {
            self.registry.send_to(recipient, packet.clone()).await;
        }

        true
    }

    /// Clear membership when a connection goes away
    pub fn client_disconnected(&self, client_id: ClientId) {
        if let Some((_, channel_id)) = self.membership.remove(&client_id) {
            if let Some(mut set) = self.members.get_mut(&channel_id) {
                set.remove(&client_id);
            }
            debug!("{} left channel {:?} on disconnect", client_id, channel_id);
        }
    }

    /// The channel a client currently belongs to
    pub fn member_channel(&self, client_id: ClientId) -> Option<String> {
        self.membership.get(&client_id).map(|e| e.value().clone())
    }

    /// Current value for a key in a channel
    #[cfg(test)]
    pub fn channel_value(&self, channel_id: &str, key: &str) -> Option<Value> {
        self.channels.get(channel_id)?.get(key).cloned()
    }

    /// Number of clients joined to a channel
    #[cfg(test)]
    pub fn member_count(&self, channel_id: &str) -> usize {
        self.members.get(channel_id).map(|s| s.len()).unwrap_or(0)
    }
}
