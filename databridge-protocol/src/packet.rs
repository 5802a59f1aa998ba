//! Packet envelope and type vocabulary

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Packet type vocabulary.
///
/// Serialized as the exact case-sensitive wire strings, so routing stays a
/// closed enum match while the envelope keeps its `{type, data, metadata}`
/// shape. A frame carrying any other string fails envelope decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    #[serde(rename = "AUTHENTICATION.REQUEST")]
    AuthRequest,
    #[serde(rename = "AUTHENTICATION.SUCCESS")]
    AuthSuccess,
    #[serde(rename = "KEEPALIVE")]
    Keepalive,
    #[serde(rename = "EVENT.REGISTER")]
    EventRegister,
    #[serde(rename = "EVENT.UNREGISTER")]
    EventUnregister,
    #[serde(rename = "EVENT.LOG")]
    EventLog,
    #[serde(rename = "COMMAND.RUN")]
    CommandRun,
    #[serde(rename = "COMMAND.RESULT")]
    CommandResult,
    #[serde(rename = "CHANNEL.JOIN")]
    ChannelJoin,
    #[serde(rename = "STATE.FULL")]
    StateFull,
    #[serde(rename = "STATE.UPDATE")]
    StateUpdate,
}

impl PacketKind {
    /// The wire string for this packet type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRequest => "AUTHENTICATION.REQUEST",
            Self::AuthSuccess => "AUTHENTICATION.SUCCESS",
            Self::Keepalive => "KEEPALIVE",
            Self::EventRegister => "EVENT.REGISTER",
            Self::EventUnregister => "EVENT.UNREGISTER",
            Self::EventLog => "EVENT.LOG",
            Self::CommandRun => "COMMAND.RUN",
            Self::CommandResult => "COMMAND.RESULT",
            Self::ChannelJoin => "CHANNEL.JOIN",
            Self::StateFull => "STATE.FULL",
            Self::StateUpdate => "STATE.UPDATE",
        }
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of communication: a typed envelope carrying a structured payload
/// and a free-form metadata bag.
///
/// Immutable once constructed; a packet is serialized wholesale per send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Packet type tag
    #[serde(rename = "type")]
    pub kind: PacketKind,
    /// Structured payload, shape determined by `kind`
    pub data: Value,
    /// Arbitrary key/value bag for out-of-band annotations
    pub metadata: Value,
}

impl Packet {
    /// Create a packet with the given payload and an empty metadata bag
    pub fn new(kind: PacketKind, data: Value) -> Self {
        Self {
            kind,
            data,
            metadata: Value::Object(Map::new()),
        }
    }

    /// Create a packet with an empty `{}` payload
    pub fn empty(kind: PacketKind) -> Self {
        Self::new(kind, Value::Object(Map::new()))
    }

    /// Create a packet by serializing a typed payload
    pub fn from_payload<T: Serialize>(
        kind: PacketKind,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    /// Attach a metadata bag, consuming the builder
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Deserialize the payload into a typed shape
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}
