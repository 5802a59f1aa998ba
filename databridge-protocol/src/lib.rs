//! databridge-protocol: Shared wire definitions for bridge peers
//!
//! This crate defines the packet envelope, the packet-type vocabulary, the
//! typed payload shapes, and the length-prefixed frame codec used for
//! communication between bridge servers and clients over TCP.

pub mod codec;
pub mod packet;
pub mod payload;

// Re-export main types at crate root
pub use codec::{CodecError, PacketCodec, MAX_FRAME_SIZE};
pub use packet::{Packet, PacketKind};
pub use payload::{
    AuthRequest, ChannelJoin, CommandRun, CommandResult, EventSubscription, LogEntry, LogLevel,
    StateUpdate, LOG_EVENT_NAME,
};
