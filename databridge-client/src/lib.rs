//! databridge-client: Client library for the databridge protocol
//!
//! Provides the outbound connector ([`Connection`]) plus the two protocol
//! clients built on it: [`ConsoleClient`] for the authenticated remote
//! console (command execution, log tailing, keepalive) and [`SyncClient`]
//! for channelized key/value state synchronization.
//!
//! No CLI surface lives here; launchers construct these types directly.

pub mod connection;
pub mod console;
pub mod sender;
pub mod sync;

// Re-export main types at crate root
pub use connection::{Connection, ConnectionState};
pub use console::{ConsoleClient, DEFAULT_KEEPALIVE_INTERVAL};
pub use sender::PacketSender;
pub use sync::SyncClient;
