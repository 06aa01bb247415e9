//! xapnet - xAP home automation messaging
//!
//! Build, parse and validate xAP messages and heartbeats, and run a UDP
//! connection that keeps itself alive by hearing its own heartbeats.

pub mod config;
pub mod network;
pub mod protocol;

pub use config::{Config, ConnectionOptions, ProtocolVersion, SourceAddress};
pub use network::{Connection, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionState};
pub use protocol::{Block, Message, Routing};
