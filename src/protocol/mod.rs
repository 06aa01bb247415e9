//! Protocol module - Defines the xAP wire protocol
//!
//! Messages are UTF-8 text made of blocks:
//! - a block name line
//! - `{`
//! - one `key=value` (or `key!hexbytes`) line per item
//! - `}`
//!
//! The first block of a message is the `xap-header`; heartbeats are a single
//! `xap-hbeat` block.

mod block;
mod codec;
mod message;
mod uid;
mod validate;

pub use block::*;
pub use codec::*;
pub use message::*;
pub use uid::*;
pub use validate::*;

/// Protocol version written into every header we build
pub const PROTOCOL_VERSION: u32 = 13;

/// Default UDP port for xAP traffic
pub const DEFAULT_PORT: u16 = 3639;

/// Default heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL: u32 = 60;

pub const HEADER_BLOCK_NAME: &str = "xap-header";
pub const HEARTBEAT_BLOCK_NAME: &str = "xap-hbeat";

/// Items every header and heartbeat must carry
pub const HEADER_REQUIRED_ITEMS: [&str; 5] = ["v", "hop", "uid", "class", "source"];

/// Header items in serialization order
pub const HEADER_ITEM_NAMES: [&str; 6] = ["v", "hop", "uid", "class", "source", "target"];

/// Heartbeat items in serialization order
pub const HEARTBEAT_ITEM_NAMES: [&str; 8] =
    ["v", "hop", "uid", "class", "source", "interval", "port", "pid"];
