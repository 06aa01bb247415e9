//! Network module - Handles xAP communication over UDP
//!
//! Provides:
//! - Connection: heartbeats, liveness tracking and message exchange
//! - Events: what a connection reports to its owner
//! - Scheduler: the repeating tick that drives heartbeats
//! - Transport: the datagram sockets the connection talks through

mod connection;
mod events;
mod liveness;
mod scheduler;
mod transport;

pub use connection::*;
pub use events::{EventReceiver, EVENT_QUEUE_LIMIT};
pub use liveness::*;
pub use scheduler::*;
pub use transport::*;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::config::{ProtocolVersion, SourceAddress};

/// Resolved settings for a [`Connection`]
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub version: ProtocolVersion,
    pub source: SourceAddress,
    /// Steady-state heartbeat interval in seconds
    pub hb_interval: u32,
    /// Heartbeat period multiplier while not yet alive
    pub hb_backoff: f64,
    pub uid: String,
    pub rx_address: IpAddr,
    pub tx_address: IpAddr,
    pub port: u16,
    /// Bind an ephemeral port and send to it, so we hear only ourselves
    pub loopback: bool,
}

impl ConnectionConfig {
    /// Defaults for `source`, the same as an otherwise empty options section
    pub fn new(source: SourceAddress) -> Self {
        let options = crate::config::ConnectionOptions::new(source);
        // Default options always resolve.
        options
            .resolve()
            .expect("default connection options are valid")
    }

    pub fn with_loopback(mut self, loopback: bool) -> Self {
        self.loopback = loopback;
        self
    }

    pub fn with_interval(mut self, seconds: u32) -> Self {
        self.hb_interval = seconds.max(1);
        self
    }

    /// `vendor.device.instance`
    pub fn source_string(&self) -> String {
        self.source.to_string()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.hb_interval))
    }

    /// Address the receive socket binds to
    pub fn rx_bind_addr(&self) -> SocketAddr {
        let port = if self.loopback { 0 } else { self.port };
        SocketAddr::new(self.rx_address, port)
    }
}
