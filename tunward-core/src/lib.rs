//! Tunward core services.
//!
//! Protocol-independent half of the tunnel: routing rules, the SOCKS5
//! client, traffic counters, configuration, logging and protected
//! socket creation. The packet-facing engine lives in
//! `tunward-netstack`.

pub mod config;
pub mod error;
pub mod logging;
pub mod routing;
pub mod socket_protect;
pub mod socks5;
pub mod traffic;

#[cfg(test)]
mod tests;

pub use config::{Config, LogLevel, RouteRulesConfig, ServerConfig, TunnelConfig};
pub use error::{Error, Result};
pub use logging::{clear_logs, get_recent_logs, init_logging, log_event, EventCategory};
pub use routing::{RouteAction, RouteTable};
pub use socket_protect::{
    bind_protected_udp, clear_protect_callback, connect_protected, connect_protected_timeout,
    has_protect_callback, protect_socket, set_protect_callback,
};
pub use socks5::Socks5Client;
pub use traffic::{format_bytes, TrafficSnapshot, TrafficStats};
