//! Tunward network stack.
//!
//! The packet-facing half of the tunnel: a from-scratch IPv4/TCP/UDP
//! header codec, a per-flow TCP state machine over a concurrent flow
//! table, a stateless UDP forwarder and the tunnel stack that wires
//! them to a virtual network device.
//!
//! The stack never initiates TCP handshakes toward the local client;
//! it only answers the client's SYN after the real upstream connection
//! (direct or SOCKS5) is established, then relays payload both ways as
//! synthetic IPv4 segments.

pub mod error;
pub mod packet;
pub mod stack;
pub mod tcp;
pub mod tun;
pub mod udp;

pub use error::{NetStackError, Result};
pub use packet::{
    build_ipv4_tcp, build_ipv4_udp, parse_packet, verify_ipv4_checksum, Ipv4Header, ParsedPacket,
    TcpFlags, TcpInfo, TransportInfo, UdpInfo,
};
pub use stack::TunnelStack;
pub use tcp::{FlowKey, FlowState, TcpConfig, TcpEngine, TcpFlow};
pub use tun::TunDevice;
pub use udp::UdpForwarder;
