use thiserror::Error;

/// Network stack specific errors
#[derive(Error, Debug)]
pub enum NetStackError {
    #[error("Packet too short: expected {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("TUN device error: {0}")]
    TunError(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Device not ready")]
    DeviceNotReady,

    #[error("Stack not running")]
    NotRunning,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection timeout")]
    Timeout,

    #[error("Upstream error: {0}")]
    Upstream(#[from] tunward_core::Error),
}

pub type Result<T> = std::result::Result<T, NetStackError>;
