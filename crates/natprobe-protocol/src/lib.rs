//! natprobe Protocol -- NAT discovery wire types and datagram codec.
//!
//! UDP between gateways. One message per datagram.
//! 4-byte big-endian magic + 1-byte version + serde JSON body.

pub mod codec;
pub mod messages;

pub use codec::{decode_message, encode_message, DatagramCodec};
pub use messages::*;

/// Protocol magic number: "NATP".
pub const PROTOCOL_MAGIC: u32 = 0x4E41_5450;

/// Minimum supported protocol version.
pub const VERSION_MIN: u8 = 1;

/// Maximum supported protocol version.
pub const VERSION_MAX: u8 = 1;

/// Version stamped on outgoing datagrams.
pub const VERSION_CURRENT: u8 = VERSION_MAX;

/// Largest datagram either side will produce or accept.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid magic: expected {expected:#010x}, got {got:#010x}")]
    InvalidMagic { expected: u32, got: u32 },
    #[error("version mismatch: peer sent {version}, we support {our_min}-{our_max}")]
    VersionMismatch { version: u8, our_min: u8, our_max: u8 },
    #[error("datagram too large: {size} bytes (max {max})")]
    DatagramTooLarge { size: usize, max: usize },
    #[error("datagram truncated: {size} bytes")]
    Truncated { size: usize },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Raised by `FramedRead`/`FramedWrite`; the codec traits require it.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
