//! Datagram codec for NAT discovery messages.
//!
//! Wire format: 4-byte big-endian magic + 1-byte version + serde JSON body.
//! A datagram carries exactly one message; there is no length prefix because
//! UDP preserves message boundaries.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::DiscoveryMessage;
use crate::{ProtocolError, MAX_DATAGRAM_SIZE, PROTOCOL_MAGIC, VERSION_CURRENT, VERSION_MAX, VERSION_MIN};

/// Magic + version.
const HEADER_SIZE: usize = 5;

/// Codec for one `DiscoveryMessage` per datagram buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct DatagramCodec;

impl Decoder for DatagramCodec {
    type Item = DiscoveryMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let datagram = src.split_to(src.len());
        decode_message(&datagram).map(Some)
    }
}

impl Encoder<DiscoveryMessage> for DatagramCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: DiscoveryMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item)?;
        let size = HEADER_SIZE + body.len();

        if size > MAX_DATAGRAM_SIZE {
            return Err(ProtocolError::DatagramTooLarge {
                size,
                max: MAX_DATAGRAM_SIZE,
            });
        }

        dst.reserve(size);
        dst.put_u32(PROTOCOL_MAGIC);
        dst.put_u8(VERSION_CURRENT);
        dst.extend_from_slice(&body);

        Ok(())
    }
}

/// Serialize one message into a datagram payload.
pub fn encode_message(message: &DiscoveryMessage) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    DatagramCodec.encode(message.clone(), &mut buf)?;
    Ok(buf.freeze())
}

/// Parse a received datagram payload.
pub fn decode_message(mut data: &[u8]) -> Result<DiscoveryMessage, ProtocolError> {
    if data.len() > MAX_DATAGRAM_SIZE {
        return Err(ProtocolError::DatagramTooLarge {
            size: data.len(),
            max: MAX_DATAGRAM_SIZE,
        });
    }
    if data.len() < HEADER_SIZE {
        return Err(ProtocolError::Truncated { size: data.len() });
    }

    let magic = data.get_u32();
    if magic != PROTOCOL_MAGIC {
        return Err(ProtocolError::InvalidMagic {
            expected: PROTOCOL_MAGIC,
            got: magic,
        });
    }

    let version = data.get_u8();
    if !(VERSION_MIN..=VERSION_MAX).contains(&version) {
        return Err(ProtocolError::VersionMismatch {
            version,
            our_min: VERSION_MIN,
            our_max: VERSION_MAX,
        });
    }

    Ok(serde_json::from_slice(data)?)
}
