//! Packets exchanged on the control channel, with their stream codec.
//!
//! The channel is one TLS link per client session; packets are bincode
//! records behind a u32 length prefix. Payload bytes are opaque here: empty
//! for `connection`/`destroyed` topics, an encoded [`crate::frame`] buffer
//! for `message` topics.

use serde::{Deserialize, Serialize};
use tokio_util::{
    bytes::{Buf, BufMut, BytesMut},
    codec::{Decoder, Encoder},
};

/// Upper bound for one control packet on the wire. Keeps a corrupted length
/// prefix from pinning the connection's memory.
pub const MAX_CONTROL_FRAME: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlPacket {
    /// First packet of a session; `client_id` is the wire form of
    /// [`crate::ClientId`].
    Hello { client_id: String },
    HelloAck { success: bool, message: Option<String> },
    Publish { seq: u64, topic: String, qos: u8, payload: Vec<u8> },
    /// Sent by the receiver for qos > 0 publishes.
    PubAck { seq: u64 },
    Ping,
    Pong,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("control frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Default)]
pub struct ControlCodec;

impl Encoder<ControlPacket> for ControlCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ControlPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = bincode::serialize(&item)?;
        if body.len() > MAX_CONTROL_FRAME {
            return Err(CodecError::FrameTooLarge(body.len()));
        }
        dst.reserve(LEN_PREFIX + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

impl Decoder for ControlCodec {
    type Item = ControlPacket;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if body_len > MAX_CONTROL_FRAME {
            return Err(CodecError::FrameTooLarge(body_len));
        }
        if src.len() < LEN_PREFIX + body_len {
            src.reserve(LEN_PREFIX + body_len - src.len());
            return Ok(None);
        }
        src.advance(LEN_PREFIX);
        let body = src.split_to(body_len);
        Ok(Some(bincode::deserialize(&body)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();
        let packet = ControlPacket::Publish {
            seq: 7,
            topic: "9000/tcp/message/abc".to_string(),
            qos: 1,
            payload: vec![1, 2, 3],
        };
        codec.encode(packet.clone(), &mut buf).expect("should encode");
        assert_eq!(codec.decode(&mut buf).expect("should decode"), Some(packet));
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_across_partial_reads() {
        let mut codec = ControlCodec;
        let mut full = BytesMut::new();
        codec.encode(ControlPacket::Ping, &mut full).expect("should encode");
        codec
            .encode(
                ControlPacket::Hello {
                    client_id: "9000/tcp/u/s".to_string(),
                },
                &mut full,
            )
            .expect("should encode");

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&full[..3]);
        assert_eq!(codec.decode(&mut partial).expect("should decode"), None);
        partial.extend_from_slice(&full[3..]);
        assert_eq!(codec.decode(&mut partial).expect("should decode"), Some(ControlPacket::Ping));
        assert!(matches!(
            codec.decode(&mut partial).expect("should decode"),
            Some(ControlPacket::Hello { .. })
        ));
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let mut codec = ControlCodec;
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_CONTROL_FRAME + 1) as u32);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::FrameTooLarge(_))));
    }
}
