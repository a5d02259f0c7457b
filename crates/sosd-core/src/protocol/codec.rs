//! Length-prefixed framing.
//!
//! ```text
//!  0        4          8               16              24
//!  ┌────────┬──────────┬───────────────┬───────────────┬──────────────┐
//!  │ size   │ msg_type │ sender_guid   │ target_guid   │ JSON payload │
//!  │ i32 LE │ u32 LE   │ u64 LE        │ u64 LE        │              │
//!  └────────┴──────────┴───────────────┴───────────────┴──────────────┘
//! ```
//!
//! `size` counts the whole frame, header included.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{Decoder, Encoder};

use super::ProtocolError;
use crate::types::Guid;

pub use sosd_config::WIRE_HEADER_LEN as HEADER_LEN;

/// Message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    Register = 1,
    GuidBlock = 2,
    Announce = 3,
    Publish = 4,
    Query = 5,
    QueryStatus = 6,
    QueryClaim = 7,
    QueryCancel = 8,
    CacheGrab = 9,
    Pivot = 10,
    Manifest = 11,
    Probe = 12,
    Shutdown = 13,
    Sensitivity = 14,
    Desensitize = 15,
    Trigger = 16,
    Feedback = 17,
    Ack = 18,
    Results = 19,
}

impl MsgType {
    pub const ALL: [MsgType; 19] = [
        MsgType::Register,
        MsgType::GuidBlock,
        MsgType::Announce,
        MsgType::Publish,
        MsgType::Query,
        MsgType::QueryStatus,
        MsgType::QueryClaim,
        MsgType::QueryCancel,
        MsgType::CacheGrab,
        MsgType::Pivot,
        MsgType::Manifest,
        MsgType::Probe,
        MsgType::Shutdown,
        MsgType::Sensitivity,
        MsgType::Desensitize,
        MsgType::Trigger,
        MsgType::Feedback,
        MsgType::Ack,
        MsgType::Results,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }
}

/// One decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MsgType,
    pub sender: Guid,
    pub target: Guid,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: MsgType, sender: Guid, target: Guid, payload: Bytes) -> Self {
        Self {
            msg_type,
            sender,
            target,
            payload,
        }
    }

    /// A frame whose payload is `body` as JSON.
    pub fn with_body<T: Serialize>(
        msg_type: MsgType,
        sender: Guid,
        target: Guid,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(body).map_err(|source| ProtocolError::Payload {
            msg_type,
            source,
        })?;
        Ok(Self::new(msg_type, sender, target, Bytes::from(payload)))
    }

    /// Decode the JSON payload. An empty payload reads as `{}`.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let raw: &[u8] = if self.payload.is_empty() {
            b"{}"
        } else {
            &self.payload
        };
        serde_json::from_slice(raw).map_err(|source| ProtocolError::Payload {
            msg_type: self.msg_type,
            source,
        })
    }

    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Codec for [`Frame`]s over a byte stream.
#[derive(Debug, Clone)]
pub struct SosCodec {
    max_frame_bytes: usize,
}

impl SosCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes: max_frame_bytes.max(HEADER_LEN),
        }
    }
}

impl Decoder for SosCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let size = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        let len = usize::try_from(size).unwrap_or(0);
        if len < HEADER_LEN || len > self.max_frame_bytes {
            return Err(ProtocolError::FrameSize {
                size: i64::from(size),
                max: self.max_frame_bytes,
            });
        }
        let code = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);
        let msg_type = MsgType::from_code(code).ok_or(ProtocolError::UnknownMessage(code))?;

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(len);
        frame.advance(8);
        let sender = frame.get_u64_le();
        let target = frame.get_u64_le();
        Ok(Some(Frame {
            msg_type,
            sender,
            target,
            payload: frame.freeze(),
        }))
    }
}

impl Encoder<Frame> for SosCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let len = frame.wire_len();
        if len > self.max_frame_bytes {
            return Err(ProtocolError::FrameSize {
                size: len as i64,
                max: self.max_frame_bytes,
            });
        }
        dst.reserve(len);
        dst.put_i32_le(len as i32);
        dst.put_u32_le(frame.msg_type.code());
        dst.put_u64_le(frame.sender);
        dst.put_u64_le(frame.target);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn encode(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        SosCodec::new(1024).encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_header_layout() {
        let buf = encode(Frame::new(
            MsgType::Probe,
            0x0102,
            7,
            Bytes::from_static(b"{}"),
        ));
        assert_eq!(buf.len(), 26);
        assert_eq!(&buf[0..4], &26i32.to_le_bytes());
        assert_eq!(&buf[4..8], &12u32.to_le_bytes());
        assert_eq!(&buf[8..16], &0x0102u64.to_le_bytes());
        assert_eq!(&buf[16..24], &7u64.to_le_bytes());
        assert_eq!(&buf[24..], b"{}");
    }

    #[test]
    fn test_partial_reads() {
        let frame = Frame::new(MsgType::Query, 1, 2, Bytes::from_static(b"{\"sql\":\"x\"}"));
        let whole = encode(frame.clone());
        let mut codec = SosCodec::new(1024);
        let mut buf = BytesMut::new();

        // Byte by byte: nothing decodes until the last byte lands.
        for (i, b) in whole.iter().enumerate() {
            buf.put_u8(*b);
            let decoded = codec.decode(&mut buf).unwrap();
            if i + 1 < whole.len() {
                assert!(decoded.is_none());
            } else {
                assert_eq!(decoded, Some(frame.clone()));
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = encode(Frame::new(MsgType::Probe, 1, 0, Bytes::new()));
        buf.extend_from_slice(&encode(Frame::new(MsgType::Ack, 2, 0, Bytes::new())));
        let mut codec = SosCodec::new(1024);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().msg_type, MsgType::Probe);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().msg_type, MsgType::Ack);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_rejects_bad_headers() {
        let mut codec = SosCodec::new(64);

        let mut small = encode(Frame::new(MsgType::Probe, 0, 0, Bytes::new()));
        small[0..4].copy_from_slice(&10i32.to_le_bytes());
        assert!(matches!(
            codec.decode(&mut small),
            Err(ProtocolError::FrameSize { size: 10, .. })
        ));

        let mut negative = encode(Frame::new(MsgType::Probe, 0, 0, Bytes::new()));
        negative[0..4].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(codec.decode(&mut negative).is_err());

        let mut huge = encode(Frame::new(MsgType::Probe, 0, 0, Bytes::new()));
        huge[0..4].copy_from_slice(&1000i32.to_le_bytes());
        assert!(matches!(
            codec.decode(&mut huge),
            Err(ProtocolError::FrameSize { size: 1000, max: 64 })
        ));

        let mut unknown = encode(Frame::new(MsgType::Probe, 0, 0, Bytes::new()));
        unknown[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            codec.decode(&mut unknown),
            Err(ProtocolError::UnknownMessage(99))
        ));
    }

    #[test]
    fn test_encode_refuses_oversized() {
        let mut buf = BytesMut::new();
        let frame = Frame::new(MsgType::Publish, 0, 0, Bytes::from(vec![b' '; 100]));
        assert!(SosCodec::new(64).encode(frame, &mut buf).is_err());
    }

    #[test]
    fn test_empty_payload_reads_as_object() {
        #[derive(serde::Deserialize, Default)]
        #[serde(default)]
        struct Empty {
            filter: Option<String>,
        }
        let frame = Frame::new(MsgType::Manifest, 0, 0, Bytes::new());
        let body: Empty = frame.body().unwrap();
        assert!(body.filter.is_none());
    }

    #[test]
    fn test_type_codes() {
        for t in MsgType::ALL {
            assert_eq!(MsgType::from_code(t.code()), Some(t));
        }
        assert_eq!(MsgType::from_code(0), None);
        assert_eq!(MsgType::Results.code(), 19);
    }
}
