// src/core/protocol/codec.rs

//! Implements the wire framing for [`Frame`]s and the corresponding
//! `Encoder` and `Decoder` for network communication.
//!
//! Each frame is a 4-byte little-endian length prefix followed by the JSON
//! encoding of the frame envelope. The framing layer delivers one decoded
//! frame at a time to the connection state machine.

use crate::core::errors::LogBusError;
use crate::core::protocol::Frame;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Length of the frame-size prefix.
const LENGTH_PREFIX_LEN: usize = 4;

// Protocol-level limit to prevent denial-of-service via a huge declared length.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64MB max encoded frame size.

/// A `tokio_util::codec` implementation for encoding and decoding [`Frame`]s.
#[derive(Debug)]
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = LogBusError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(LogBusError::FrameTooLarge(payload.len()));
        }
        dst.reserve(LENGTH_PREFIX_LEN + payload.len());
        dst.put_u32_le(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = LogBusError;

    /// Decodes a [`Frame`] from a `BytesMut` buffer. Returns `Ok(None)` when
    /// more data is needed; any malformed payload is a protocol error that
    /// terminates the connection.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let declared = u32::from_le_bytes(src[..LENGTH_PREFIX_LEN].try_into().unwrap()) as usize;
        if declared > MAX_FRAME_SIZE {
            return Err(LogBusError::FrameTooLarge(declared));
        }
        if src.len() < LENGTH_PREFIX_LEN + declared {
            // Reserve for the rest of the frame to reduce reallocation churn.
            src.reserve(LENGTH_PREFIX_LEN + declared - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_LEN);
        let payload = src.split_to(declared);
        let frame: Frame = serde_json::from_slice(&payload)?;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{Document, FrameType};

    fn ping_frame() -> Frame {
        Frame::new(FrameType::Ping, Document::new())
    }

    #[test]
    fn decode_returns_none_on_partial_frame() {
        let mut buf = BytesMut::new();
        FrameCodec.encode(ping_frame(), &mut buf).unwrap();
        let full = buf.clone();

        // Feed everything except the final byte.
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(FrameCodec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 1..]);
        let frame = FrameCodec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame, ping_frame());
    }

    #[test]
    fn decode_rejects_oversized_declared_length() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(u32::MAX);
        buf.extend_from_slice(b"garbage");
        let err = FrameCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, LogBusError::FrameTooLarge(_)));
    }

    #[test]
    fn decode_rejects_malformed_payload() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(3);
        buf.extend_from_slice(b"{{{");
        assert!(FrameCodec.decode(&mut buf).is_err());
    }
}
