//! Codecs.
//!
//! `CommandCodec` is the seam for the command byte encoding; the bundled
//! `JsonCommandCodec` is used by tests and the TCP socket. `FrameCodec`
//! frames socket traffic: 1-byte frame tag + 4-byte big-endian length + payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;
use crate::ProtocolError;

/// Maximum frame payload: 64 KB. Commands are capped far below this before
/// they reach a socket; the margin covers server-pushed query results.
const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Tag byte + length prefix.
const HEADER_SIZE: usize = 5;

const TAG_DATA: u8 = 0;
const TAG_PING: u8 = 1;
const TAG_PONG: u8 = 2;

/// Encodes and decodes commands to opaque bytes.
pub trait CommandCodec: Send + Sync {
    fn encode(&self, command: &Command) -> Result<Vec<u8>, ProtocolError>;
    fn decode(&self, bytes: &[u8]) -> Result<Command, ProtocolError>;
}

/// serde JSON command encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCommandCodec;

impl CommandCodec for JsonCommandCodec {
    fn encode(&self, command: &Command) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(command)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Command, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One unit of socket traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Bytes),
    Ping(Bytes),
    Pong(Bytes),
}

impl Frame {
    fn tag(&self) -> u8 {
        match self {
            Frame::Data(_) => TAG_DATA,
            Frame::Ping(_) => TAG_PING,
            Frame::Pong(_) => TAG_PONG,
        }
    }

    fn payload(&self) -> &Bytes {
        match self {
            Frame::Data(b) | Frame::Ping(b) | Frame::Pong(b) => b,
        }
    }
}

/// Codec for framing [`Frame`] values over a byte stream.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let tag = src[0];
        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let total = HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();

        match tag {
            TAG_DATA => Ok(Some(Frame::Data(payload))),
            TAG_PING => Ok(Some(Frame::Ping(payload))),
            TAG_PONG => Ok(Some(Frame::Pong(payload))),
            other => Err(ProtocolError::UnknownFrame(other)),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.payload();

        if payload.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u8(item.tag());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(payload);

        Ok(())
    }
}
