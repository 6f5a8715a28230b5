//! Protocol codec for encoding/decoding frames
//!
//! Handles framing on the byte stream plus the admission check on both
//! directions. A frame that fails admission, carries an unknown tag or has
//! a malformed body is logged and skipped; only transport-level corruption
//! (bad magic, oversized length) is reported as an error.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use thiserror::Error;

use super::wire;
use super::{Frame, PacketRegistry, PacketTag, MAGIC_BYTES, NO_CORRELATION};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Header size: magic(4) + length(4) = 8 bytes
const HEADER_SIZE: usize = 8;

/// Frame prefix: tag(4) + correlation(16) + timestamp(8) = 28 bytes
const FRAME_PREFIX_SIZE: usize = 28;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Frame too large: {0} bytes (max: {1})")]
    FrameTooLarge(usize, usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Unknown packet tag {0}")]
    UnknownTag(PacketTag),

    #[error("Packet tag {0} not admitted")]
    NotAdmitted(PacketTag),

    #[error("Truncated field: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,

    #[error("Malformed payload: {0}")]
    Malformed(String),
}

impl CodecError {
    /// Whether the stream can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CodecError::InvalidMagic | CodecError::FrameTooLarge(..) | CodecError::Io(_)
        )
    }
}

/// Encodes frames into the wire format
#[derive(Clone)]
pub struct Encoder {
    registry: Arc<PacketRegistry>,
}

impl Encoder {
    pub fn new(registry: Arc<PacketRegistry>) -> Self {
        Self { registry }
    }

    /// Encode a frame into a buffer.
    ///
    /// Frames that fail admission are not written and yield
    /// [`CodecError::NotAdmitted`].
    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) -> Result<(), CodecError> {
        let tag = frame.tag();
        if !self.registry.is_frame_allowed(frame) {
            return Err(CodecError::NotAdmitted(tag));
        }

        let mut body = BytesMut::with_capacity(FRAME_PREFIX_SIZE + 64);
        body.put_u32(tag.0);
        wire::put_uuid(&mut body, &frame.correlation_id.unwrap_or(NO_CORRELATION));
        body.put_i64(frame.timestamp);
        frame.payload().encode_body(&mut body);

        if body.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(body.len(), MAX_FRAME_SIZE));
        }

        // Write header
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u32(body.len() as u32);

        // Write frame
        buf.put_slice(&body);
        Ok(())
    }
}

/// Decodes frames from the wire format
pub struct Decoder {
    registry: Arc<PacketRegistry>,
    state: DecodeState,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Frame {
        length: usize,
    },
}

impl Decoder {
    pub fn new(registry: Arc<PacketRegistry>) -> Self {
        Self {
            registry,
            state: DecodeState::Header,
        }
    }

    /// Attempt to decode a frame from the buffer.
    ///
    /// Returns Ok(None) if more data is needed. Dropped frames are consumed
    /// and decoding continues with the next one.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    // Check magic bytes
                    if buf[0..4] != MAGIC_BYTES {
                        return Err(CodecError::InvalidMagic);
                    }

                    let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
                    if length > MAX_FRAME_SIZE {
                        return Err(CodecError::FrameTooLarge(length, MAX_FRAME_SIZE));
                    }

                    buf.advance(HEADER_SIZE);
                    self.state = DecodeState::Frame { length };
                }
                DecodeState::Frame { length } => {
                    if buf.len() < length {
                        return Ok(None);
                    }

                    let raw = buf.split_to(length).freeze();
                    self.state = DecodeState::Header;

                    match self.decode_frame(raw) {
                        Ok(frame) => return Ok(Some(frame)),
                        Err(CodecError::NotAdmitted(tag)) => {
                            tracing::warn!("Dropped inbound frame: packet tag {} not admitted", tag);
                        }
                        Err(e) => {
                            tracing::warn!("Dropped inbound frame: {}", e);
                        }
                    }
                }
            }
        }
    }

    fn decode_frame(&self, mut raw: Bytes) -> Result<Frame, CodecError> {
        let tag = PacketTag(wire::get_u32(&mut raw)?);
        let correlation = wire::get_uuid(&mut raw)?;
        let correlation_id = (correlation != NO_CORRELATION).then_some(correlation);
        let timestamp = wire::get_i64(&mut raw)?;

        // Admission runs before the payload is constructed
        if !self.registry.is_allowed(tag, correlation_id) {
            return Err(CodecError::NotAdmitted(tag));
        }

        let payload = self.registry.decode_payload(tag, &mut raw)?;
        if raw.has_remaining() {
            tracing::debug!("{} trailing bytes after packet tag {}", raw.remaining(), tag);
        }

        let mut frame = Frame::from_payload(payload).with_timestamp(timestamp);
        frame.correlation_id = correlation_id;
        Ok(frame)
    }
}
