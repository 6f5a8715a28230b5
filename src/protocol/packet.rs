//! Packet and frame types
//!
//! A [`Packet`] is a typed payload with a stable [`PacketTag`]. A [`Frame`]
//! wraps a type-erased payload together with its correlation id and
//! timestamp, which is what the codec reads and writes.

use bytes::{Bytes, BytesMut};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use super::CodecError;

/// Wire identifier of a packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketTag(pub u32);

impl PacketTag {
    /// Never admitted, in either direction
    pub const INVALID: PacketTag = PacketTag(0);

    /// Admission marker: while present in an admission set, every tag passes.
    pub const BYPASS_ALL: PacketTag = PacketTag(u32::MAX);

    pub const AUTHENTICATE: PacketTag = PacketTag(0xFFFF_FF01);
    pub const MEMBERSHIP_SNAPSHOT: PacketTag = PacketTag(0xFFFF_FF02);
    pub const IDENTITY_ACTIVE: PacketTag = PacketTag(0xFFFF_FF03);
    pub const IDENTITY_INACTIVE: PacketTag = PacketTag(0xFFFF_FF04);
    pub const ROUTING_REQUEST: PacketTag = PacketTag(0xFFFF_FF05);
    pub const ROUTING_RESULT: PacketTag = PacketTag(0xFFFF_FF06);
    pub const RELAY_DELIVERY: PacketTag = PacketTag(0xFFFF_FF07);
    pub const KEEP_ALIVE: PacketTag = PacketTag(0xFFFF_FF08);

    /// Tags the protocol itself needs to function
    pub const SYSTEM: [PacketTag; 8] = [
        Self::AUTHENTICATE,
        Self::MEMBERSHIP_SNAPSHOT,
        Self::IDENTITY_ACTIVE,
        Self::IDENTITY_INACTIVE,
        Self::ROUTING_REQUEST,
        Self::ROUTING_RESULT,
        Self::RELAY_DELIVERY,
        Self::KEEP_ALIVE,
    ];
}

impl fmt::Display for PacketTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A typed packet body.
///
/// `encode` and `decode` cover only the type specific fields; the frame
/// header is written by the codec.
pub trait Packet: fmt::Debug + Send + Sync + 'static {
    const TAG: PacketTag;

    fn encode(&self, buf: &mut BytesMut);

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError>
    where
        Self: Sized;
}

/// Object-safe view of a payload, implemented for every [`Packet`].
pub trait Payload: fmt::Debug + Send + Sync + 'static {
    fn tag(&self) -> PacketTag;

    fn encode_body(&self, buf: &mut BytesMut);

    fn as_any(&self) -> &dyn Any;
}

impl<P: Packet> Payload for P {
    fn tag(&self) -> PacketTag {
        P::TAG
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        self.encode(buf)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An already-encoded payload body, carried without knowing its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub tag: PacketTag,
    pub body: Bytes,
}

impl RawPayload {
    pub fn new(tag: PacketTag, body: Bytes) -> Self {
        Self { tag, body }
    }

    pub fn from_packet<P: Packet>(packet: &P) -> Self {
        let mut body = BytesMut::new();
        packet.encode(&mut body);
        Self {
            tag: P::TAG,
            body: body.freeze(),
        }
    }
}

impl Payload for RawPayload {
    fn tag(&self) -> PacketTag {
        self.tag
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.body);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// One protocol frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// `None` is written as [`super::NO_CORRELATION`]
    pub correlation_id: Option<Uuid>,
    /// Milliseconds since the epoch at creation time
    pub timestamp: i64,
    payload: Arc<dyn Payload>,
}

impl Frame {
    pub fn new<P: Packet>(packet: P) -> Self {
        Self::from_payload(Arc::new(packet))
    }

    pub fn from_payload(payload: Arc<dyn Payload>) -> Self {
        Self {
            correlation_id: None,
            timestamp: now_millis(),
            payload,
        }
    }

    pub fn with_correlation(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn tag(&self) -> PacketTag {
        self.payload.tag()
    }

    pub fn payload(&self) -> &dyn Payload {
        self.payload.as_ref()
    }

    /// Borrow the payload as a concrete packet type
    pub fn packet<P: Packet>(&self) -> Option<&P> {
        self.payload.as_any().downcast_ref::<P>()
    }

    pub fn is<P: Packet>(&self) -> bool {
        self.packet::<P>().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::KeepAlive;

    #[test]
    fn test_frame_downcast() {
        let frame = Frame::new(KeepAlive);
        assert_eq!(frame.tag(), PacketTag::KEEP_ALIVE);
        assert!(frame.is::<KeepAlive>());
        assert!(frame.correlation_id.is_none());
    }

    #[test]
    fn test_raw_payload_keeps_tag_and_body() {
        let raw = RawPayload::new(PacketTag(42), Bytes::from_static(b"abc"));
        let frame = Frame::from_payload(Arc::new(raw.clone()));
        assert_eq!(frame.tag(), PacketTag(42));

        let mut buf = BytesMut::new();
        frame.payload().encode_body(&mut buf);
        assert_eq!(&buf[..], b"abc");
        assert!(frame.packet::<KeepAlive>().is_none());
    }

    #[test]
    fn test_system_tags_exclude_markers() {
        assert!(!PacketTag::SYSTEM.contains(&PacketTag::BYPASS_ALL));
        assert!(!PacketTag::SYSTEM.contains(&PacketTag::INVALID));
    }
}
