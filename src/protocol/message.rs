//! Built-in protocol packets
//!
//! Defines the packets the hub and its peers exchange for authentication,
//! membership notices and routing, plus [`DocumentPacket`] for applications.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::wire;
use super::{CodecError, Identity, Packet, PacketTag, RawPayload};

/// First frame a peer sends: who it is
#[derive(Debug, Clone, PartialEq)]
pub struct Authenticate {
    pub identity: Identity,
}

impl Packet for Authenticate {
    const TAG: PacketTag = PacketTag::AUTHENTICATE;

    fn encode(&self, buf: &mut BytesMut) {
        self.identity.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            identity: Identity::decode(buf)?,
        })
    }
}

/// Every other authenticated identity, sent once to a freshly authenticated peer
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipSnapshot {
    pub identities: Vec<Identity>,
}

impl Packet for MembershipSnapshot {
    const TAG: PacketTag = PacketTag::MEMBERSHIP_SNAPSHOT;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.identities.len() as u32);
        for identity in &self.identities {
            identity.encode(buf);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let count = wire::get_u32(buf)? as usize;
        // Each identity needs at least a length prefix and a uuid
        if count > buf.len() / 20 {
            return Err(CodecError::Malformed(format!(
                "membership count {count} exceeds body size"
            )));
        }
        let identities = (0..count)
            .map(|_| Identity::decode(buf))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { identities })
    }
}

/// Broadcast when a peer joins
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityActive {
    pub identity: Identity,
}

impl Packet for IdentityActive {
    const TAG: PacketTag = PacketTag::IDENTITY_ACTIVE;

    fn encode(&self, buf: &mut BytesMut) {
        self.identity.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            identity: Identity::decode(buf)?,
        })
    }
}

/// Broadcast when a peer leaves
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityInactive {
    pub identity: Identity,
}

impl Packet for IdentityInactive {
    const TAG: PacketTag = PacketTag::IDENTITY_INACTIVE;

    fn encode(&self, buf: &mut BytesMut) {
        self.identity.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            identity: Identity::decode(buf)?,
        })
    }
}

fn encode_inner(inner: &RawPayload, buf: &mut BytesMut) {
    buf.put_u32(inner.tag.0);
    wire::put_bytes(buf, &inner.body);
}

fn decode_inner(buf: &mut Bytes) -> Result<RawPayload, CodecError> {
    let tag = PacketTag(wire::get_u32(buf)?);
    let body = wire::get_bytes(buf)?;
    Ok(RawPayload::new(tag, body))
}

/// Ask the hub to deliver `inner` to `target`
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingRequest {
    pub target: Identity,
    pub inner: RawPayload,
}

impl RoutingRequest {
    pub fn new<P: Packet>(target: Identity, packet: &P) -> Self {
        Self {
            target,
            inner: RawPayload::from_packet(packet),
        }
    }
}

impl Packet for RoutingRequest {
    const TAG: PacketTag = PacketTag::ROUTING_REQUEST;

    fn encode(&self, buf: &mut BytesMut) {
        self.target.encode(buf);
        encode_inner(&self.inner, buf);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let target = Identity::decode(buf)?;
        let inner = decode_inner(buf)?;
        Ok(Self { target, inner })
    }
}

/// A routed payload as handed to its target
#[derive(Debug, Clone, PartialEq)]
pub struct RelayDelivery {
    pub origin: Identity,
    pub inner: RawPayload,
}

impl Packet for RelayDelivery {
    const TAG: PacketTag = PacketTag::RELAY_DELIVERY;

    fn encode(&self, buf: &mut BytesMut) {
        self.origin.encode(buf);
        encode_inner(&self.inner, buf);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let origin = Identity::decode(buf)?;
        let inner = decode_inner(buf)?;
        Ok(Self { origin, inner })
    }
}

/// Result of a routing request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum RoutingOutcome {
    Success = 0,
    FailedNoClient = 1,
    FailedTimeout = 2,
    FailedUnknown = 3,
}

impl RoutingOutcome {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::FailedNoClient),
            2 => Some(Self::FailedTimeout),
            3 => Some(Self::FailedUnknown),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Hub's answer to a [`RoutingRequest`], sent under the request's correlation id
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingResultReply {
    pub outcome: RoutingOutcome,
}

impl Packet for RoutingResultReply {
    const TAG: PacketTag = PacketTag::ROUTING_RESULT;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.outcome as u32);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let raw = wire::get_u32(buf)?;
        let outcome = RoutingOutcome::from_u32(raw)
            .ok_or_else(|| CodecError::Malformed(format!("unknown routing outcome {raw}")))?;
        Ok(Self { outcome })
    }
}

/// Keeps an idle connection from looking dead
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive;

impl Packet for KeepAlive {
    const TAG: PacketTag = PacketTag::KEEP_ALIVE;

    fn encode(&self, _buf: &mut BytesMut) {}

    fn decode(_buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self)
    }
}

/// Free-form JSON document. Not admitted unless the application allows it.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentPacket {
    pub document: serde_json::Value,
}

impl DocumentPacket {
    pub fn new(document: serde_json::Value) -> Self {
        Self { document }
    }
}

impl Packet for DocumentPacket {
    const TAG: PacketTag = PacketTag(1);

    fn encode(&self, buf: &mut BytesMut) {
        wire::put_string(buf, &self.document.to_string());
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let text = wire::get_string(buf)?;
        let document =
            serde_json::from_str(&text).map_err(|e| CodecError::Malformed(e.to_string()))?;
        Ok(Self { document })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<P: Packet + Clone>(packet: &P) -> P {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        let mut bytes = buf.freeze();
        let decoded = P::decode(&mut bytes).unwrap();
        assert!(bytes.is_empty(), "trailing bytes after decode");
        decoded
    }

    #[test]
    fn test_routing_request_carries_inner_payload() {
        let target = Identity::generate("client-2");
        let inner = DocumentPacket::new(serde_json::json!({ "hello": "world" }));
        let request = RoutingRequest::new(target.clone(), &inner);

        let decoded = roundtrip(&request);
        assert_eq!(decoded.target, target);
        assert_eq!(decoded.inner.tag, DocumentPacket::TAG);

        let mut body = decoded.inner.body.clone();
        assert_eq!(DocumentPacket::decode(&mut body).unwrap(), inner);
    }

    #[test]
    fn test_membership_snapshot() {
        let snapshot = MembershipSnapshot {
            identities: vec![Identity::generate("a"), Identity::generate("b")],
        };
        assert_eq!(roundtrip(&snapshot), snapshot);
        assert_eq!(
            roundtrip(&MembershipSnapshot { identities: vec![] }).identities.len(),
            0
        );
    }

    #[test]
    fn test_membership_count_is_bounded_by_body() {
        let mut buf = BytesMut::new();
        buf.put_u32(1_000_000);
        let mut bytes = buf.freeze();
        assert!(matches!(
            MembershipSnapshot::decode(&mut bytes),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_routing_outcome_codes() {
        for outcome in [
            RoutingOutcome::Success,
            RoutingOutcome::FailedNoClient,
            RoutingOutcome::FailedTimeout,
            RoutingOutcome::FailedUnknown,
        ] {
            assert_eq!(roundtrip(&RoutingResultReply { outcome }).outcome, outcome);
        }

        let mut buf = BytesMut::new();
        buf.put_u32(9);
        assert!(RoutingResultReply::decode(&mut buf.freeze()).is_err());
    }

    #[test]
    fn test_document_rejects_invalid_json() {
        let mut buf = BytesMut::new();
        wire::put_string(&mut buf, "{not json");
        assert!(DocumentPacket::decode(&mut buf.freeze()).is_err());
    }
}
