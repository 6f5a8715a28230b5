//! Packet registry and admission control
//!
//! The registry owns three tables:
//! - payload factories, mapping a tag to the function that decodes its body
//! - the admission set, the tags a connection may send and receive
//! - handler factories, invoked for every admitted, uncorrelated frame

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::{
    Authenticate, CodecError, DocumentPacket, Frame, Identity, IdentityActive, IdentityInactive,
    KeepAlive, MembershipSnapshot, Packet, PacketTag, Payload, RelayDelivery, RoutingRequest,
    RoutingResultReply,
};
use crate::correlation::PendingTable;
use crate::network::Transmitter;

/// Builds a payload from a frame body
pub type PayloadFactory = fn(&mut Bytes) -> Result<Arc<dyn Payload>, CodecError>;

/// Produces a fresh handler for each dispatched frame
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn PacketHandler> + Send + Sync>;

/// Receives admitted frames of the tags it is registered for.
///
/// A new instance is built for every frame, so handlers hold no state
/// across frames.
pub trait PacketHandler: Send {
    fn handle(&mut self, frame: &Frame, ctx: &HandlerContext);
}

impl<F> PacketHandler for F
where
    F: FnMut(&Frame, &HandlerContext) + Send,
{
    fn handle(&mut self, frame: &Frame, ctx: &HandlerContext) {
        self(frame, ctx)
    }
}

/// Wrap a constructor into a [`HandlerFactory`]
pub fn handler_factory<H, F>(make: F) -> HandlerFactory
where
    H: PacketHandler + 'static,
    F: Fn() -> H + Send + Sync + 'static,
{
    Arc::new(move || Box::new(make()) as Box<dyn PacketHandler>)
}

/// What a handler gets besides the frame
#[derive(Clone)]
pub struct HandlerContext {
    /// Connection the frame arrived on
    pub transmitter: Transmitter,
    /// Authenticated sender; for relayed frames, the routing origin
    pub sender: Option<Identity>,
}

impl HandlerContext {
    /// Answer a correlated request on the connection it came from.
    pub fn respond<P: Packet>(&self, request: &Frame, packet: P) -> bool {
        let Some(correlation_id) = request.correlation_id else {
            tracing::warn!("Cannot respond to {}: frame carries no correlation id", request.tag());
            return false;
        };
        self.transmitter
            .send_serial(Frame::new(packet).with_correlation(correlation_id))
    }
}

fn decode_erased<P: Packet>(buf: &mut Bytes) -> Result<Arc<dyn Payload>, CodecError> {
    Ok(Arc::new(P::decode(buf)?))
}

/// Tag tables shared by the codec and the dispatch path
pub struct PacketRegistry {
    factories: DashMap<PacketTag, PayloadFactory>,
    allowed: DashSet<PacketTag>,
    handlers: DashMap<PacketTag, Vec<HandlerFactory>>,
    pending: PendingTable,
}

impl fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketRegistry")
            .field("registered", &self.factories.len())
            .field("allowed", &self.allowed_tags())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl PacketRegistry {
    /// Registry with the built-in packets registered and the system tags admitted
    pub fn new(pending: PendingTable) -> Self {
        let registry = Self {
            factories: DashMap::new(),
            allowed: DashSet::new(),
            handlers: DashMap::new(),
            pending,
        };

        registry.register::<Authenticate>();
        registry.register::<MembershipSnapshot>();
        registry.register::<IdentityActive>();
        registry.register::<IdentityInactive>();
        registry.register::<RoutingRequest>();
        registry.register::<RoutingResultReply>();
        registry.register::<RelayDelivery>();
        registry.register::<KeepAlive>();
        registry.register::<DocumentPacket>();

        for tag in PacketTag::SYSTEM {
            registry.allowed.insert(tag);
        }

        registry
    }

    /// Make a packet type decodable. Registering does not admit it.
    pub fn register<P: Packet>(&self) {
        self.factories.insert(P::TAG, decode_erased::<P>);
    }

    pub fn is_registered(&self, tag: PacketTag) -> bool {
        self.factories.contains_key(&tag)
    }

    /// Construct a payload from its tag and body
    pub fn decode_payload(
        &self,
        tag: PacketTag,
        body: &mut Bytes,
    ) -> Result<Arc<dyn Payload>, CodecError> {
        let factory = *self
            .factories
            .get(&tag)
            .ok_or(CodecError::UnknownTag(tag))?;
        factory(body)
    }

    /// Admit a tag. Returns false if it was already admitted.
    pub fn allow(&self, tag: PacketTag) -> bool {
        let added = self.allowed.insert(tag);
        if added {
            tracing::debug!("Packet tag {} allowed", tag);
        }
        added
    }

    /// Withdraw a tag. Returns false if it was not admitted.
    pub fn disallow(&self, tag: PacketTag) -> bool {
        let removed = self.allowed.remove(&tag).is_some();
        if removed {
            tracing::debug!("Packet tag {} disallowed", tag);
        }
        removed
    }

    /// Register and admit a packet type in one go
    pub fn allow_packet<P: Packet>(&self) -> bool {
        self.register::<P>();
        self.allow(P::TAG)
    }

    pub fn allowed_tags(&self) -> Vec<PacketTag> {
        let mut tags: Vec<_> = self.allowed.iter().map(|tag| *tag).collect();
        tags.sort();
        tags
    }

    /// Admission rule shared by the encode and decode paths.
    ///
    /// A frame passes if its tag is admitted, if it answers a pending
    /// request, or if the bypass marker is admitted. Tag 0 never passes.
    pub fn is_allowed(&self, tag: PacketTag, correlation_id: Option<Uuid>) -> bool {
        if tag == PacketTag::INVALID {
            return false;
        }
        if self.allowed.contains(&tag) {
            return true;
        }
        if correlation_id.is_some_and(|id| self.pending.contains(&id)) {
            return true;
        }
        self.allowed.contains(&PacketTag::BYPASS_ALL)
    }

    pub fn is_frame_allowed(&self, frame: &Frame) -> bool {
        self.is_allowed(frame.tag(), frame.correlation_id)
    }

    pub fn register_handler(&self, tag: PacketTag, factory: HandlerFactory) {
        self.handlers.entry(tag).or_default().push(factory);
    }

    /// Remove a previously registered factory (matched by pointer).
    pub fn unregister_handler(&self, tag: PacketTag, factory: &HandlerFactory) -> bool {
        let Some(mut handlers) = self.handlers.get_mut(&tag) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|registered| !Arc::ptr_eq(registered, factory));
        let removed = handlers.len() != before;
        let now_empty = handlers.is_empty();
        drop(handlers);

        if now_empty {
            self.handlers.remove_if(&tag, |_, handlers| handlers.is_empty());
        }
        removed
    }

    pub fn handler_count(&self, tag: PacketTag) -> usize {
        self.handlers.get(&tag).map(|h| h.len()).unwrap_or(0)
    }

    /// Run every handler registered for the frame's tag. Returns how many ran.
    pub fn dispatch(&self, frame: &Frame, ctx: &HandlerContext) -> usize {
        // Clone out so handlers may (un)register without deadlocking the shard
        let factories = match self.handlers.get(&frame.tag()) {
            Some(handlers) => handlers.value().clone(),
            None => {
                tracing::debug!("No handler registered for packet tag {}", frame.tag());
                return 0;
            }
        };

        for factory in &factories {
            let mut handler = factory();
            handler.handle(frame, ctx);
        }
        factories.len()
    }
}
