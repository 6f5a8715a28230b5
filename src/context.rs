//! Per-endpoint protocol state
//!
//! A [`ProtocolContext`] is built once for a hub or a peer and handed to
//! every connection it owns. Tests build as many isolated contexts as they
//! need.

use std::sync::Arc;
use std::time::Duration;

use crate::correlation::{Correlator, PendingTable};
use crate::network::{PacketQueue, Transmitter};
use crate::protocol::{
    Decoder, Encoder, HandlerFactory, Packet, PacketRegistry, PacketTag,
};

/// Protocol timing knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Ceiling for blocking requests
    pub request_timeout: Duration,
    /// Fixed deadline for future-based requests
    pub response_deadline: Duration,
    /// Pause between receiving a routing request and acting on it
    pub relay_delay: Duration,
    /// Gap between frames drained from a [`PacketQueue`]
    pub queue_pacing: Duration,
    /// Interval used by `Peer::stay_active`
    pub keep_alive_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(2500),
            response_deadline: Duration::from_millis(5000),
            relay_delay: Duration::from_millis(100),
            queue_pacing: Duration::from_millis(10),
            keep_alive_interval: Duration::from_millis(60_000),
        }
    }
}

/// Registry, correlator and timings shared by every connection of an endpoint
#[derive(Debug)]
pub struct ProtocolContext {
    registry: Arc<PacketRegistry>,
    correlator: Arc<Correlator>,
    timings: Timings,
}

impl ProtocolContext {
    pub fn new(timings: Timings) -> Self {
        let pending = PendingTable::new();
        let registry = Arc::new(PacketRegistry::new(pending.clone()));
        let correlator = Arc::new(Correlator::new(
            pending,
            timings.request_timeout,
            timings.response_deadline,
        ));

        Self {
            registry,
            correlator,
            timings,
        }
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn encoder(&self) -> Encoder {
        Encoder::new(self.registry.clone())
    }

    pub fn decoder(&self) -> Decoder {
        Decoder::new(self.registry.clone())
    }

    pub fn allow_packet(&self, tag: PacketTag) -> bool {
        self.registry.allow(tag)
    }

    pub fn disallow_packet(&self, tag: PacketTag) -> bool {
        self.registry.disallow(tag)
    }

    /// Register a packet type and admit it
    pub fn accept<P: Packet>(&self) -> bool {
        self.registry.allow_packet::<P>()
    }

    pub fn register_handler(&self, tag: PacketTag, factory: HandlerFactory) {
        self.registry.register_handler(tag, factory)
    }

    pub fn unregister_handler(&self, tag: PacketTag, factory: &HandlerFactory) -> bool {
        self.registry.unregister_handler(tag, factory)
    }

    /// A paced outbound queue over `transmitter`
    pub fn queue(&self, transmitter: Transmitter) -> Arc<PacketQueue> {
        PacketQueue::new(transmitter, self.timings.queue_pacing)
    }
}

impl Default for ProtocolContext {
    fn default() -> Self {
        Self::new(Timings::default())
    }
}
