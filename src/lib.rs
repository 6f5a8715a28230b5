//! RelayNet - permission-gated binary packet protocol
//!
//! Peers connect to a hub, authenticate with an [`Identity`](protocol::Identity)
//! and can then route packets to one another through it. Every inbound frame
//! passes an admission check against the [`PacketRegistry`](protocol::PacketRegistry)
//! before any handler sees it. Requests are matched to their responses by
//! correlation id, either blocking the caller or through a future.

pub mod config;
pub mod context;
pub mod correlation;
pub mod network;
pub mod protocol;

pub use context::{ProtocolContext, Timings};
pub use network::{Hub, HubEvent, NetworkConfig, Peer, PeerEvent};
pub use protocol::{Frame, Identity, Packet, PacketTag, RoutingOutcome};
