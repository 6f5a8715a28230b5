//! Protocol module - Defines the RelayNet wire protocol
//!
//! Every frame on the byte stream is delimited by a small transport header:
//! - 4 bytes magic
//! - 4 bytes frame length (big-endian)
//!
//! followed by the frame itself:
//! - 4 bytes type tag (big-endian)
//! - 16 bytes correlation id (sentinel when uncorrelated)
//! - 8 bytes timestamp, milliseconds since the epoch (big-endian)
//! - Variable length, type specific payload

mod codec;
mod identity;
mod message;
mod packet;
mod registry;
pub mod wire;

pub use codec::*;
pub use identity::*;
pub use message::*;
pub use packet::*;
pub use registry::*;

use uuid::Uuid;

/// Protocol version, reported by the CLI
pub const PROTOCOL_VERSION: u32 = 1;

/// Default port for RelayNet hubs
pub const DEFAULT_PORT: u16 = 44488;

/// Magic bytes for protocol identification
pub const MAGIC_BYTES: [u8; 4] = [0x52, 0x4C, 0x4E, 0x54]; // "RLNT"

/// Correlation id written in place of "no correlation".
///
/// `Uuid::new_v4` never yields this value: its version nibble is 0, not 4.
pub const NO_CORRELATION: Uuid = Uuid::from_u128(0x0f0f0f0f_0f0f_0f0f_f0f0_0f0f0f0f0f0f);
