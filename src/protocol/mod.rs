//! Protocol module - Defines the wire protocol spoken by simulator clients
//!
//! Every message travels inside the same envelope:
//! - 4 bytes total frame length, including the envelope (big-endian)
//! - 4 bytes message type code (big-endian)
//! - Variable length body, laid out per message type
//!
//! Type codes are a closed set; an unknown code rejects the frame.

mod codec;
mod message;

pub mod chunk;

pub use codec::*;
pub use message::*;

/// Default port clients connect to
pub const DEFAULT_PORT: u16 = 3250;

/// Envelope size: length(4) + type code(4)
pub const ENVELOPE_SIZE: usize = 8;

/// Largest frame accepted or produced, envelope included
pub const MAX_FRAME_SIZE: usize = 65536;

/// Fixed width of virtual-host, client and user identifiers
pub const ID_SIZE: usize = 32;

/// Fixed width of an interface name on the wire
pub const INTERFACE_NAME_SIZE: usize = 16;

/// Fixed width of a template name in OpenTemplate
pub const TEMPLATE_NAME_SIZE: usize = 30;

/// SHA-1 digest width in AuthReply
pub const DIGEST_SIZE: usize = 20;

/// Packed width of one interface descriptor (name + mac + ip + mask)
pub const DESCRIPTOR_SIZE: usize = 30;

/// Text bytes a single Banner body can carry
pub const BANNER_CAPACITY: usize = MAX_FRAME_SIZE - ENVELOPE_SIZE;

/// Text bytes a single Close body can carry. Equal to [`BANNER_CAPACITY`]
/// today because neither message carries a fixed prefix, but nothing in the
/// protocol promises that stays true, so the two are independent constants.
pub const CLOSE_CAPACITY: usize = MAX_FRAME_SIZE - ENVELOPE_SIZE;
