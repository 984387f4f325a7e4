//! Protocol module - Defines the peer wire protocol
//!
//! Every frame is a single opcode byte followed by an opcode-specific payload.
//! All integers are big-endian, strings are length-prefixed UTF-16 code units:
//! - 1 byte opcode
//! - Payload (see [`Frame`])
//!
//! Frames are concatenated back to back on a persistent TCP connection, with
//! no outer length header.

mod message;
mod codec;

pub use message::*;
pub use codec::*;

/// Default port for the peer listener
pub const DEFAULT_PEER_PORT: u16 = 9119;

/// Default port for the rendezvous service
pub const DEFAULT_RENDEZVOUS_PORT: u16 = 9118;

/// Wire opcodes for the peer protocol
pub mod opcode {
    pub const TEXT: u8 = 0x1A;
    pub const NAME: u8 = 0x1B;
    pub const PORT_ACK: u8 = 0x1C;
    pub const PEER_ADVERT: u8 = 0x1D;
    pub const PING: u8 = 0x1E;
    pub const PONG: u8 = 0x1F;
    pub const NAME_CONFLICT: u8 = 0x20;
    pub const VOICE: u8 = 0x21;
}
