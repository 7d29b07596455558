//! # Shared Wire Formats
//!
//! Types and codecs exchanged between the game server and its clients. This
//! crate performs no I/O; it only turns bytes into typed values and back.
//!
//! Two deliberately different protocols live here:
//!
//! - **Reliable channel** ([`message`]): length-prefixed, bincode-encoded
//!   [`Message`] frames used for the naming handshake and for control
//!   messages such as chat.
//! - **Unreliable channel** ([`record`], [`state`]): plain comma-delimited
//!   text. Clients send one [`InboundRecord`] per datagram; the server answers
//!   with a semicolon-terminated snapshot of every player.

pub mod message;
pub mod record;
pub mod state;

pub use message::{
    decode_message, encode_frame, frame_len, parse_idle_clients, Message, WireError,
};
pub use record::{InboundRecord, PlayerObject, PlayerUpdate, RecordError};
pub use state::{
    decode_positions, encode_snapshot, sanitize_field, BroadcastFormat, PlayerState, MAX_HEALTH,
};

/// Server-assigned player identity
pub type ClientId = u32;
