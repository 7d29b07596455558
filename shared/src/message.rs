//! Reliable-channel messages and their length-prefixed frame encoding
//!
//! Every frame on the reliable channel is a 4-byte big-endian payload length
//! followed by a bincode-encoded [`Message`]. The message itself is a loose
//! `kind`/`content` pair so that unknown kinds can still be decoded and
//! answered with an `error` response instead of being dropped on the floor.

use crate::ClientId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on a single frame payload
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Size of the length prefix preceding every frame payload
pub const FRAME_HEADER_LEN: usize = 4;

/// Well-known message kinds
pub mod kind {
    pub const NAME: &str = "name";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ID: &str = "id";
    pub const PORT: &str = "port";
    pub const ERROR: &str = "error";
    pub const CHAT: &str = "chat";
    pub const DISCONNECT: &str = "disconnect";

    // Lobby
    pub const GET_IDLE_CLIENTS: &str = "get-idle-clients";
    pub const IDLE_CLIENTS: &str = "idle-clients";
    pub const INVITE: &str = "invite-player";
    pub const ENTER_GAME: &str = "enter-game";
    pub const GO_IDLE: &str = "go-idle";
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),

    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: String,
    pub content: String,
}

impl Message {
    pub fn new(kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
        }
    }

    pub fn name(display_name: impl Into<String>) -> Self {
        Self::new(kind::NAME, display_name)
    }

    pub fn ping() -> Self {
        Self::new(kind::PING, "")
    }

    pub fn pong() -> Self {
        Self::new(kind::PONG, "")
    }

    pub fn id(client_id: ClientId) -> Self {
        Self::new(kind::ID, client_id.to_string())
    }

    pub fn port(port: u16) -> Self {
        Self::new(kind::PORT, port.to_string())
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(kind::ERROR, reason)
    }

    pub fn chat(text: impl Into<String>) -> Self {
        Self::new(kind::CHAT, text)
    }

    pub fn disconnect() -> Self {
        Self::new(kind::DISCONNECT, "")
    }

    pub fn get_idle_clients() -> Self {
        Self::new(kind::GET_IDLE_CLIENTS, "")
    }

    /// Lobby listing as `id:name` pairs separated by commas
    pub fn idle_clients(clients: &[(ClientId, String)]) -> Self {
        let listing = clients
            .iter()
            .map(|(id, name)| format!("{}:{}", id, name))
            .collect::<Vec<_>>()
            .join(",");
        Self::new(kind::IDLE_CLIENTS, listing)
    }

    pub fn invite(target: ClientId) -> Self {
        Self::new(kind::INVITE, target.to_string())
    }

    pub fn enter_game(room: ClientId) -> Self {
        Self::new(kind::ENTER_GAME, room.to_string())
    }

    pub fn go_idle() -> Self {
        Self::new(kind::GO_IDLE, "")
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

/// Encodes a message into a complete frame, length prefix included
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, WireError> {
    let payload = bincode::serialize(message).map_err(WireError::Encode)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads the payload length out of a frame header
///
/// Rejects lengths above [`MAX_FRAME_LEN`] before any payload buffer is
/// allocated for them.
pub fn frame_len(header: [u8; FRAME_HEADER_LEN]) -> Result<usize, WireError> {
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    Ok(len)
}

/// Decodes a frame payload (without its length prefix)
pub fn decode_message(payload: &[u8]) -> Result<Message, WireError> {
    bincode::deserialize(payload).map_err(WireError::Decode)
}

/// Parses the content of an `idle-clients` message
///
/// Entries that do not start with a numeric id are skipped.
pub fn parse_idle_clients(content: &str) -> Vec<(ClientId, String)> {
    content
        .split(',')
        .filter_map(|entry| {
            let (id, name) = entry.split_once(':')?;
            Some((id.parse().ok()?, name.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_clients_listing() {
        let clients = vec![(1, "Bo".to_string()), (4, "Cy:2".to_string())];
        let message = Message::idle_clients(&clients);

        assert!(message.is(kind::IDLE_CLIENTS));
        assert_eq!(message.content, "1:Bo,4:Cy:2");
        assert_eq!(parse_idle_clients(&message.content), clients);
        assert!(parse_idle_clients("").is_empty());
    }

    #[test]
    fn test_frame_carries_length_prefix() {
        let frame = encode_frame(&Message::name("Ada")).unwrap();
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&frame[..FRAME_HEADER_LEN]);

        let len = frame_len(header).unwrap();
        assert_eq!(len, frame.len() - FRAME_HEADER_LEN);

        let decoded = decode_message(&frame[FRAME_HEADER_LEN..]).unwrap();
        assert!(decoded.is(kind::NAME));
        assert_eq!(decoded.content, "Ada");
    }

    #[test]
    fn test_oversized_header_rejected() {
        let header = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        assert!(matches!(frame_len(header), Err(WireError::FrameTooLarge(_))));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let message = Message::chat("x".repeat(MAX_FRAME_LEN));
        assert!(matches!(
            encode_frame(&message),
            Err(WireError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_garbage_payload_fails_to_decode() {
        assert!(decode_message(&[]).is_err());
        assert!(decode_message(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]).is_err());
    }

    #[test]
    fn test_constructors_use_expected_kinds() {
        assert_eq!(Message::id(7), Message::new("id", "7"));
        assert_eq!(Message::port(54322), Message::new("port", "54322"));
        assert!(Message::ping().is(kind::PING));
        assert!(Message::pong().is(kind::PONG));
        assert!(Message::error("nope").is(kind::ERROR));
        assert!(Message::disconnect().is(kind::DISCONNECT));
    }
}
