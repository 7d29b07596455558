//! Error kinds surfaced at component boundaries
//!
//! Only [`ProtocolError`] is ever echoed to a client, as the content of an
//! `error` response. Transport failures stay inside the task that hit them.

use crate::config::ConfigError;
use crate::registry::RegistryError;
use shared::WireError;
use std::net::SocketAddr;
use thiserror::Error;

/// Handshake or framing violation by a client on the reliable channel
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected initial message kind {0:?}")]
    UnexpectedKind(String),

    #[error("display name must not be empty")]
    EmptyName,

    #[error("malformed frame: {0}")]
    Frame(#[from] WireError),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("server full")]
    ServerFull,

    #[error("{0}")]
    Registry(#[from] RegistryError),
}

impl ProtocolError {
    /// Human-readable reason sent back in the `error` response
    pub fn reason(&self) -> String {
        match self {
            ProtocolError::UnexpectedKind(kind) => format!(
                "invalid initial message {:?}, expected \"name\" or \"ping\"; closing connection",
                kind
            ),
            other => other.to_string(),
        }
    }
}

/// Failure scoped to a single reliable connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl From<WireError> for ConnectionError {
    fn from(err: WireError) -> Self {
        ConnectionError::Protocol(ProtocolError::Frame(err))
    }
}

/// Fatal errors while bringing the server up
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
