//! Minimal headless client for smoke tests and the `test_client` binary

use crate::error::ConnectionError;
use crate::framing::{read_message, write_message};
use shared::message::kind;
use shared::{ClientId, Message, PlayerUpdate};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server rejected the request: {0}")]
    Rejected(String),

    #[error("expected {expected} message, got {got:?}")]
    UnexpectedReply { expected: &'static str, got: String },

    #[error("invalid {field} in reply: {value:?}")]
    InvalidReply { field: &'static str, value: String },

    #[error("server closed the connection")]
    Closed,
}

/// A registered session's reliable channel
pub struct Registration {
    pub stream: TcpStream,
    pub client_id: ClientId,
    pub udp_port: u16,
}

impl Registration {
    /// Sends a control message on the open reliable channel
    pub async fn send(&mut self, message: &Message) -> Result<(), ProbeError> {
        write_message(&mut self.stream, message).await?;
        Ok(())
    }

    /// Next message from the server, or `None` once it closed the channel
    pub async fn recv(&mut self) -> Result<Option<Message>, ProbeError> {
        Ok(read_message(&mut self.stream).await?)
    }

    /// Ends the session politely; the server removes it right away
    pub async fn disconnect(mut self) -> Result<(), ProbeError> {
        self.send(&Message::disconnect()).await
    }
}

async fn expect_reply(stream: &mut TcpStream, expected: &'static str) -> Result<Message, ProbeError> {
    let reply = read_message(stream).await?.ok_or(ProbeError::Closed)?;
    if reply.is(kind::ERROR) {
        return Err(ProbeError::Rejected(reply.content));
    }
    if !reply.is(expected) {
        return Err(ProbeError::UnexpectedReply {
            expected,
            got: reply.kind,
        });
    }
    Ok(reply)
}

/// Liveness probe: true if the server answered `pong`
pub async fn ping(addr: SocketAddr) -> Result<bool, ProbeError> {
    let mut stream = TcpStream::connect(addr).await?;
    write_message(&mut stream, &Message::ping()).await?;
    Ok(matches!(read_message(&mut stream).await?, Some(reply) if reply.is(kind::PONG)))
}

/// Performs the `name` handshake and keeps the connection open
pub async fn register(addr: SocketAddr, display_name: &str) -> Result<Registration, ProbeError> {
    let mut stream = TcpStream::connect(addr).await?;
    write_message(&mut stream, &Message::name(display_name)).await?;

    let id = expect_reply(&mut stream, kind::ID).await?;
    let client_id = id.content.parse().map_err(|_| ProbeError::InvalidReply {
        field: "id",
        value: id.content.clone(),
    })?;

    let port = expect_reply(&mut stream, kind::PORT).await?;
    let udp_port = port.content.parse().map_err(|_| ProbeError::InvalidReply {
        field: "port",
        value: port.content.clone(),
    })?;

    Ok(Registration {
        stream,
        client_id,
        udp_port,
    })
}

/// Sends one update record to the server's datagram port
pub async fn send_update(
    socket: &UdpSocket,
    server: SocketAddr,
    update: &PlayerUpdate,
) -> Result<(), ProbeError> {
    socket.send_to(update.to_record().as_bytes(), server).await?;
    Ok(())
}

/// Sends the datagram form of a disconnect
pub async fn send_disconnect(
    socket: &UdpSocket,
    server: SocketAddr,
    client_id: ClientId,
) -> Result<(), ProbeError> {
    let record = format!("{},{}", client_id, kind::DISCONNECT);
    socket.send_to(record.as_bytes(), server).await?;
    Ok(())
}
