//! Connection gateway: reliable-channel admission and the control side channel
//!
//! Every accepted connection gets its own task, so a slow or hostile client
//! can only ever stall itself. The first message on a connection decides
//! what it is:
//! - `ping` is a liveness probe, answered with `pong` and closed
//! - `name` registers a session and is answered with its id and the UDP port
//! - anything else is answered with `error` and closed
//!
//! A registered connection stays open. It answers lobby requests
//! (`get-idle-clients`, `invite-player`, `go-idle`) and `ping` itself,
//! delivers whatever the server pushes to the client, and forwards every
//! other message to the control queue. Closing the connection or sending
//! `disconnect` removes the session; removal from the registry for any other
//! reason closes the connection.

use crate::error::{ConnectionError, ProtocolError};
use crate::framing::{read_message, write_message, FrameReader};
use crate::network::wait_for_shutdown;
use crate::registry::{SessionChannel, SessionRegistry};
use log::{debug, error, info, warn};
use shared::message::kind;
use shared::{ClientId, Message};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;

pub const MAX_DISPLAY_NAME_CHARS: usize = 32;

/// A post-handshake message from a registered client
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub client_id: ClientId,
    pub message: Message,
}

#[derive(Debug)]
enum Handshake {
    Registered(SessionChannel),
    Probe,
    Closed,
}

struct GatewayContext {
    registry: Arc<SessionRegistry>,
    control_tx: mpsc::Sender<ControlMessage>,
    udp_port: u16,
    handshake_timeout: Duration,
}

pub struct Gateway {
    listener: TcpListener,
    context: Arc<GatewayContext>,
    slots: Arc<Semaphore>,
}

impl Gateway {
    pub fn new(
        listener: TcpListener,
        registry: Arc<SessionRegistry>,
        control_tx: mpsc::Sender<ControlMessage>,
        udp_port: u16,
        max_connections: usize,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            context: Arc::new(GatewayContext {
                registry,
                control_tx,
                udp_port,
                handshake_timeout,
            }),
            slots: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Accepts connections until shutdown, then drains handler tasks
    ///
    /// Handlers get `grace` to finish after the shutdown signal; whatever is
    /// still running afterwards is aborted so no socket outlives the server.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>, grace: Duration) {
        let handler_shutdown = shutdown.clone();
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let context = Arc::clone(&self.context);
                        let slot = Arc::clone(&self.slots).try_acquire_owned();
                        let shutdown = handler_shutdown.clone();

                        handlers.spawn(async move {
                            match slot {
                                Ok(_slot) => handle_connection(&context, stream, peer, shutdown).await,
                                Err(_) => reject(stream, peer, ProtocolError::ServerFull).await,
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },

                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Connection handler panicked: {}", e);
                        }
                    }
                }
            }
        }

        drop(self.listener);
        info!("Gateway stopped accepting; waiting for {} handlers", handlers.len());

        let drained = timeout(grace, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("Aborting {} connection handlers after grace period", handlers.len());
            handlers.shutdown().await;
        }
    }
}

async fn handle_connection(
    context: &GatewayContext,
    mut stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    match serve(context, &mut stream, peer, &mut shutdown).await {
        Ok(()) => debug!("Connection from {} closed", peer),
        Err(ConnectionError::Protocol(e)) => {
            warn!("Protocol error from {}: {}", peer, e);
            if let Err(e) = write_message(&mut stream, &Message::error(e.reason())).await {
                debug!("Could not send error response to {}: {}", peer, e);
            }
        }
        Err(ConnectionError::Transport(e)) => warn!("Transport error on {}: {}", peer, e),
    }

    let _ = stream.shutdown().await;
}

async fn reject(mut stream: TcpStream, peer: SocketAddr, reason: ProtocolError) {
    warn!("Rejecting connection from {}: {}", peer, reason);
    let _ = write_message(&mut stream, &Message::error(reason.reason())).await;
    let _ = stream.shutdown().await;
}

async fn serve(
    context: &GatewayContext,
    stream: &mut TcpStream,
    peer: SocketAddr,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ConnectionError> {
    let mut session = match handshake(context, stream, peer).await? {
        Handshake::Registered(session) => session,
        Handshake::Probe | Handshake::Closed => return Ok(()),
    };

    let result = relay_control_messages(context, stream, &mut session, shutdown).await;
    context.registry.remove(session.id).await;
    result
}

async fn handshake<S>(
    context: &GatewayContext,
    stream: &mut S,
    peer: SocketAddr,
) -> Result<Handshake, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let initial = timeout(context.handshake_timeout, read_message(stream))
        .await
        .map_err(|_| ProtocolError::HandshakeTimeout)??;

    let Some(initial) = initial else {
        debug!("{} closed before sending a handshake", peer);
        return Ok(Handshake::Closed);
    };

    match initial.kind.as_str() {
        kind::PING => {
            write_message(stream, &Message::pong()).await?;
            debug!("Answered liveness probe from {}", peer);
            Ok(Handshake::Probe)
        }
        kind::NAME => {
            let name = sanitize_display_name(&initial.content).ok_or(ProtocolError::EmptyName)?;
            let session = context
                .registry
                .register(&name, peer.ip())
                .await
                .map_err(ProtocolError::from)?;

            let replied = async {
                write_message(stream, &Message::id(session.id)).await?;
                write_message(stream, &Message::port(context.udp_port)).await
            };
            if let Err(e) = replied.await {
                context.registry.remove(session.id).await;
                return Err(e);
            }

            Ok(Handshake::Registered(session))
        }
        other => Err(ProtocolError::UnexpectedKind(other.to_string()).into()),
    }
}

async fn relay_control_messages<S>(
    context: &GatewayContext,
    stream: &mut S,
    session: &mut SessionChannel,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_id = session.id;
    let (reader, mut writer) = tokio::io::split(stream);
    let mut frames = FrameReader::new(reader);

    loop {
        let message = tokio::select! {
            _ = wait_for_shutdown(shutdown) => return Ok(()),
            _ = session.closed.notified() => {
                info!("Client {} was dropped by the server, closing its connection", client_id);
                write_message(&mut writer, &Message::disconnect()).await?;
                return Ok(());
            }
            Some(push) = session.outbound.recv() => {
                write_message(&mut writer, &push).await?;
                continue;
            }
            message = frames.next_message() => message?,
        };

        let Some(message) = message else {
            info!("Client {} closed the reliable channel", client_id);
            return Ok(());
        };

        match message.kind.as_str() {
            kind::DISCONNECT => {
                info!("Client {} disconnected", client_id);
                return Ok(());
            }
            kind::PING => write_message(&mut writer, &Message::pong()).await?,
            kind::GET_IDLE_CLIENTS => {
                let idle = context.registry.idle_clients(client_id).await;
                write_message(&mut writer, &Message::idle_clients(&idle)).await?;
            }
            kind::INVITE => {
                let invited = match message.content.trim().parse::<ClientId>() {
                    Ok(target) => context
                        .registry
                        .invite(client_id, target)
                        .await
                        .map_err(|e| e.to_string()),
                    Err(_) => Err("invalid invite target".to_string()),
                };
                // enter-game arrives through the outbound queue on success
                if let Err(reason) = invited {
                    debug!("Invite from client {} refused: {}", client_id, reason);
                    write_message(&mut writer, &Message::error(reason)).await?;
                }
            }
            kind::GO_IDLE => {
                let _ = context.registry.go_idle(client_id).await;
            }
            _ => forward(context, ControlMessage { client_id, message }),
        }
    }
}

fn forward(context: &GatewayContext, control: ControlMessage) {
    match context.control_tx.try_send(control) {
        Ok(()) => {}
        Err(TrySendError::Full(dropped)) => warn!(
            "Control queue full, dropping {:?} message from client {}",
            dropped.message.kind, dropped.client_id
        ),
        Err(TrySendError::Closed(dropped)) => debug!(
            "Control queue closed, dropping message from client {}",
            dropped.client_id
        ),
    }
}

/// Cleans a client-supplied name so it cannot break the textual formats
///
/// Returns `None` if nothing is left after trimming.
pub fn sanitize_display_name(raw: &str) -> Option<String> {
    let name: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if matches!(c, ',' | ';' | '|') { '_' } else { c })
        .take(MAX_DISPLAY_NAME_CHARS)
        .collect();

    (!name.is_empty()).then_some(name)
}
