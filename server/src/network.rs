//! Server assembly: binds both sockets and runs the three concurrency domains
//!
//! - **Gateway**: TCP accept loop plus one task per connection
//! - **Ingest**: UDP receive loop feeding the bounded ingest queue
//! - **Update loop**: fixed-interval drain, apply, evict and broadcast
//!
//! A fourth, minor task consumes the control queue when the embedding
//! application does not take it over. All of them watch one shutdown signal.

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::gateway::{ControlMessage, Gateway};
use crate::ingest::{Ingest, IngestStats};
use crate::registry::SessionRegistry;
use crate::update_loop::UpdateLoop;
use log::{error, info, warn};
use shared::message::kind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Resolves once the shutdown flag is set or its sender is gone
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

pub struct Server {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<IngestStats>,
    tcp: TcpListener,
    udp: Arc<UdpSocket>,
    control_tx: mpsc::Sender<ControlMessage>,
    control_rx: Option<mpsc::Receiver<ControlMessage>>,
}

impl Server {
    /// Validates the configuration and binds both sockets
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let tcp_addr = config.tcp_addr()?;
        let tcp = TcpListener::bind(tcp_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: tcp_addr,
                source,
            })?;

        let udp_addr = config.udp_addr()?;
        let udp = UdpSocket::bind(udp_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: udp_addr,
                source,
            })?;

        info!(
            "Server listening on tcp {} and udp {}",
            tcp.local_addr()?,
            udp.local_addr()?
        );

        let (control_tx, control_rx) = mpsc::channel(config.control_queue_capacity);

        Ok(Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            stats: Arc::new(IngestStats::default()),
            tcp,
            udp: Arc::new(udp),
            control_tx,
            control_rx: Some(control_rx),
        })
    }

    pub fn tcp_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn udp_addr(&self) -> std::io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Hands control messages to the caller instead of the built-in logger
    pub fn take_control_receiver(&mut self) -> Option<mpsc::Receiver<ControlMessage>> {
        self.control_rx.take()
    }

    /// Spawns every long-running task and returns a handle to stop them
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        let udp_port = self.udp.local_addr()?.port();
        let tcp_addr = self.tcp.local_addr()?;
        let udp_addr = self.udp.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let grace = self.config.shutdown_grace();

        let (ingest_tx, ingest_rx) = mpsc::channel(self.config.queue_capacity);

        let gateway = Gateway::new(
            self.tcp,
            Arc::clone(&self.registry),
            self.control_tx,
            udp_port,
            self.config.max_connections,
            self.config.handshake_timeout(),
        );
        let ingest = Ingest::new(
            Arc::clone(&self.udp),
            self.config.rate_limit(),
            ingest_tx,
            Arc::clone(&self.stats),
        );
        let broadcaster = Broadcaster::new(
            Arc::clone(&self.udp),
            self.config.broadcast_format,
            self.config.response_port,
        );
        let update_loop = UpdateLoop::new(
            Arc::clone(&self.registry),
            ingest_rx,
            self.config.queue_capacity,
            broadcaster,
            self.config.tick_interval(),
            self.config.session_timeout(),
            Arc::clone(&self.stats),
        );

        let mut tasks = vec![
            (
                "gateway",
                tokio::spawn(gateway.run(shutdown_rx.clone(), grace)),
            ),
            ("ingest", tokio::spawn(ingest.run(shutdown_rx.clone()))),
            (
                "update loop",
                tokio::spawn(update_loop.run(shutdown_rx.clone())),
            ),
        ];

        if let Some(control_rx) = self.control_rx {
            tasks.push((
                "control log",
                tokio::spawn(log_control_messages(control_rx, shutdown_rx)),
            ));
        }

        info!("Server started successfully");

        Ok(ServerHandle {
            shutdown_tx,
            tasks,
            grace,
            tcp_addr,
            udp_addr,
            registry: self.registry,
            stats: self.stats,
        })
    }
}

/// Default consumer for the control queue
async fn log_control_messages(
    mut control_rx: mpsc::Receiver<ControlMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let control = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            control = control_rx.recv() => match control {
                Some(control) => control,
                None => break,
            },
        };

        if control.message.is(kind::CHAT) {
            info!("[chat] client {}: {}", control.client_id, control.message.content);
        } else {
            info!(
                "Control message {:?} from client {}",
                control.message.kind, control.client_id
            );
        }
    }
}

/// Running server
///
/// Dropping the handle also signals the tasks to stop, but nothing waits for
/// them; prefer [`ServerHandle::shutdown`].
pub struct ServerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    grace: Duration,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    stats: Arc<IngestStats>,
}

impl ServerHandle {
    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    /// Signals every task to stop and waits for them
    ///
    /// The gateway uses the grace period for its connection handlers; the
    /// long-running tasks get the same budget again before being aborted.
    pub async fn shutdown(self) {
        info!("Server shutting down");
        let _ = self.shutdown_tx.send(true);

        // Gateway may spend a full grace period on its handlers first
        let deadline = tokio::time::Instant::now() + self.grace * 2;

        for (name, mut task) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{} task failed: {}", name, e),
                Err(_) => {
                    warn!("{} task did not stop in time, aborting", name);
                    task.abort();
                    let _ = task.await;
                }
            }
        }

        info!("Server stopped");
    }
}
