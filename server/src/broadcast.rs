//! Broadcast encoder: one snapshot datagram per live session per tick

use crate::registry::ClientSession;
use log::{debug, warn};
use shared::{encode_snapshot, BroadcastFormat};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Largest payload a single UDP datagram can carry over IPv4
pub const MAX_DATAGRAM_LEN: usize = 65_507;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: usize,
    pub failed: usize,
    /// Sessions with no known destination port yet
    pub skipped: usize,
    /// The configured format did not fit one datagram
    pub positions_only: bool,
}

pub struct Broadcaster {
    socket: Arc<UdpSocket>,
    format: BroadcastFormat,
    response_port: Option<u16>,
    oversize_warned: AtomicBool,
}

impl Broadcaster {
    /// With `response_port` set, every datagram goes to that port instead of
    /// the port the session's last update arrived from.
    pub fn new(socket: Arc<UdpSocket>, format: BroadcastFormat, response_port: Option<u16>) -> Self {
        Self {
            socket,
            format,
            response_port,
            oversize_warned: AtomicBool::new(false),
        }
    }

    pub fn destination(&self, session: &ClientSession) -> Option<SocketAddr> {
        self.response_port
            .or(session.reply_port)
            .map(|port| SocketAddr::new(session.addr, port))
    }

    /// Sends the encoded snapshot to every session in it
    ///
    /// A failed send is logged and counted; it never stops delivery to the
    /// remaining sessions.
    pub async fn broadcast(&self, snapshot: &[ClientSession]) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        if snapshot.is_empty() {
            return report;
        }

        let mut payload = encode_snapshot(snapshot.iter().map(|s| &s.state), self.format);
        if payload.len() > MAX_DATAGRAM_LEN && self.format != BroadcastFormat::Positions {
            if !self.oversize_warned.swap(true, Ordering::Relaxed) {
                warn!(
                    "{:?} snapshot is {} bytes, over the datagram limit; sending positions only",
                    self.format,
                    payload.len()
                );
            }
            payload = encode_snapshot(snapshot.iter().map(|s| &s.state), BroadcastFormat::Positions);
            report.positions_only = true;
        }

        for session in snapshot {
            let Some(destination) = self.destination(session) else {
                report.skipped += 1;
                continue;
            };

            match self.socket.send_to(payload.as_bytes(), destination).await {
                Ok(_) => report.sent += 1,
                Err(e) => {
                    warn!(
                        "Failed to send snapshot to client {} at {}: {}",
                        session.id, destination, e
                    );
                    report.failed += 1;
                }
            }
        }

        if report.skipped > 0 {
            debug!("{} sessions have no reply port yet", report.skipped);
        }
        report
    }
}
