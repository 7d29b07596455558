//! Unreliable ingest: datagram receive loop feeding the update loop
//!
//! Each datagram is parsed, passed through the rate limiter and pushed onto
//! the bounded ingest queue. Nothing here blocks on the queue: when it is
//! full the new record is dropped and counted, so the receive loop keeps
//! draining the socket no matter how far behind the consumer falls.

use crate::network::wait_for_shutdown;
use crate::rate_limiter::RateLimiter;
use log::{debug, info, warn};
use shared::InboundRecord;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

/// Longest record accepted; anything longer is treated as malformed
pub const RECV_BUFFER_LEN: usize = 2048;

const PRUNE_EVERY: Duration = Duration::from_secs(30);
const PRUNE_OLDER_THAN: Duration = Duration::from_secs(60);

/// A parsed record waiting for the update loop
#[derive(Debug, Clone, PartialEq)]
pub struct IngestEvent {
    pub record: InboundRecord,
    pub source: SocketAddr,
    pub received_at: Instant,
}

/// What happened to one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Queued,
    Malformed,
    RateLimited,
    QueueFull,
    Closed,
}

/// Running totals for the ingest path, shared with the update loop
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    queued: AtomicU64,
    malformed: AtomicU64,
    rate_limited: AtomicU64,
    queue_full: AtomicU64,
    unknown_session: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestCounters {
    pub received: u64,
    pub queued: u64,
    pub malformed: u64,
    pub rate_limited: u64,
    pub queue_full: u64,
    pub unknown_session: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestCounters {
        IngestCounters {
            received: self.received.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            queue_full: self.queue_full.load(Ordering::Relaxed),
            unknown_session: self.unknown_session.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_unknown_session(&self) {
        self.unknown_session.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, disposition: Disposition) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let counter = match disposition {
            Disposition::Queued => &self.queued,
            Disposition::Malformed => &self.malformed,
            Disposition::RateLimited => &self.rate_limited,
            Disposition::QueueFull | Disposition::Closed => &self.queue_full,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Ingest {
    socket: Arc<UdpSocket>,
    limiter: Option<RateLimiter>,
    queue: mpsc::Sender<IngestEvent>,
    stats: Arc<IngestStats>,
    last_prune: Instant,
}

impl Ingest {
    /// `rate_limit` of `None` admits every parseable record
    pub fn new(
        socket: Arc<UdpSocket>,
        rate_limit: Option<Duration>,
        queue: mpsc::Sender<IngestEvent>,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            socket,
            limiter: rate_limit.map(RateLimiter::new),
            queue,
            stats,
            last_prune: Instant::now(),
        }
    }

    /// Parses, rate limits and enqueues one datagram
    pub fn process_datagram(
        &mut self,
        payload: &[u8],
        source: SocketAddr,
        now: Instant,
    ) -> Disposition {
        let disposition = self.admit(payload, source, now);
        self.stats.record(disposition);
        disposition
    }

    fn admit(&mut self, payload: &[u8], source: SocketAddr, now: Instant) -> Disposition {
        if payload.len() > RECV_BUFFER_LEN {
            debug!(
                "Dropping oversized record from {} ({} bytes or more)",
                source,
                payload.len()
            );
            return Disposition::Malformed;
        }

        let record = match InboundRecord::parse_bytes(payload) {
            Ok(record) => record,
            Err(e) => {
                debug!("Dropping malformed record from {}: {}", source, e);
                return Disposition::Malformed;
            }
        };

        if let Some(limiter) = self.limiter.as_mut() {
            if !limiter.should_accept(source.ip(), now) {
                return Disposition::RateLimited;
            }
        }

        let event = IngestEvent {
            record,
            source,
            received_at: now,
        };
        match self.queue.try_send(event) {
            Ok(()) => Disposition::Queued,
            Err(TrySendError::Full(_)) => {
                debug!("Ingest queue full, dropping record from {}", source);
                Disposition::QueueFull
            }
            Err(TrySendError::Closed(_)) => Disposition::Closed,
        }
    }

    fn maybe_prune(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_prune) < PRUNE_EVERY {
            return;
        }
        self.last_prune = now;

        if let Some(limiter) = self.limiter.as_mut() {
            let pruned = limiter.prune(now, PRUNE_OLDER_THAN);
            if pruned > 0 {
                debug!("Pruned {} idle rate limiter entries", pruned);
            }
        }
    }

    /// Receives datagrams until shutdown or until the update loop goes away
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        // One spare byte so a datagram cut off by the buffer is detectable
        let mut buffer = [0u8; RECV_BUFFER_LEN + 1];

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,

                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, source)) => {
                        let now = Instant::now();
                        if self.process_datagram(&buffer[..len], source, now) == Disposition::Closed {
                            info!("Ingest queue closed, stopping receive loop");
                            break;
                        }
                        self.maybe_prune(now);
                    }
                    Err(e) => {
                        warn!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        info!("Ingest loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::PlayerUpdate;

    fn source(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn ingest(
        rate_limit: Option<Duration>,
        capacity: usize,
    ) -> (Ingest, mpsc::Receiver<IngestEvent>, Arc<IngestStats>) {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (tx, rx) = mpsc::channel(capacity);
        let stats = Arc::new(IngestStats::default());
        (Ingest::new(socket, rate_limit, tx, Arc::clone(&stats)), rx, stats)
    }

    #[tokio::test]
    async fn test_valid_record_is_queued() {
        let (mut ingest, mut rx, stats) = ingest(None, 8).await;
        let now = Instant::now();

        let disposition = ingest.process_datagram(b"0,10,20", source(4000), now);

        assert_eq!(disposition, Disposition::Queued);
        let event = rx.try_recv().unwrap();
        assert_eq!(
            event.record,
            InboundRecord::Update(PlayerUpdate::position(0, 10.0, 20.0))
        );
        assert_eq!(event.source, source(4000));
        assert_eq!(stats.snapshot().queued, 1);
    }

    #[tokio::test]
    async fn test_malformed_record_dropped_without_consuming_rate_slot() {
        let (mut ingest, mut rx, stats) = ingest(Some(Duration::from_millis(50)), 8).await;
        let now = Instant::now();

        assert_eq!(
            ingest.process_datagram(b"garbage", source(4000), now),
            Disposition::Malformed
        );
        assert_eq!(
            ingest.process_datagram(b"0,1,2", source(4000), now),
            Disposition::Queued
        );

        assert!(rx.try_recv().is_ok());
        let counters = stats.snapshot();
        assert_eq!(counters.malformed, 1);
        assert_eq!(counters.received, 2);
    }

    #[tokio::test]
    async fn test_oversized_record_is_malformed() {
        let (mut ingest, mut rx, stats) = ingest(None, 8).await;
        let now = Instant::now();

        let mut fits = b"0,1,2,100,Ada,".to_vec();
        fits.resize(RECV_BUFFER_LEN, b'x');
        assert_eq!(
            ingest.process_datagram(&fits, source(4000), now),
            Disposition::Queued
        );

        let mut cut_off = fits.clone();
        cut_off.push(b'x');
        assert_eq!(
            ingest.process_datagram(&cut_off, source(4000), now),
            Disposition::Malformed
        );

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.snapshot().malformed, 1);
    }

    #[tokio::test]
    async fn test_oversized_datagram_on_the_wire_is_malformed() {
        let (ingest, _rx, stats) = ingest(None, 8).await;
        let addr = ingest.socket.local_addr().unwrap();
        let (_shutdown_tx, shutdown) = watch::channel(false);
        tokio::spawn(ingest.run(shutdown));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut payload = b"0,1,2,100,Ada,".to_vec();
        payload.resize(RECV_BUFFER_LEN + 100, b'x');
        sender.send_to(&payload, addr).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while stats.snapshot().malformed == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.snapshot().malformed, 1);
        assert_eq!(stats.snapshot().queued, 0);
    }

    #[tokio::test]
    async fn test_records_fifty_ms_apart_with_fifty_ms_limit() {
        let (mut ingest, mut rx, stats) = ingest(Some(Duration::from_millis(50)), 8).await;
        let t0 = Instant::now();

        assert_eq!(
            ingest.process_datagram(b"0,1,1", source(4000), t0),
            Disposition::Queued
        );
        assert_eq!(
            ingest.process_datagram(b"0,2,2", source(4000), t0 + Duration::from_millis(50)),
            Disposition::RateLimited
        );

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(stats.snapshot().rate_limited, 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let (mut ingest, mut rx, stats) = ingest(None, 1).await;
        let now = Instant::now();

        assert_eq!(
            ingest.process_datagram(b"0,1,1", source(4000), now),
            Disposition::Queued
        );
        assert_eq!(
            ingest.process_datagram(b"0,2,2", source(4000), now),
            Disposition::QueueFull
        );

        // The oldest record survives
        let kept = rx.try_recv().unwrap();
        assert_eq!(
            kept.record,
            InboundRecord::Update(PlayerUpdate::position(0, 1.0, 1.0))
        );
        assert_eq!(stats.snapshot().queue_full, 1);
    }

    #[tokio::test]
    async fn test_closed_queue() {
        let (mut ingest, rx, _stats) = ingest(None, 1).await;
        drop(rx);

        assert_eq!(
            ingest.process_datagram(b"0,1,1", source(4000), Instant::now()),
            Disposition::Closed
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (ingest, _rx, _stats) = ingest(None, 1).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(ingest.run(shutdown_rx));
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("ingest loop did not stop")
            .unwrap();
    }
}
