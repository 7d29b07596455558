//! Fixed-interval update loop
//!
//! The only writer of per-session game state. Each tick it:
//! 1. drains whatever the ingest queue holds right now
//! 2. applies each record in arrival order, so the last one per id wins
//! 3. evicts sessions that have gone quiet for too long
//! 4. snapshots the registry and hands it to the broadcaster

use crate::broadcast::{BroadcastReport, Broadcaster};
use crate::ingest::{IngestEvent, IngestStats};
use crate::network::wait_for_shutdown;
use crate::registry::{RegistryError, SessionRegistry};
use log::{debug, info, warn};
use shared::{ClientId, InboundRecord};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

/// Outcome of a single tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub drained: usize,
    pub applied: usize,
    pub unknown_session: usize,
    pub disconnected: Vec<ClientId>,
    pub evicted: Vec<ClientId>,
    pub broadcast: BroadcastReport,
}

pub struct UpdateLoop {
    registry: Arc<SessionRegistry>,
    queue: mpsc::Receiver<IngestEvent>,
    max_drain: usize,
    broadcaster: Broadcaster,
    tick_interval: Duration,
    session_timeout: Option<Duration>,
    stats: Arc<IngestStats>,
    tick: u64,
}

impl UpdateLoop {
    /// `max_drain` bounds how many records one tick consumes; pass the queue
    /// capacity so a tick never chases producers indefinitely.
    pub fn new(
        registry: Arc<SessionRegistry>,
        queue: mpsc::Receiver<IngestEvent>,
        max_drain: usize,
        broadcaster: Broadcaster,
        tick_interval: Duration,
        session_timeout: Option<Duration>,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            registry,
            queue,
            max_drain,
            broadcaster,
            tick_interval,
            session_timeout,
            stats,
            tick: 0,
        }
    }

    /// Takes up to `max_drain` queued records without waiting
    pub fn drain(&mut self) -> Vec<IngestEvent> {
        let mut events = Vec::new();
        while events.len() < self.max_drain {
            match self.queue.try_recv() {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }
        events
    }

    /// Runs one full cycle: drain, apply, evict, broadcast
    pub async fn tick(&mut self, now: Instant) -> TickReport {
        self.tick += 1;
        let mut report = TickReport {
            tick: self.tick,
            ..TickReport::default()
        };

        let events = self.drain();
        report.drained = events.len();

        for event in events {
            match event.record {
                InboundRecord::Update(update) => {
                    match self
                        .registry
                        .apply_update(&update, event.source, event.received_at)
                        .await
                    {
                        Ok(()) => report.applied += 1,
                        Err(RegistryError::UnknownSession(id)) => {
                            debug!("Dropping update for unknown session {} from {}", id, event.source);
                            self.stats.record_unknown_session();
                            report.unknown_session += 1;
                        }
                        Err(e) => warn!("Update for client {} failed: {}", update.id, e),
                    }
                }
                InboundRecord::Disconnect(id) => {
                    if self.registry.remove(id).await.is_some() {
                        report.disconnected.push(id);
                    } else {
                        debug!("Disconnect for unknown session {} from {}", id, event.source);
                        self.stats.record_unknown_session();
                        report.unknown_session += 1;
                    }
                }
            }
        }

        if let Some(timeout) = self.session_timeout {
            report.evicted = self.registry.evict_stale(now, timeout).await;
        }

        let snapshot = self.registry.snapshot_all().await;
        report.broadcast = self.broadcaster.broadcast(&snapshot).await;

        if self.tick % 60 == 0 && !snapshot.is_empty() {
            debug!(
                "Tick {}: {} sessions, ingest {:?}",
                self.tick,
                snapshot.len(),
                self.stats.snapshot()
            );
        }

        report
    }

    /// Ticks at the configured interval until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick_timer = interval(self.tick_interval);
        tick_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Skip the first tick since it fires immediately
        tick_timer.tick().await;

        info!("Update loop running every {:?}", self.tick_interval);

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = tick_timer.tick() => {
                    self.tick(Instant::now()).await;
                }
            }
        }

        info!("Update loop stopped after {} ticks", self.tick);
    }
}
