//! Per-source admission filter for the unreliable ingest path
//!
//! A datagram from an address is accepted only if strictly more than the
//! minimum interval has passed since the last datagram accepted from that
//! same address. Rejections leave the stored timestamp untouched, so a
//! client flooding faster than the interval still gets through at roughly
//! the permitted rate rather than being locked out.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    min_interval: Duration,
    last_accepted: HashMap<IpAddr, Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_accepted: HashMap::new(),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Decides whether a datagram from `addr` arriving at `now` is admitted
    pub fn should_accept(&mut self, addr: IpAddr, now: Instant) -> bool {
        let accept = match self.last_accepted.get(&addr) {
            Some(last) => now.saturating_duration_since(*last) > self.min_interval,
            None => true,
        };

        if accept {
            self.last_accepted.insert(addr, now);
        }
        accept
    }

    /// Forgets addresses that have not been accepted for longer than `max_age`
    pub fn prune(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.last_accepted.len();
        self.last_accepted
            .retain(|_, last| now.saturating_duration_since(*last) <= max_age);
        before - self.last_accepted.len()
    }

    /// Number of addresses currently tracked
    pub fn len(&self) -> usize {
        self.last_accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_accepted.is_empty()
    }
}
