//! Per-client sliding-window rate limiting.
//!
//! Each client keeps the timestamps of its admitted requests inside the
//! trailing window. Clients are hashed onto a fixed set of shards, each behind
//! its own mutex, so checks for one client are serialized while unrelated
//! clients rarely contend.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Shards are swept of idle clients once they grow past this many entries.
const MIN_SWEEP_THRESHOLD: usize = 64;

pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Clone, Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

#[derive(Debug, Default)]
struct Shard {
    windows: HashMap<String, VecDeque<Instant>>,
    sweep_threshold: usize,
}

impl Shard {
    /// Drops clients with nothing left inside the window. Runs only when the
    /// shard has doubled since the last sweep, so the cost amortizes.
    fn sweep_idle(&mut self, now: Instant, window: Duration) {
        if self.windows.len() < self.sweep_threshold.max(MIN_SWEEP_THRESHOLD) {
            return;
        }
        self.windows.retain(|_, stamps| {
            stamps
                .back()
                .is_some_and(|last| now.saturating_duration_since(*last) <= window)
        });
        self.sweep_threshold = self.windows.len() * 2;
    }
}

pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    shards: Box<[Mutex<Shard>]>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl RateLimiter {
    pub fn new(
        max_requests: usize,
        window: Duration,
        shards: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(Shard::default()))
            .collect();
        Self {
            max_requests,
            window,
            shards,
            clock,
        }
    }

    pub fn check(&self, client: &str) -> RateDecision {
        self.check_at(client, self.clock.now())
    }

    /// Admits the request and records `now` if the client has fewer than
    /// `max_requests` timestamps left in the window. A rejected attempt is not
    /// recorded.
    pub fn check_at(&self, client: &str, now: Instant) -> RateDecision {
        let mut shard = self
            .shard_for(client)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        shard.sweep_idle(now, self.window);

        let stamps = shard.windows.entry(client.to_owned()).or_default();
        while let Some(oldest) = stamps.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() >= self.max_requests {
            let retry_after = stamps
                .front()
                .map(|oldest| {
                    self.window
                        .saturating_sub(now.saturating_duration_since(*oldest))
                })
                .unwrap_or(self.window);
            return RateDecision::Limited { retry_after };
        }

        stamps.push_back(now);
        RateDecision::Allowed
    }

    /// Number of clients currently tracked across all shards.
    pub fn tracked_clients(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .windows
                    .len()
            })
            .sum()
    }

    fn shard_for(&self, client: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        client.hash(&mut hasher);
        let idx = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }
}
