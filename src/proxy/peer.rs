// src/proxy/peer.rs
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::stats::StatsRecorder;

/// Consecutive transport failures before a peer is taken out of rotation.
pub const DEFAULT_MAX_FAILS: u32 = 5;

/// How long a peer stays down after its last failure.
pub const DEFAULT_FAIL_TIMEOUT: Duration = Duration::from_secs(10);

/// Passive health-check thresholds shared by every peer of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub max_fails: u32,
    pub fail_timeout: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            max_fails: DEFAULT_MAX_FAILS,
            fail_timeout: DEFAULT_FAIL_TIMEOUT,
        }
    }
}

/// Returns whether a peer with the given failure history may take traffic at `now`.
pub fn is_available(
    fails: u32,
    max_fails: u32,
    last_failure_at: Option<Instant>,
    fail_timeout: Duration,
    now: Instant,
) -> bool {
    if fails < max_fails {
        return true;
    }
    match last_failure_at {
        Some(at) => now.saturating_duration_since(at) >= fail_timeout,
        None => true,
    }
}

#[derive(Debug, Default)]
struct Health {
    fails: u32,
    last_failure_at: Option<Instant>,
}

#[derive(Debug)]
pub struct Peer {
    pub address: String,
    pub weight: u32,
    max_fails: u32,
    fail_timeout_ms: AtomicU64,

    // Runtime state
    health: Mutex<Health>,
    current_weight: AtomicI64,
    stats: StatsRecorder,
}

impl Peer {
    pub fn new(address: impl Into<String>, weight: u32, policy: HealthPolicy) -> Self {
        Self {
            address: address.into(),
            weight: weight.max(1),
            max_fails: policy.max_fails,
            fail_timeout_ms: AtomicU64::new(duration_millis(policy.fail_timeout)),
            health: Mutex::new(Health::default()),
            current_weight: AtomicI64::new(0),
            stats: StatsRecorder::new(),
        }
    }

    pub fn max_fails(&self) -> u32 {
        self.max_fails
    }

    pub fn fail_timeout(&self) -> Duration {
        Duration::from_millis(self.fail_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_fail_timeout(&self, fail_timeout: Duration) {
        self.fail_timeout_ms
            .store(duration_millis(fail_timeout), Ordering::Relaxed);
    }

    pub fn fails(&self) -> u32 {
        self.health().fails
    }

    pub fn stats(&self) -> &StatsRecorder {
        &self.stats
    }

    /// A completed round trip, whatever status the backend answered with.
    pub fn record_success(
        &self,
        status_code: u16,
        method: &str,
        path: &str,
        recv_bytes: u64,
        send_bytes: u64,
    ) {
        self.stats
            .record(status_code, method, path, recv_bytes, send_bytes);
        self.health().fails = 0;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut health = self.health();
        health.fails = health.fails.saturating_add(1);
        health.last_failure_at = Some(now);
    }

    pub fn is_available(&self) -> bool {
        self.is_available_at(Instant::now())
    }

    /// Evaluates the passive health state at `now`. A peer whose fail
    /// timeout has elapsed gets its failure count cleared here.
    pub fn is_available_at(&self, now: Instant) -> bool {
        let mut health = self.health();
        let available = is_available(
            health.fails,
            self.max_fails,
            health.last_failure_at,
            self.fail_timeout(),
            now,
        );
        if available && health.fails >= self.max_fails {
            health.fails = 0;
        }
        available
    }

    pub(crate) fn current_weight(&self) -> i64 {
        self.current_weight.load(Ordering::Relaxed)
    }

    pub(crate) fn add_current_weight(&self, delta: i64) {
        self.current_weight.fetch_add(delta, Ordering::Relaxed);
    }

    fn health(&self) -> MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
