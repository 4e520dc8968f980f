//! Wall-Clock Abstraction
//!
//! Idempotency TTLs and circuit breaker cooldowns are compared across
//! invocations (and processes), so they are expressed as Unix-millisecond
//! timestamps read through this trait. Tests drive a `ManualClock` instead
//! of sleeping.
//!
//! Invocation deadlines are a separate concern: they are monotonic and live
//! in `coordinator::Deadline`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timestamp in Unix milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_sub(&self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl std::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

/// Clock trait for wall-clock reads
///
/// Implementations:
/// - `SystemClock`: real system time
/// - `ManualClock`: time only moves when a test moves it
pub trait Clock: Send + Sync + 'static {
    /// Get current time
    fn now(&self) -> Timestamp;

    /// Get elapsed time since a previous timestamp
    fn elapsed(&self, since: Timestamp) -> Duration {
        self.now().saturating_sub(since)
    }

    /// Check if a duration has elapsed since a timestamp
    fn has_elapsed(&self, since: Timestamp, duration: Duration) -> bool {
        self.elapsed(since) >= duration
    }
}

/// Clock backed by the system time
#[derive(Debug, Clone)]
pub struct SystemClock {
    /// Monotonic anchor so that readings never run backwards within a process
    start: Instant,
    /// Unix milliseconds at `start`
    start_millis: u64,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        // A clock set before 1970 reads as the epoch rather than aborting.
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        SystemClock {
            start: Instant::now(),
            start_millis,
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let elapsed = self.start.elapsed().as_millis() as u64;
        Timestamp(self.start_millis + elapsed)
    }
}

/// Manually driven clock for tests and simulation
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    time_ms: Arc<AtomicU64>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ManualClock {
    /// Create a new clock starting at the given time
    pub fn new(start_ms: u64) -> Self {
        ManualClock {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Advance time by the given duration
    pub fn advance(&self, duration: Duration) {
        self.time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    /// Advance time by milliseconds
    pub fn advance_ms(&self, ms: u64) {
        self.time_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Set time to a specific value
    pub fn set(&self, time_ms: u64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.time_ms.load(Ordering::SeqCst))
    }
}
