//! Simulated Object Source with Fault Injection
//!
//! Wraps an `InMemoryObjectSource` and injects the faults the archiver has
//! to absorb: missing objects, opens that stall past the fetch timeout,
//! streams that break halfway, and latency. Each decision is drawn from an
//! RNG derived from (seed, key, version, attempt), so a seed replays the
//! same faults no matter how the fetch workers interleave.

use super::rng::DeterministicRng;
use crate::source::{InMemoryObjectSource, ObjectReader, ObjectSource, SourceError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::io::{self, Cursor, ErrorKind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};

/// Fault probabilities for the simulated source
#[derive(Debug, Clone)]
pub struct SimulatedSourceConfig {
    /// Open reports the object as missing
    pub not_found_prob: f64,
    /// Open hangs for `stall_duration` before answering
    pub stall_prob: f64,
    pub stall_duration: Duration,
    /// Stream fails after part of the object was read
    pub mid_read_fail_prob: f64,
    /// Simulated open latency range in microseconds (min, max)
    pub latency_range_us: (u64, u64),
}

impl Default for SimulatedSourceConfig {
    fn default() -> Self {
        SimulatedSourceConfig {
            not_found_prob: 0.02,
            stall_prob: 0.01,
            stall_duration: Duration::from_millis(200),
            mid_read_fail_prob: 0.02,
            latency_range_us: (0, 2_000),
        }
    }
}

impl SimulatedSourceConfig {
    pub fn no_faults() -> Self {
        SimulatedSourceConfig {
            not_found_prob: 0.0,
            stall_prob: 0.0,
            stall_duration: Duration::ZERO,
            mid_read_fail_prob: 0.0,
            latency_range_us: (0, 0),
        }
    }

    pub fn high_chaos() -> Self {
        SimulatedSourceConfig {
            not_found_prob: 0.08,
            stall_prob: 0.05,
            stall_duration: Duration::from_millis(200),
            mid_read_fail_prob: 0.08,
            latency_range_us: (100, 5_000),
        }
    }
}

/// Fault counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedSourceStats {
    pub opens: u64,
    pub not_found: u64,
    pub stalls: u64,
    pub mid_read_failures: u64,
}

struct SourceState {
    stats: SimulatedSourceStats,
    attempts: HashMap<(String, String), u32>,
}

/// Fault-injecting wrapper around `InMemoryObjectSource`
#[derive(Clone)]
pub struct SimulatedObjectSource {
    inner: InMemoryObjectSource,
    config: Arc<Mutex<SimulatedSourceConfig>>,
    seed: u64,
    state: Arc<Mutex<SourceState>>,
}

impl SimulatedObjectSource {
    pub fn new(inner: InMemoryObjectSource, seed: u64, config: SimulatedSourceConfig) -> Self {
        SimulatedObjectSource {
            inner,
            config: Arc::new(Mutex::new(config)),
            seed,
            state: Arc::new(Mutex::new(SourceState {
                stats: SimulatedSourceStats::default(),
                attempts: HashMap::new(),
            })),
        }
    }

    pub fn inner(&self) -> &InMemoryObjectSource {
        &self.inner
    }

    pub fn stats(&self) -> SimulatedSourceStats {
        self.state.lock().stats.clone()
    }

    /// Change fault probabilities for subsequent opens; clones share the change
    pub fn set_config(&self, config: SimulatedSourceConfig) {
        *self.config.lock() = config;
    }

    fn rng_for(&self, object_key: &str, version_token: &str) -> DeterministicRng {
        let mut state = self.state.lock();
        state.stats.opens += 1;
        let attempt = state
            .attempts
            .entry((object_key.to_string(), version_token.to_string()))
            .or_insert(0);
        *attempt += 1;
        DeterministicRng::for_label(self.seed, &format!("{}#{}#{}", object_key, version_token, attempt))
    }
}

impl ObjectSource for SimulatedObjectSource {
    fn open_stream<'a>(
        &'a self,
        object_key: &'a str,
        version_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectReader, SourceError>> + Send + 'a>> {
        Box::pin(async move {
            let mut rng = self.rng_for(object_key, version_token);
            let config = self.config.lock().clone();

            let (min, max) = config.latency_range_us;
            let latency_us = rng.gen_range(min, max);
            if latency_us > 0 {
                tokio::time::sleep(Duration::from_micros(latency_us)).await;
            }

            if rng.gen_bool(config.stall_prob) {
                self.state.lock().stats.stalls += 1;
                tokio::time::sleep(config.stall_duration).await;
            }

            if rng.gen_bool(config.not_found_prob) {
                self.state.lock().stats.not_found += 1;
                return Err(SourceError::NotFound(format!(
                    "{}@{} (simulated)",
                    object_key, version_token
                )));
            }

            let data = self
                .inner
                .get(object_key, version_token)
                .ok_or_else(|| SourceError::NotFound(format!("{}@{}", object_key, version_token)))?;

            if rng.gen_bool(config.mid_read_fail_prob) && data.len() > 1 {
                self.state.lock().stats.mid_read_failures += 1;
                let fail_at = rng.gen_range(1, data.len() as u64) as usize;
                return Ok(Box::new(FailingReader::new(data, fail_at)) as ObjectReader);
            }

            Ok(Box::new(Cursor::new(data)) as ObjectReader)
        })
    }
}

/// Serves `fail_at` bytes, then errors
struct FailingReader {
    data: Bytes,
    pos: usize,
    fail_at: usize,
}

impl FailingReader {
    fn new(data: Bytes, fail_at: usize) -> Self {
        FailingReader {
            data,
            pos: 0,
            fail_at,
        }
    }
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos >= self.fail_at {
            return Poll::Ready(Err(io::Error::new(
                ErrorKind::ConnectionReset,
                "simulated connection reset",
            )));
        }
        let end = self.fail_at.min(self.pos + buf.remaining());
        buf.put_slice(&self.data[self.pos..end]);
        self.pos = end;
        Poll::Ready(Ok(()))
    }
}
