//! Simulated Delivery Sink
//!
//! In-process stand-in for the downstream HTTP sink. It drains the payload
//! the way a server would, recomputes the digest over what it received and
//! rejects the body on mismatch. Responses come from a script first, then
//! from seeded probabilities; an outage switch refuses every transfer.

use super::rng::DeterministicRng;
use crate::delivery::{ArchivePayload, DeliveryError, DeliveryReceipt, DeliverySink};
use crate::integrity::{ContentDigest, HashingReader};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;

/// Fault probabilities for the simulated sink
#[derive(Debug, Clone)]
pub struct SimulatedSinkConfig {
    /// Sink answers 503
    pub failure_prob: f64,
    /// One byte of the received body is flipped in transit
    pub corrupt_prob: f64,
}

impl Default for SimulatedSinkConfig {
    fn default() -> Self {
        SimulatedSinkConfig {
            failure_prob: 0.05,
            corrupt_prob: 0.02,
        }
    }
}

impl SimulatedSinkConfig {
    pub fn no_faults() -> Self {
        SimulatedSinkConfig {
            failure_prob: 0.0,
            corrupt_prob: 0.0,
        }
    }

    pub fn high_chaos() -> Self {
        SimulatedSinkConfig {
            failure_prob: 0.2,
            corrupt_prob: 0.05,
        }
    }
}

/// Scripted answer for the next transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkResponse {
    Accept,
    /// Respond with this non-2xx status
    Reject(u16),
    /// Flip a byte of the received body
    Corrupt,
    /// Refuse the connection
    Refuse,
}

/// One transfer as seen by the sink
#[derive(Debug, Clone)]
pub struct RecordedDelivery {
    pub archive_id: String,
    /// Digest from the request header
    pub advertised: ContentDigest,
    /// Digest of the bytes the sink received
    pub received: Option<ContentDigest>,
    pub body: Bytes,
    pub accepted: bool,
}

#[derive(Default)]
struct SinkState {
    script: VecDeque<SinkResponse>,
    deliveries: Vec<RecordedDelivery>,
    attempts: u64,
}

/// Fault-injecting in-process sink; clones share state
#[derive(Clone)]
pub struct SimulatedSink {
    seed: u64,
    config: Arc<Mutex<SimulatedSinkConfig>>,
    outage: Arc<AtomicBool>,
    state: Arc<Mutex<SinkState>>,
}

impl SimulatedSink {
    pub fn new(seed: u64, config: SimulatedSinkConfig) -> Self {
        SimulatedSink {
            seed,
            config: Arc::new(Mutex::new(config)),
            outage: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(SinkState::default())),
        }
    }

    /// Sink that accepts everything unless scripted otherwise
    pub fn healthy() -> Self {
        Self::new(0, SimulatedSinkConfig::no_faults())
    }

    pub fn set_config(&self, config: SimulatedSinkConfig) {
        *self.config.lock() = config;
    }

    /// While set, every transfer is refused
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.outage.load(Ordering::SeqCst)
    }

    /// Queue answers for the next transfers, ahead of the probabilities
    pub fn script(&self, responses: impl IntoIterator<Item = SinkResponse>) {
        self.state.lock().script.extend(responses);
    }

    /// Number of `deliver` calls, refused ones included
    pub fn attempts(&self) -> u64 {
        self.state.lock().attempts
    }

    pub fn deliveries(&self) -> Vec<RecordedDelivery> {
        self.state.lock().deliveries.clone()
    }

    pub fn accepted(&self) -> Vec<RecordedDelivery> {
        self.state
            .lock()
            .deliveries
            .iter()
            .filter(|d| d.accepted)
            .cloned()
            .collect()
    }

    fn next_response(&self, archive_id: &str) -> SinkResponse {
        if let Some(scripted) = self.state.lock().script.pop_front() {
            return scripted;
        }
        if self.is_down() {
            return SinkResponse::Refuse;
        }
        let config = self.config.lock().clone();
        let mut rng = DeterministicRng::for_label(self.seed, archive_id);
        if rng.gen_bool(config.failure_prob) {
            SinkResponse::Reject(503)
        } else if rng.gen_bool(config.corrupt_prob) {
            SinkResponse::Corrupt
        } else {
            SinkResponse::Accept
        }
    }

    async fn receive(&self, payload: ArchivePayload) -> Result<DeliveryReceipt, DeliveryError> {
        let started = Instant::now();
        self.state.lock().attempts += 1;

        let response = self.next_response(&payload.archive_id);
        if response == SinkResponse::Refuse {
            return Err(DeliveryError::Transport("connection refused (simulated)".into()));
        }

        let (mut reader, handle) = HashingReader::new(payload.body);
        let mut body = Vec::with_capacity(payload.content_length as usize);
        reader.read_to_end(&mut body).await?;

        let mut received = handle.finalize();
        if response == SinkResponse::Corrupt && !body.is_empty() {
            let at = body.len() / 2;
            body[at] ^= 0xff;
            received = Some(ContentDigest::of(&body));
        }

        let digest_ok = received
            .as_ref()
            .is_some_and(|d| d.matches_hex(payload.digest.hex()));
        let length_ok = body.len() as u64 == payload.content_length;
        let status = match response {
            SinkResponse::Reject(status) => status,
            _ if !digest_ok || !length_ok => 422,
            _ => 200,
        };
        let accepted = status == 200;

        self.state.lock().deliveries.push(RecordedDelivery {
            archive_id: payload.archive_id,
            advertised: payload.digest,
            received,
            body: Bytes::from(body),
            accepted,
        });

        if !accepted {
            return Err(DeliveryError::Status {
                status,
                body: "rejected by simulated sink".into(),
            });
        }
        Ok(DeliveryReceipt {
            status,
            bytes_sent: payload.content_length,
            elapsed: started.elapsed(),
        })
    }
}

impl DeliverySink for SimulatedSink {
    fn deliver<'a>(
        &'a self,
        payload: ArchivePayload,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryReceipt, DeliveryError>> + Send + 'a>> {
        Box::pin(self.receive(payload))
    }
}
