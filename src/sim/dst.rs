//! Deterministic Simulation Testing for the Batch Engine
//!
//! Drives the coordinator the way the transport would: notifications are
//! published with at-least-once duplicates, received in batches by two
//! concurrent invocations, acked or redelivered according to the returned
//! `BatchOutcome`, and dead-lettered after too many receives. Objects are
//! deleted under the engine's feet and the sink goes through outages.
//!
//! ```text
//! for seed in 0..N {
//!     let mut harness = BatchDSTHarness::new(BatchDSTConfig::chaos(seed));
//!     harness.run().await;             // fault rounds, then a calm drain
//!     harness.check_invariants();      // violations carry the seed
//! }
//! ```
//!
//! Invariants checked:
//! - no (object_key, version_token) pair appears in two accepted deliveries
//! - every accepted body hashes to its advertised digest, which is also the
//!   digest stored with the staged artifact
//! - object entries (the manifest trailer aside) = accepted items - fetch
//!   failures, and each entry's content matches the uploaded object
//! - peak handle queue depth never exceeds the worker count
//! - after the drain nothing is pending, no claim is IN_PROGRESS, and every
//!   upload was delivered or dead-lettered

use super::rng::DeterministicRng;
use super::sink::{SimulatedSink, SimulatedSinkConfig};
use super::source::{SimulatedObjectSource, SimulatedSourceConfig, SimulatedSourceStats};
use crate::archiver::MANIFEST_ENTRY_NAME;
use crate::breaker::InMemoryBreakerStore;
use crate::clock::ManualClock;
use crate::config::RelayConfig;
use crate::coordinator::{BatchCoordinator, BatchReport, Collaborators, DeliveryStatus};
use crate::delivery::artifact::META_SHA256;
use crate::delivery::InMemoryArtifactStore;
use crate::error::BatchError;
use crate::idempotency::InMemoryIdempotencyStore;
use crate::integrity::ContentDigest;
use crate::model::{ArchiveManifestEntry, IngestNotification, RecordStatus};
use crate::source::InMemoryObjectSource;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

type Pair = (String, String);

/// Configuration for batch DST
#[derive(Debug, Clone)]
pub struct BatchDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    pub source_config: SimulatedSourceConfig,
    pub sink_config: SimulatedSinkConfig,
    pub relay: RelayConfig,
    /// Rounds with publishing and faults
    pub rounds: usize,
    /// Upper bound on calm rounds spent draining the queue
    pub drain_rounds: usize,
    /// Distinct object keys; re-uploads create new versions
    pub key_space: u64,
    /// Uploads per round (min, max)
    pub uploads_per_round: (u64, u64),
    pub max_object_bytes: u64,
    /// Notifications per received batch
    pub batch_size: usize,
    /// Chance an upload is notified twice, and of a stale re-notification per round
    pub duplicate_prob: f64,
    /// Chance per round that a published object is deleted
    pub delete_prob: f64,
    /// Chance per round that the sink goes down or comes back
    pub outage_toggle_prob: f64,
    /// Chance an invocation starts with less time than the intake cutoff
    pub short_budget_prob: f64,
    pub invocation_budget: Duration,
    /// Simulated time between rounds
    pub round_interval: Duration,
    /// Receives before a message is dead-lettered
    pub max_receives: u32,
}

impl Default for BatchDSTConfig {
    fn default() -> Self {
        let mut relay = RelayConfig::test();
        relay.archiver.spill_threshold_bytes = 32 * 1024;
        relay.archiver.min_fetch_timeout = Duration::from_millis(10);
        relay.archiver.max_fetch_timeout = Duration::from_millis(50);
        relay.breaker.failure_threshold = 3;
        relay.breaker.cooldown = Duration::from_secs(3);
        relay.idempotency.completed_ttl = Duration::from_secs(24 * 3600);

        BatchDSTConfig {
            seed: 0,
            source_config: SimulatedSourceConfig::default(),
            sink_config: SimulatedSinkConfig::default(),
            relay,
            rounds: 30,
            drain_rounds: 60,
            key_space: 40,
            uploads_per_round: (2, 8),
            max_object_bytes: 8 * 1024,
            batch_size: 10,
            duplicate_prob: 0.2,
            delete_prob: 0.05,
            outage_toggle_prob: 0.05,
            short_budget_prob: 0.05,
            invocation_budget: Duration::from_secs(2),
            round_interval: Duration::from_secs(1),
            max_receives: 12,
        }
    }
}

impl BatchDSTConfig {
    pub fn new(seed: u64) -> Self {
        BatchDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// Calm mode - duplicates only, no faults
    pub fn calm(seed: u64) -> Self {
        BatchDSTConfig {
            seed,
            source_config: SimulatedSourceConfig::no_faults(),
            sink_config: SimulatedSinkConfig::no_faults(),
            delete_prob: 0.0,
            outage_toggle_prob: 0.0,
            short_budget_prob: 0.0,
            ..Default::default()
        }
    }

    /// Moderate fault injection
    pub fn moderate(seed: u64) -> Self {
        Self::new(seed)
    }

    /// Chaos mode - aggressive fault injection
    pub fn chaos(seed: u64) -> Self {
        BatchDSTConfig {
            seed,
            source_config: SimulatedSourceConfig::high_chaos(),
            sink_config: SimulatedSinkConfig::high_chaos(),
            duplicate_prob: 0.3,
            delete_prob: 0.1,
            outage_toggle_prob: 0.15,
            short_budget_prob: 0.1,
            max_receives: 20,
            ..Default::default()
        }
    }
}

/// One uploaded object version
#[derive(Debug, Clone)]
pub struct Upload {
    pub object_key: String,
    pub version_token: String,
    pub data: Bytes,
}

/// Workload generator
pub struct BatchWorkload {
    rng: DeterministicRng,
    config: BatchDSTConfig,
    next_item: u64,
    versions: HashMap<u64, u32>,
}

impl BatchWorkload {
    pub fn new(config: BatchDSTConfig) -> Self {
        BatchWorkload {
            rng: DeterministicRng::new(config.seed),
            config,
            next_item: 0,
            versions: HashMap::new(),
        }
    }

    pub fn next_item_id(&mut self) -> String {
        self.next_item += 1;
        format!("m-{:06}", self.next_item)
    }

    /// How many uploads the coming round publishes
    pub fn uploads_this_round(&mut self) -> u64 {
        let (min, max) = self.config.uploads_per_round;
        self.rng.gen_range(min, max + 1)
    }

    /// A new version of a random key
    pub fn next_upload(&mut self) -> Upload {
        let key_index = self.rng.gen_range(0, self.config.key_space);
        let version = self.versions.entry(key_index).or_insert(0);
        *version += 1;
        let version_token = format!("v{}", version);

        let size = self.rng.gen_range(0, self.config.max_object_bytes + 1) as usize;
        let fill = self.rng.next_u64().to_le_bytes();
        let data: Vec<u8> = (0..size).map(|i| fill[i % 8] ^ (i / 64) as u8).collect();

        Upload {
            object_key: format!("uploads/shard-{}/object-{:04}.json", key_index % 4, key_index),
            version_token,
            data: Bytes::from(data),
        }
    }

    pub fn roll(&mut self, probability: f64) -> bool {
        self.rng.gen_bool(probability)
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        self.rng.pick(items)
    }
}

/// A notification as held by the transport
#[derive(Debug, Clone)]
struct Message {
    notification: IngestNotification,
    receives: u32,
}

/// Result of a DST run
#[derive(Debug, Clone)]
pub struct BatchDSTResult {
    /// Seed used
    pub seed: u64,
    pub invocations: u64,
    pub notifications_published: u64,
    pub duplicates_skipped: u64,
    pub items_failed: u64,
    pub archives_delivered: u64,
    pub entries_delivered: u64,
    pub circuit_open_skips: u64,
    pub delivery_failures: u64,
    pub guard_trips: u64,
    pub dead_lettered: u64,
    pub source_stats: SimulatedSourceStats,
    /// Invariant violations found
    pub invariant_violations: Vec<String>,
}

impl BatchDSTResult {
    pub fn new(seed: u64) -> Self {
        BatchDSTResult {
            seed,
            invocations: 0,
            notifications_published: 0,
            duplicates_skipped: 0,
            items_failed: 0,
            archives_delivered: 0,
            entries_delivered: 0,
            circuit_open_skips: 0,
            delivery_failures: 0,
            guard_trips: 0,
            dead_lettered: 0,
            source_stats: SimulatedSourceStats::default(),
            invariant_violations: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} invocations, {} published, {} duplicates, {} archives ({} entries), {} open skips, {} delivery failures, {} dead-lettered, {} violations",
            self.seed,
            self.invocations,
            self.notifications_published,
            self.duplicates_skipped,
            self.archives_delivered,
            self.entries_delivered,
            self.circuit_open_skips,
            self.delivery_failures,
            self.dead_lettered,
            self.invariant_violations.len()
        )
    }
}

#[derive(Deserialize)]
struct ManifestDocument {
    entries: Vec<ArchiveManifestEntry>,
}

/// Main DST harness for the batch engine
pub struct BatchDSTHarness {
    config: BatchDSTConfig,
    workload: BatchWorkload,
    clock: ManualClock,
    objects: InMemoryObjectSource,
    source: SimulatedObjectSource,
    sink: SimulatedSink,
    idempotency: InMemoryIdempotencyStore,
    artifacts: InMemoryArtifactStore,
    coordinator: BatchCoordinator,
    /// Every upload ever published (ground truth for entry content)
    uploads: HashMap<Pair, Bytes>,
    history: Vec<Pair>,
    deleted: HashSet<Pair>,
    pending: VecDeque<Message>,
    dead_letters: Vec<Message>,
    /// Pair -> archive that delivered it
    delivered: HashMap<Pair, String>,
    deliveries_checked: usize,
    round: u64,
    result: BatchDSTResult,
}

impl BatchDSTHarness {
    pub fn new(config: BatchDSTConfig) -> Self {
        let clock = ManualClock::new(1_700_000_000_000);
        let objects = InMemoryObjectSource::new();
        let source = SimulatedObjectSource::new(
            objects.clone(),
            config.seed.wrapping_add(1), // Different seed for the source
            config.source_config.clone(),
        );
        let sink = SimulatedSink::new(config.seed.wrapping_add(2), config.sink_config.clone());
        let idempotency = InMemoryIdempotencyStore::new(Arc::new(clock.clone()));
        let artifacts = InMemoryArtifactStore::new();

        let coordinator = BatchCoordinator::new(
            &config.relay,
            Collaborators {
                idempotency: Arc::new(idempotency.clone()),
                breaker: Arc::new(InMemoryBreakerStore::new()),
                source: Arc::new(source.clone()),
                artifacts: Arc::new(artifacts.clone()),
                sink: Arc::new(sink.clone()),
                clock: Arc::new(clock.clone()),
            },
        );

        BatchDSTHarness {
            workload: BatchWorkload::new(config.clone()),
            result: BatchDSTResult::new(config.seed),
            config,
            clock,
            objects,
            source,
            sink,
            idempotency,
            artifacts,
            coordinator,
            uploads: HashMap::new(),
            history: Vec::new(),
            deleted: HashSet::new(),
            pending: VecDeque::new(),
            dead_letters: Vec::new(),
            delivered: HashMap::new(),
            deliveries_checked: 0,
            round: 0,
        }
    }

    /// Fault rounds followed by a calm drain
    pub async fn run(&mut self) {
        for _ in 0..self.config.rounds {
            self.publish();
            self.inject_faults();
            self.run_round(false).await;
        }
        self.drain().await;
    }

    /// Turn every fault off and keep receiving until the queue is empty
    pub async fn drain(&mut self) {
        self.source.set_config(SimulatedSourceConfig::no_faults());
        self.sink.set_config(SimulatedSinkConfig::no_faults());
        self.sink.set_outage(false);
        self.clock.advance(self.config.relay.breaker.cooldown);

        for _ in 0..self.config.drain_rounds {
            if self.pending.is_empty() {
                break;
            }
            self.run_round(true).await;
        }
    }

    fn publish(&mut self) {
        for _ in 0..self.workload.uploads_this_round() {
            let upload = self.workload.next_upload();
            let pair = (upload.object_key.clone(), upload.version_token.clone());
            self.objects
                .put(&upload.object_key, &upload.version_token, upload.data.clone());
            self.uploads.insert(pair.clone(), upload.data.clone());
            self.history.push(pair.clone());

            self.notify(&pair, upload.data.len() as u64);
            if self.workload.roll(self.config.duplicate_prob) {
                self.notify(&pair, upload.data.len() as u64);
            }
        }

        // Late redelivery of something older
        if self.workload.roll(self.config.duplicate_prob) {
            if let Some(pair) = self.workload.pick(&self.history).cloned() {
                let size = self.uploads.get(&pair).map_or(0, |d| d.len() as u64);
                self.notify(&pair, size);
            }
        }
    }

    fn notify(&mut self, pair: &Pair, size_bytes: u64) {
        let item_id = self.workload.next_item_id();
        self.pending.push_back(Message {
            notification: IngestNotification::new(item_id, pair.0.clone(), pair.1.clone(), size_bytes),
            receives: 0,
        });
        self.result.notifications_published += 1;
    }

    fn inject_faults(&mut self) {
        if self.workload.roll(self.config.delete_prob) {
            if let Some(pair) = self.workload.pick(&self.history).cloned() {
                self.objects.delete(&pair.0, &pair.1);
                self.deleted.insert(pair);
            }
        }
        if self.workload.roll(self.config.outage_toggle_prob) {
            self.sink.set_outage(!self.sink.is_down());
        }
    }

    fn receive_batch(&mut self) -> Vec<Message> {
        let take = self.config.batch_size.min(self.pending.len());
        self.pending
            .drain(..take)
            .map(|mut m| {
                m.receives += 1;
                m
            })
            .collect()
    }

    fn budget(&mut self, calm: bool) -> Duration {
        if !calm && self.workload.roll(self.config.short_budget_prob) {
            self.config.relay.coordinator.intake_cutoff() / 2
        } else {
            self.config.invocation_budget
        }
    }

    /// Two invocations receive a batch each and run concurrently
    async fn run_round(&mut self, calm: bool) {
        self.round += 1;
        let first = self.receive_batch();
        let second = self.receive_batch();
        let budgets = (self.budget(calm), self.budget(calm));
        let ids = (
            format!("inv-{:04}-a", self.round),
            format!("inv-{:04}-b", self.round),
        );

        let notifications = |batch: &[Message]| -> Vec<IngestNotification> {
            batch.iter().map(|m| m.notification.clone()).collect()
        };
        let (first_items, second_items) = (notifications(&first), notifications(&second));

        let (first_report, second_report) = tokio::join!(
            invoke(&self.coordinator, ids.0, &first_items, budgets.0),
            invoke(&self.coordinator, ids.1, &second_items, budgets.1)
        );

        for (batch, report) in [(first, first_report), (second, second_report)] {
            if let Some(report) = report {
                self.settle(batch, &report);
            }
        }
        self.check_new_deliveries();
        self.clock.advance(self.config.round_interval);
    }

    /// Ack or redeliver each message the way the transport would
    fn settle(&mut self, batch: Vec<Message>, report: &BatchReport) {
        self.result.invocations += 1;
        self.result.duplicates_skipped += report.duplicates as u64;
        self.result.items_failed += report.outcome.failed_item_ids.len() as u64;
        match &report.delivery {
            DeliveryStatus::Delivered(_) => self.result.archives_delivered += 1,
            DeliveryStatus::CircuitOpen => self.result.circuit_open_skips += 1,
            DeliveryStatus::Failed(_) => self.result.delivery_failures += 1,
            DeliveryStatus::NotAttempted => {}
        }

        self.check_report(&batch, report);

        for message in batch {
            if !report.outcome.failed_item_ids.contains(&message.notification.item_id) {
                continue;
            }
            if message.receives >= self.config.max_receives {
                self.result.dead_lettered += 1;
                self.dead_letters.push(message);
            } else {
                self.pending.push_back(message);
            }
        }
    }

    fn violation(&mut self, message: String) {
        self.result
            .invariant_violations
            .push(format!("seed {} round {}: {}", self.config.seed, self.round, message));
    }

    fn check_report(&mut self, batch: &[Message], report: &BatchReport) {
        let ids: HashSet<&str> = batch.iter().map(|m| m.notification.item_id.as_str()).collect();
        for failed in &report.outcome.failed_item_ids {
            if !ids.contains(failed.as_str()) {
                self.violation(format!("{} failed item {} it never received", report.invocation_id, failed));
            }
        }

        let unclaimed = report
            .errors
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    BatchError::TimeoutGuardTripped { .. } | BatchError::ClaimFailed { .. }
                )
            })
            .count();
        self.result.guard_trips += report
            .errors
            .iter()
            .filter(|e| matches!(e, BatchError::TimeoutGuardTripped { .. }))
            .count() as u64;
        if report.accepted + report.duplicates + unclaimed != batch.len() {
            self.violation(format!(
                "{}: {} accepted + {} duplicates + {} unclaimed != {} received",
                report.invocation_id,
                report.accepted,
                report.duplicates,
                unclaimed,
                batch.len()
            ));
        }

        if let Some(stats) = &report.archive_stats {
            let worker_count = self.config.relay.archiver.worker_count;
            if stats.peak_queue_depth > worker_count {
                self.violation(format!(
                    "{}: peak queue depth {} exceeds {} workers",
                    report.invocation_id, stats.peak_queue_depth, worker_count
                ));
            }
            let archived = report.manifest.iter().filter(|e| e.fetch_outcome.is_archived()).count();
            if report.manifest.len() != report.accepted
                || stats.entries_archived != archived
                || stats.entries_archived + stats.entries_failed != report.accepted
            {
                self.violation(format!(
                    "{}: {} accepted but manifest has {} ({} archived, stats {}+{})",
                    report.invocation_id,
                    report.accepted,
                    report.manifest.len(),
                    archived,
                    stats.entries_archived,
                    stats.entries_failed
                ));
            }
        }

        if report.is_delivered() {
            self.check_staged_artifact(report);
        }
    }

    fn check_staged_artifact(&mut self, report: &BatchReport) {
        let (Some(key), Some(digest)) = (&report.artifact_key, &report.digest) else {
            self.violation(format!("{} delivered without a staged artifact", report.invocation_id));
            return;
        };
        let stored = self.artifacts.get(key).map(|data| ContentDigest::of(&data));
        if stored.as_ref() != Some(digest) {
            self.violation(format!("{}: staged artifact {} does not hash to {}", report.invocation_id, key, digest));
        }
        let recorded = self
            .artifacts
            .metadata(key)
            .and_then(|m| m.get(META_SHA256).cloned());
        if !recorded.as_deref().is_some_and(|hex| digest.matches_hex(hex)) {
            self.violation(format!(
                "{}: artifact metadata digest {:?} differs from {}",
                report.invocation_id, recorded, digest
            ));
        }
    }

    /// Open every archive the sink accepted since the last round
    fn check_new_deliveries(&mut self) {
        let deliveries = self.sink.deliveries();
        for delivery in deliveries.iter().skip(self.deliveries_checked) {
            if !delivery.accepted {
                continue;
            }
            let recomputed = ContentDigest::of(&delivery.body);
            if recomputed != delivery.advertised || delivery.received.as_ref() != Some(&recomputed) {
                self.violation(format!(
                    "{}: accepted body hashes to {} but {} was advertised",
                    delivery.archive_id, recomputed, delivery.advertised
                ));
                continue;
            }
            if let Err(e) = self.check_archive(&delivery.archive_id, &delivery.body) {
                self.violation(format!("{}: {}", delivery.archive_id, e));
            }
        }
        self.deliveries_checked = deliveries.len();
    }

    fn check_archive(&mut self, archive_id: &str, body: &Bytes) -> Result<(), String> {
        let mut zip = zip::ZipArchive::new(Cursor::new(body.clone())).map_err(|e| format!("unreadable archive: {}", e))?;

        let manifest: ManifestDocument = {
            let file = zip
                .by_name(MANIFEST_ENTRY_NAME)
                .map_err(|e| format!("no manifest: {}", e))?;
            serde_json::from_reader(file).map_err(|e| format!("bad manifest: {}", e))?
        };

        let archived: Vec<&ArchiveManifestEntry> = manifest
            .entries
            .iter()
            .filter(|e| e.fetch_outcome.is_archived())
            .collect();
        if zip.len() != archived.len() + 1 {
            return Err(format!(
                "{} zip entries for {} archived manifest entries",
                zip.len() - 1,
                archived.len()
            ));
        }

        for entry in archived {
            let mut content = Vec::new();
            zip.by_name(&entry.entry_name)
                .map_err(|e| format!("entry {} missing: {}", entry.entry_name, e))?
                .read_to_end(&mut content)
                .map_err(|e| format!("entry {} unreadable: {}", entry.entry_name, e))?;

            let pair = (entry.source_key.clone(), entry.version_token.clone());
            let expected = self.uploads.get(&pair).map(|d| ContentDigest::of(d));
            let actual = ContentDigest::of(&content);
            if expected.as_ref() != Some(&actual) {
                return Err(format!("entry {} content differs from the upload", entry.entry_name));
            }
            if entry.sha256.as_deref() != Some(actual.hex()) {
                return Err(format!("entry {} manifest digest is wrong", entry.entry_name));
            }

            if let Some(previous) = self.delivered.insert(pair.clone(), archive_id.to_string()) {
                self.violation(format!(
                    "{}@{} delivered twice (in {} and {})",
                    pair.0, pair.1, previous, archive_id
                ));
            }
            self.result.entries_delivered += 1;
        }
        Ok(())
    }

    /// Check end-of-run invariants
    pub fn check_invariants(&mut self) {
        if !self.pending.is_empty() {
            self.violation(format!("{} messages still pending after drain", self.pending.len()));
        }

        let in_progress = self.idempotency.count_with_status(RecordStatus::InProgress);
        if in_progress > 0 {
            self.violation(format!("{} claims left IN_PROGRESS", in_progress));
        }

        let dead: HashSet<Pair> = self
            .dead_letters
            .iter()
            .map(|m| {
                (
                    m.notification.object_key.clone(),
                    m.notification.version_token.clone(),
                )
            })
            .collect();
        let mut lost: Vec<&Pair> = self
            .uploads
            .keys()
            .filter(|p| !self.delivered.contains_key(*p) && !dead.contains(*p))
            .collect();
        lost.sort();
        if let Some(first) = lost.first() {
            let message = format!(
                "{} uploads neither delivered nor dead-lettered, e.g. {}@{}",
                lost.len(),
                first.0,
                first.1
            );
            self.violation(message);
        }

        for pair in self.delivered.keys() {
            if !self.uploads.contains_key(pair) {
                let message = format!("{}@{} delivered but never uploaded", pair.0, pair.1);
                self.result.invariant_violations.push(message);
            }
        }

        self.result.source_stats = self.source.stats();
    }

    /// Uploads deleted before or after delivery
    pub fn deleted(&self) -> usize {
        self.deleted.len()
    }

    pub fn sink(&self) -> &SimulatedSink {
        &self.sink
    }

    /// Get the result
    pub fn result(&self) -> &BatchDSTResult {
        &self.result
    }

    /// Consume and return the result
    pub fn into_result(self) -> BatchDSTResult {
        self.result
    }
}

async fn invoke(
    coordinator: &BatchCoordinator,
    invocation_id: String,
    items: &[IngestNotification],
    budget: Duration,
) -> Option<BatchReport> {
    if items.is_empty() {
        return None;
    }
    Some(coordinator.run_with_id(invocation_id, items, budget).await)
}

/// Run a batch of DST runs with consecutive seeds
pub async fn run_dst_batch(
    base_seed: u64,
    count: usize,
    config_fn: impl Fn(u64) -> BatchDSTConfig,
) -> Vec<BatchDSTResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let seed = base_seed + i as u64;
        let mut harness = BatchDSTHarness::new(config_fn(seed));
        harness.run().await;
        harness.check_invariants();
        results.push(harness.into_result());
    }

    results
}

/// Summary of batch results
pub fn summarize_batch(results: &[BatchDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let invocations: u64 = results.iter().map(|r| r.invocations).sum();
    let archives: u64 = results.iter().map(|r| r.archives_delivered).sum();
    let dead: u64 = results.iter().map(|r| r.dead_lettered).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} invocations, {} archives delivered, {} dead-lettered",
        passed, total, invocations, archives, dead
    );

    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_is_seeded() {
        let uploads = |seed| {
            let mut workload = BatchWorkload::new(BatchDSTConfig::new(seed));
            (0..20)
                .map(|_| {
                    let u = workload.next_upload();
                    (u.object_key, u.version_token, u.data)
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(uploads(5), uploads(5));
        assert_ne!(uploads(5), uploads(6));
    }

    #[test]
    fn test_reuploads_get_new_versions() {
        let mut workload = BatchWorkload::new(BatchDSTConfig {
            key_space: 1,
            ..BatchDSTConfig::new(1)
        });
        let first = workload.next_upload();
        let second = workload.next_upload();
        assert_eq!(first.object_key, second.object_key);
        assert_eq!(first.version_token, "v1");
        assert_eq!(second.version_token, "v2");
    }

    #[tokio::test]
    async fn test_calm_run_delivers_everything() {
        let mut harness = BatchDSTHarness::new(BatchDSTConfig {
            rounds: 8,
            ..BatchDSTConfig::calm(42)
        });
        harness.run().await;
        harness.check_invariants();

        let result = harness.result();
        assert!(result.is_success(), "{:?}", result.invariant_violations);
        assert_eq!(result.dead_lettered, 0);
        assert!(result.archives_delivered > 0);
        println!("{}", result.summary());
    }
}
