//! Batch Coordinator
//!
//! Runs one invocation end to end:
//!
//! ```text
//! notifications ──► claim (dedup) ──► archive ──► breaker ──► stage + hash ──► sink
//!                        │                │            │             │            │
//!                    duplicates     fetch failures  fail fast    staging err   failure
//!                    (handled)      (item failed)    (batch)   (batch failed)  (batch)
//! ```
//!
//! Nothing is retried here. Every failed item id ends up in
//! `BatchOutcome::failed_item_ids` and is redelivered by the transport; its
//! claim is released first so the redelivery can take it again.

use crate::archiver::{ArchiveResult, ArchiveStats, StreamingArchiver};
use crate::breaker::{BreakerDecision, BreakerStore, CircuitBreaker, DeliveryResult};
use crate::clock::Clock;
use crate::config::{CoordinatorConfig, RelayConfig};
use crate::delivery::artifact::{ArtifactMetadata, META_ENTRIES, META_INVOCATION, META_SHA256};
use crate::delivery::{ArchivePayload, ArtifactStore, DeliveryReceipt, DeliverySink};
use crate::error::BatchError;
use crate::idempotency::{ClaimOutcome, IdempotencyFilter, IdempotencyStore};
use crate::integrity::{ContentDigest, HashingReader};
use crate::model::{ArchiveEntry, ArchiveManifestEntry, BatchOutcome, FetchOutcome, IngestNotification};
use crate::source::ObjectSource;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Monotonic invocation deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn after(remaining: Duration) -> Self {
        Deadline {
            expires_at: Instant::now() + remaining,
        }
    }

    pub fn at(expires_at: Instant) -> Self {
        Deadline { expires_at }
    }

    pub fn instant(&self) -> Instant {
        self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// The deadline moved earlier by `reserve`, never before now
    pub fn reserving(&self, reserve: Duration) -> Instant {
        let now = Instant::now();
        self.expires_at
            .checked_sub(reserve)
            .map_or(now, |t| t.max(now))
    }
}

/// External collaborators of the coordinator
#[derive(Clone)]
pub struct Collaborators {
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub breaker: Arc<dyn BreakerStore>,
    pub source: Arc<dyn ObjectSource>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub sink: Arc<dyn DeliverySink>,
    pub clock: Arc<dyn Clock>,
}

/// What happened at the delivery boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// The sink was not called (no accepted items, nothing archived, or
    /// archiving or staging failed)
    NotAttempted,
    /// Breaker was open; the sink was not called
    CircuitOpen,
    Delivered(DeliveryReceipt),
    Failed(String),
}

/// Full account of one invocation
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub invocation_id: String,
    pub outcome: BatchOutcome,
    /// Every error, per item or per batch, in the order it happened
    pub errors: Vec<BatchError>,
    pub duplicates: usize,
    pub accepted: usize,
    /// Per-entry archive outcomes, in acceptance order
    pub manifest: Vec<ArchiveManifestEntry>,
    pub archive_stats: Option<ArchiveStats>,
    pub artifact_key: Option<String>,
    pub digest: Option<ContentDigest>,
    pub delivery: DeliveryStatus,
}

impl BatchReport {
    fn new(invocation_id: String) -> Self {
        BatchReport {
            invocation_id,
            outcome: BatchOutcome::default(),
            errors: Vec::new(),
            duplicates: 0,
            accepted: 0,
            manifest: Vec::new(),
            archive_stats: None,
            artifact_key: None,
            digest: None,
            delivery: DeliveryStatus::NotAttempted,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self.delivery, DeliveryStatus::Delivered(_))
    }

    /// Entries that reached the sink in this invocation
    pub fn delivered_entries(&self) -> impl Iterator<Item = &ArchiveManifestEntry> {
        let delivered = self.is_delivered();
        self.manifest
            .iter()
            .filter(move |e| delivered && e.fetch_outcome.is_archived())
    }

    fn fail_item(&mut self, item_id: &str, error: BatchError) {
        self.outcome.fail(item_id);
        self.errors.push(error);
    }

    fn fail_all<'a>(&mut self, items: impl IntoIterator<Item = &'a Accepted>, error: BatchError) {
        for item in items {
            self.outcome.fail(item.entry.item_id.as_str());
        }
        self.errors.push(error);
    }
}

/// A claimed notification
#[derive(Debug, Clone)]
struct Accepted {
    entry: ArchiveEntry,
    dedup_key: String,
}

/// Fresh random invocation id
pub fn new_invocation_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

pub struct BatchCoordinator {
    config: CoordinatorConfig,
    filter: IdempotencyFilter,
    archiver: StreamingArchiver,
    breaker: CircuitBreaker,
    artifacts: Arc<dyn ArtifactStore>,
    sink: Arc<dyn DeliverySink>,
}

impl BatchCoordinator {
    pub fn new(config: &RelayConfig, deps: Collaborators) -> Self {
        BatchCoordinator {
            config: config.coordinator.clone(),
            filter: IdempotencyFilter::new(deps.idempotency, deps.clock.clone(), config.idempotency.clone()),
            archiver: StreamingArchiver::new(deps.source, config.archiver.clone()),
            breaker: CircuitBreaker::new(
                config.coordinator.service_name.clone(),
                deps.breaker,
                deps.clock,
                config.breaker.clone(),
            ),
            artifacts: deps.artifacts,
            sink: deps.sink,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn filter(&self) -> &IdempotencyFilter {
        &self.filter
    }

    /// Process a batch and return the ids the transport must redeliver
    pub async fn process_batch(&self, notifications: &[IngestNotification], remaining: Duration) -> BatchOutcome {
        self.run(notifications, remaining).await.outcome
    }

    /// Process a batch under a fresh invocation id
    pub async fn run(&self, notifications: &[IngestNotification], remaining: Duration) -> BatchReport {
        self.run_with_id(new_invocation_id(), notifications, remaining).await
    }

    /// Process a batch under the given invocation id
    ///
    /// The id owns this invocation's claims and names the artifact, so it
    /// must be unique per invocation.
    pub async fn run_with_id(
        &self,
        invocation_id: String,
        notifications: &[IngestNotification],
        remaining: Duration,
    ) -> BatchReport {
        let span = info_span!("batch", invocation_id = %invocation_id, items = notifications.len());
        self.execute(invocation_id, notifications, Deadline::after(remaining))
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        invocation_id: String,
        notifications: &[IngestNotification],
        deadline: Deadline,
    ) -> BatchReport {
        let mut report = BatchReport::new(invocation_id);

        let accepted = self.triage(notifications, &deadline, &mut report).await;
        report.accepted = accepted.len();
        if accepted.is_empty() {
            self.finish(&report);
            return report;
        }

        let archive_deadline = deadline.reserving(self.config.delivery_reserve);
        let entries = accepted.iter().map(|a| a.entry.clone()).collect();
        let result = match self.archiver.archive(entries, archive_deadline).await {
            Ok(result) => result,
            Err(e) => {
                self.release_all(&accepted, &report.invocation_id).await;
                report.fail_all(&accepted, BatchError::ArchiveWriteFailed(e.to_string()));
                self.finish(&report);
                return report;
            }
        };
        report.archive_stats = Some(result.stats.clone());
        report.manifest = result.manifest.clone();

        let mut bundled = Vec::with_capacity(accepted.len());
        for (item, record) in accepted.into_iter().zip(result.manifest.iter()) {
            match &record.fetch_outcome {
                FetchOutcome::Archived => bundled.push(item),
                FetchOutcome::FetchFailed { reason } => {
                    self.release(&item, &report.invocation_id).await;
                    report.fail_item(
                        &item.entry.item_id,
                        BatchError::FetchFailed {
                            item_id: item.entry.item_id.clone(),
                            reason: reason.clone(),
                        },
                    );
                }
            }
        }
        if bundled.is_empty() {
            info!("No entry survived archiving, skipping delivery");
            self.finish(&report);
            return report;
        }

        self.deliver(&result, &bundled, &deadline, &mut report).await;
        self.finish(&report);
        report
    }

    /// Claim items in arrival order until the timeout guard trips
    async fn triage(
        &self,
        notifications: &[IngestNotification],
        deadline: &Deadline,
        report: &mut BatchReport,
    ) -> Vec<Accepted> {
        let mut accepted = Vec::with_capacity(notifications.len());

        let cutoff = self.config.intake_cutoff();

        for (position, notification) in notifications.iter().enumerate() {
            if deadline.remaining() < cutoff {
                let unqueued = &notifications[position..];
                warn!(
                    remaining_ms = deadline.remaining().as_millis() as u64,
                    cutoff_ms = cutoff.as_millis() as u64,
                    unqueued = unqueued.len(),
                    "Timeout guard tripped, deferring rest of batch"
                );
                for rest in unqueued {
                    report.fail_item(
                        &rest.item_id,
                        BatchError::TimeoutGuardTripped {
                            item_id: rest.item_id.clone(),
                        },
                    );
                }
                break;
            }

            match self
                .filter
                .check_and_claim(
                    &notification.object_key,
                    &notification.version_token,
                    &report.invocation_id,
                )
                .await
            {
                Ok(ClaimOutcome::Claimed { dedup_key }) => accepted.push(Accepted {
                    entry: ArchiveEntry::from(notification),
                    dedup_key,
                }),
                Ok(ClaimOutcome::Duplicate { dedup_key, status }) => {
                    debug!(item_id = %notification.item_id, %dedup_key, ?status, "Duplicate skipped");
                    report.duplicates += 1;
                }
                Err(e) => {
                    warn!(item_id = %notification.item_id, error = %e, "Claim failed");
                    report.fail_item(
                        &notification.item_id,
                        BatchError::ClaimFailed {
                            item_id: notification.item_id.clone(),
                            reason: e.to_string(),
                        },
                    );
                }
            }
        }

        accepted
    }

    /// Gate, stage and send the archive; settle every bundled claim
    async fn deliver(
        &self,
        result: &ArchiveResult,
        bundled: &[Accepted],
        deadline: &Deadline,
        report: &mut BatchReport,
    ) {
        // Nothing is staged while the circuit is open
        if let BreakerDecision::FailFast { state } = self.breaker.allow().await {
            info!(service = %self.breaker.service_name(), %state, "Circuit open, delivery skipped");
            self.release_all(bundled, &report.invocation_id).await;
            report.fail_all(
                bundled,
                BatchError::CircuitOpen {
                    service_name: self.breaker.service_name().to_string(),
                },
            );
            report.delivery = DeliveryStatus::CircuitOpen;
            return;
        }

        let artifact_key = format!("{}/{}.zip", self.config.artifact_prefix, report.invocation_id);
        let staged = self
            .stage(&artifact_key, result, &report.invocation_id)
            .await
            .and_then(|digest| Ok((digest, result.archive.reader()?)));
        let (digest, body) = match staged {
            Ok(staged) => staged,
            Err(e) => {
                warn!(artifact_key = %artifact_key, error = %e, "Staging archive failed");
                self.release_all(bundled, &report.invocation_id).await;
                report.fail_all(bundled, BatchError::ArchiveWriteFailed(e.to_string()));
                return;
            }
        };
        report.artifact_key = Some(artifact_key);
        report.digest = Some(digest.clone());

        // An exhausted budget says nothing about the sink, so the breaker is
        // left alone
        if deadline.is_expired() {
            let reason = "invocation deadline reached before delivery".to_string();
            warn!("Budget exhausted after staging, delivery not attempted");
            self.release_all(bundled, &report.invocation_id).await;
            report.fail_all(bundled, BatchError::DeliveryFailed(reason.clone()));
            report.delivery = DeliveryStatus::Failed(reason);
            return;
        }

        let payload = ArchivePayload {
            archive_id: report.invocation_id.clone(),
            digest,
            content_length: result.archive.len(),
            body,
        };
        let sent = match tokio::time::timeout(deadline.remaining(), self.sink.deliver(payload)).await {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("invocation deadline reached during delivery".to_string()),
        };

        let outcome = if sent.is_ok() {
            DeliveryResult::Success
        } else {
            DeliveryResult::Failure
        };
        if let Err(e) = self.breaker.record_outcome(outcome).await {
            warn!(error = %e, ?outcome, "Could not record delivery outcome");
        }

        match sent {
            Ok(receipt) => {
                for item in bundled {
                    match self.filter.mark_complete(&item.dedup_key).await {
                        Ok(true) => {}
                        Ok(false) => warn!(item_id = %item.entry.item_id, "Claim expired before completion"),
                        Err(e) => warn!(item_id = %item.entry.item_id, error = %e, "Could not mark item complete"),
                    }
                }
                report.delivery = DeliveryStatus::Delivered(receipt);
            }
            Err(reason) => {
                self.release_all(bundled, &report.invocation_id).await;
                report.fail_all(bundled, BatchError::DeliveryFailed(reason.clone()));
                report.delivery = DeliveryStatus::Failed(reason);
            }
        }
    }

    /// Upload the archive through the hasher and attach the digest
    async fn stage(
        &self,
        artifact_key: &str,
        result: &ArchiveResult,
        invocation_id: &str,
    ) -> Result<ContentDigest, IoError> {
        let (reader, handle) = HashingReader::new(result.archive.reader()?);
        let stored = self.artifacts.put_stream(artifact_key, Box::new(reader)).await?;

        let digest = handle.finalize().ok_or_else(|| {
            IoError::new(
                ErrorKind::UnexpectedEof,
                format!("artifact upload stopped after {} bytes", handle.bytes_hashed()),
            )
        })?;
        if stored != digest.byte_count() || stored != result.archive.len() {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!(
                    "artifact size mismatch: archive {} bytes, hashed {}, stored {}",
                    result.archive.len(),
                    digest.byte_count(),
                    stored
                ),
            ));
        }

        let mut metadata = ArtifactMetadata::new();
        metadata.insert(META_SHA256.to_string(), digest.hex().to_string());
        metadata.insert(META_INVOCATION.to_string(), invocation_id.to_string());
        metadata.insert(META_ENTRIES.to_string(), result.stats.entries_archived.to_string());
        self.artifacts.update_metadata(artifact_key, &metadata).await?;

        debug!(artifact_key, %digest, bytes = stored, "Archive staged");
        Ok(digest)
    }

    async fn release(&self, item: &Accepted, invocation_id: &str) {
        if let Err(e) = self.filter.release(&item.dedup_key, invocation_id).await {
            warn!(item_id = %item.entry.item_id, error = %e, "Could not release claim");
        }
    }

    async fn release_all(&self, items: &[Accepted], invocation_id: &str) {
        for item in items {
            self.release(item, invocation_id).await;
        }
    }

    fn finish(&self, report: &BatchReport) {
        info!(
            accepted = report.accepted,
            duplicates = report.duplicates,
            failed = report.outcome.failed_item_ids.len(),
            delivered = report.is_delivered(),
            "Batch finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_remaining_shrinks() {
        let deadline = Deadline::after(Duration::from_millis(200));
        assert!(deadline.remaining() <= Duration::from_millis(200));
        assert!(!deadline.is_expired());

        let past = Deadline::at(Instant::now());
        assert!(past.is_expired());
    }

    #[tokio::test]
    async fn test_reserving_never_goes_before_now() {
        let deadline = Deadline::after(Duration::from_millis(50));
        let before = Instant::now();
        assert!(deadline.reserving(Duration::from_secs(10)) >= before);
        assert!(deadline.reserving(Duration::from_millis(10)) < deadline.instant());
    }

    #[test]
    fn test_invocation_ids_are_hex_and_distinct() {
        let a = new_invocation_id();
        let b = new_invocation_id();
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
