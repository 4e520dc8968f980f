//! Data model shared by the aggregation pipeline.

use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An "object created" notification as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestNotification {
    /// Transport identifier used for retry-only-failed reporting
    pub item_id: String,
    pub object_key: String,
    /// Version id or sequence number of the object
    pub version_token: String,
    pub size_bytes: u64,
}

impl IngestNotification {
    pub fn new(
        item_id: impl Into<String>,
        object_key: impl Into<String>,
        version_token: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        IngestNotification {
            item_id: item_id.into(),
            object_key: object_key.into(),
            version_token: version_token.into(),
            size_bytes,
        }
    }
}

/// Lifecycle of an idempotency record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    InProgress,
    Complete,
}

/// Claim on one (object_key, version_token) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub dedup_key: String,
    pub status: RecordStatus,
    /// Invocation that claimed the record
    pub owner: String,
    pub expires_at_ms: u64,
}

impl IdempotencyRecord {
    pub fn in_progress(dedup_key: impl Into<String>, owner: impl Into<String>, expires_at: Timestamp) -> Self {
        IdempotencyRecord {
            dedup_key: dedup_key.into(),
            status: RecordStatus::InProgress,
            owner: owner.into(),
            expires_at_ms: expires_at.as_millis(),
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        now.as_millis() >= self.expires_at_ms
    }
}

/// What happened to one accepted entry while archiving
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FetchOutcome {
    Archived,
    FetchFailed { reason: String },
}

impl FetchOutcome {
    pub fn is_archived(&self) -> bool {
        matches!(self, FetchOutcome::Archived)
    }
}

/// Per-entry record produced by the archiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifestEntry {
    pub item_id: String,
    pub source_key: String,
    pub version_token: String,
    /// Name inside the container; empty when the fetch failed
    pub entry_name: String,
    /// Uncompressed bytes written into the container
    pub byte_count: u64,
    /// Hex SHA-256 of the entry's uncompressed content
    pub sha256: Option<String>,
    #[serde(flatten)]
    pub fetch_outcome: FetchOutcome,
}

impl ArchiveManifestEntry {
    pub fn archived(entry: &ArchiveEntry, entry_name: String, byte_count: u64, sha256: String) -> Self {
        ArchiveManifestEntry {
            item_id: entry.item_id.clone(),
            source_key: entry.object_key.clone(),
            version_token: entry.version_token.clone(),
            entry_name,
            byte_count,
            sha256: Some(sha256),
            fetch_outcome: FetchOutcome::Archived,
        }
    }

    pub fn fetch_failed(entry: &ArchiveEntry, reason: impl Into<String>) -> Self {
        ArchiveManifestEntry {
            item_id: entry.item_id.clone(),
            source_key: entry.object_key.clone(),
            version_token: entry.version_token.clone(),
            entry_name: String::new(),
            byte_count: 0,
            sha256: None,
            fetch_outcome: FetchOutcome::FetchFailed {
                reason: reason.into(),
            },
        }
    }
}

/// An accepted notification handed to the archiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub item_id: String,
    pub object_key: String,
    pub version_token: String,
    pub size_hint: u64,
}

impl From<&IngestNotification> for ArchiveEntry {
    fn from(n: &IngestNotification) -> Self {
        ArchiveEntry {
            item_id: n.item_id.clone(),
            object_key: n.object_key.clone(),
            version_token: n.version_token.clone(),
            size_hint: n.size_bytes,
        }
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Shared breaker state for one downstream service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub service_name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// When the current OPEN or HALF_OPEN state was entered (Unix ms)
    pub opened_at_ms: u64,
    /// Bumped by every successful conditional update
    pub version: u64,
}

impl BreakerRecord {
    pub fn closed(service_name: impl Into<String>) -> Self {
        BreakerRecord {
            service_name: service_name.into(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at_ms: 0,
            version: 0,
        }
    }

    pub fn opened_at(&self) -> Timestamp {
        Timestamp::from_millis(self.opened_at_ms)
    }

    /// Successor record with the version bumped
    pub fn next(&self, state: CircuitState, consecutive_failures: u32, opened_at: Timestamp) -> Self {
        BreakerRecord {
            service_name: self.service_name.clone(),
            state,
            consecutive_failures,
            opened_at_ms: opened_at.as_millis(),
            version: self.version + 1,
        }
    }
}

/// Items the transport must redeliver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub failed_item_ids: BTreeSet<String>,
}

impl BatchOutcome {
    pub fn fail(&mut self, item_id: impl Into<String>) {
        self.failed_item_ids.insert(item_id.into());
    }

    pub fn is_clean(&self) -> bool {
        self.failed_item_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_deserializes_from_transport_json() {
        let json = r#"{"item_id":"m-1","object_key":"in/a.json","version_token":"v1","size_bytes":42}"#;
        let n: IngestNotification = serde_json::from_str(json).unwrap();
        assert_eq!(n, IngestNotification::new("m-1", "in/a.json", "v1", 42));
    }

    #[test]
    fn test_record_expiry() {
        let record = IdempotencyRecord::in_progress("k", "inv", Timestamp::from_millis(1000));
        assert!(!record.is_expired(Timestamp::from_millis(999)));
        assert!(record.is_expired(Timestamp::from_millis(1000)));
    }

    #[test]
    fn test_breaker_record_next_bumps_version() {
        let record = BreakerRecord::closed("sink");
        let opened = record.next(CircuitState::Open, 3, Timestamp::from_millis(50));
        assert_eq!(opened.version, 1);
        assert_eq!(opened.opened_at(), Timestamp::from_millis(50));
        assert_eq!(opened.service_name, "sink");
    }

    #[test]
    fn test_manifest_entry_serializes_outcome_inline() {
        let entry = ArchiveEntry {
            item_id: "m-1".into(),
            object_key: "gone".into(),
            version_token: "v1".into(),
            size_hint: 0,
        };
        let failed = ArchiveManifestEntry::fetch_failed(&entry, "not found");
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["outcome"], "fetch_failed");
        assert_eq!(json["reason"], "not found");
    }

    #[test]
    fn test_batch_outcome_dedupes_ids() {
        let mut outcome = BatchOutcome::default();
        outcome.fail("a");
        outcome.fail("a");
        assert_eq!(outcome.failed_item_ids.len(), 1);
        assert!(!outcome.is_clean());
    }
}
