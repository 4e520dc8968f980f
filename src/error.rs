//! Errors shared across the pipeline
//!
//! Component-specific errors (`SourceError`, `ArchiveError`,
//! `DeliveryError`, `ConfigError`) live next to their components. This module
//! holds the store error used by both shared stores and the batch-level
//! taxonomy the coordinator reports against.

use std::io::{Error as IoError, ErrorKind};

/// Error type for the idempotency and circuit breaker stores
#[derive(Debug)]
pub enum StoreError {
    /// Store could not be reached or timed out
    Unavailable(String),
    /// Record could not be encoded or decoded
    Codec(String),
    /// Conditional update kept losing to concurrent writers
    Contended(String),
    /// I/O error
    Io(IoError),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
            StoreError::Codec(msg) => write!(f, "Store record codec error: {}", msg),
            StoreError::Contended(msg) => write!(f, "Store update contended: {}", msg),
            StoreError::Io(e) => write!(f, "Store I/O error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<IoError> for StoreError {
    fn from(e: IoError) -> Self {
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                StoreError::Unavailable(e.to_string())
            }
            _ => StoreError::Io(e),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// Why an item ended up in `BatchOutcome::failed_item_ids`
///
/// Per-entry failures (`FetchFailed`, `TimeoutGuardTripped`) only fail the
/// affected items. The rest fail every item bundled into the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// Object missing or fetch timed out; entry omitted from the archive
    FetchFailed { item_id: String, reason: String },
    /// Invocation deadline approaching; item was never claimed
    TimeoutGuardTripped { item_id: String },
    /// Idempotency store could not decide the item
    ClaimFailed { item_id: String, reason: String },
    /// Fatal I/O while building or staging the archive
    ArchiveWriteFailed(String),
    /// Breaker is open; no delivery was attempted
    CircuitOpen { service_name: String },
    /// Sink returned an error or timed out
    DeliveryFailed(String),
}

impl BatchError {
    /// Short stable label for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            BatchError::FetchFailed { .. } => "fetch_failed",
            BatchError::TimeoutGuardTripped { .. } => "timeout_guard_tripped",
            BatchError::ClaimFailed { .. } => "claim_failed",
            BatchError::ArchiveWriteFailed(_) => "archive_write_failed",
            BatchError::CircuitOpen { .. } => "circuit_open",
            BatchError::DeliveryFailed(_) => "delivery_failed",
        }
    }

    /// True when the error fails the whole archive rather than one item
    pub fn is_batch_wide(&self) -> bool {
        matches!(
            self,
            BatchError::ArchiveWriteFailed(_)
                | BatchError::CircuitOpen { .. }
                | BatchError::DeliveryFailed(_)
        )
    }
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchError::FetchFailed { item_id, reason } => {
                write!(f, "Fetch failed for item {}: {}", item_id, reason)
            }
            BatchError::TimeoutGuardTripped { item_id } => {
                write!(f, "Timeout guard tripped before item {} was queued", item_id)
            }
            BatchError::ClaimFailed { item_id, reason } => {
                write!(f, "Idempotency claim failed for item {}: {}", item_id, reason)
            }
            BatchError::ArchiveWriteFailed(msg) => write!(f, "Archive write failed: {}", msg),
            BatchError::CircuitOpen { service_name } => {
                write!(f, "Circuit open for {}, delivery skipped", service_name)
            }
            BatchError::DeliveryFailed(msg) => write!(f, "Delivery failed: {}", msg),
        }
    }
}

impl std::error::Error for BatchError {}
