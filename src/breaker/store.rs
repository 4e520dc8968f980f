//! Circuit Breaker Store Abstraction
//!
//! Breaker state is shared by all concurrent invocations and only changes
//! through `conditional_update`, a compare-and-swap on the whole record.
//! `BreakerRecord::version` is bumped on every write so a record that went
//! OPEN → HALF_OPEN → OPEN never compares equal to a stale copy.

use crate::error::StoreError;
use crate::model::BreakerRecord;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Result of a compare-and-swap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    Conflict,
}

/// Key-value store with atomic conditional state transitions
pub trait BreakerStore: Send + Sync + 'static {
    /// Read the record for a service; None if it was never written
    fn get_state<'a>(
        &'a self,
        service_name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<BreakerRecord>, StoreError>> + Send + 'a>>;

    /// Replace the record only if it currently equals `expected`
    /// (`None` means "only if absent")
    fn conditional_update<'a>(
        &'a self,
        service_name: &'a str,
        expected: Option<&'a BreakerRecord>,
        new_state: &'a BreakerRecord,
    ) -> Pin<Box<dyn Future<Output = Result<CasOutcome, StoreError>> + Send + 'a>>;
}

/// In-memory breaker store; clones share state
#[derive(Debug, Clone, Default)]
pub struct InMemoryBreakerStore {
    records: Arc<Mutex<HashMap<String, BreakerRecord>>>,
    conflicts: Arc<AtomicU64>,
}

impl InMemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record without going through the async interface
    pub fn snapshot(&self, service_name: &str) -> Option<BreakerRecord> {
        self.records.lock().get(service_name).cloned()
    }

    /// Number of conditional updates rejected so far
    pub fn conflict_count(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }
}

impl BreakerStore for InMemoryBreakerStore {
    fn get_state<'a>(
        &'a self,
        service_name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<BreakerRecord>, StoreError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.snapshot(service_name)) })
    }

    fn conditional_update<'a>(
        &'a self,
        service_name: &'a str,
        expected: Option<&'a BreakerRecord>,
        new_state: &'a BreakerRecord,
    ) -> Pin<Box<dyn Future<Output = Result<CasOutcome, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut records = self.records.lock();
            if records.get(service_name) != expected {
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                return Ok(CasOutcome::Conflict);
            }
            records.insert(service_name.to_string(), new_state.clone());
            Ok(CasOutcome::Applied)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;
    use crate::model::CircuitState;

    #[tokio::test]
    async fn test_create_only_if_absent() {
        let store = InMemoryBreakerStore::new();
        let record = BreakerRecord::closed("sink");

        assert_eq!(
            store.conditional_update("sink", None, &record).await.unwrap(),
            CasOutcome::Applied
        );
        assert_eq!(
            store.conditional_update("sink", None, &record).await.unwrap(),
            CasOutcome::Conflict
        );
        assert_eq!(store.conflict_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_expected_conflicts() {
        let store = InMemoryBreakerStore::new();
        let v0 = BreakerRecord::closed("sink");
        store.conditional_update("sink", None, &v0).await.unwrap();

        let v1 = v0.next(CircuitState::Open, 3, Timestamp::from_millis(10));
        assert_eq!(
            store.conditional_update("sink", Some(&v0), &v1).await.unwrap(),
            CasOutcome::Applied
        );

        // A writer still holding v0 loses
        let stale = v0.next(CircuitState::Closed, 1, Timestamp::ZERO);
        assert_eq!(
            store.conditional_update("sink", Some(&v0), &stale).await.unwrap(),
            CasOutcome::Conflict
        );
        assert_eq!(store.get_state("sink").await.unwrap(), Some(v1));
    }
}
