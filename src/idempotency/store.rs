//! Idempotency Store Abstraction
//!
//! The store is authoritative and shared by every concurrent invocation.
//! Each method is a single atomic conditional operation; callers never
//! read-modify-write without a condition.
//!
//! Implementations:
//! - `InMemoryIdempotencyStore`: unit tests, simulation, single-process use

use crate::clock::{Clock, Timestamp};
use crate::error::StoreError;
use crate::model::{IdempotencyRecord, RecordStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Result of a conditional create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    Exists,
}

/// Key-value store with conditional writes and TTL expiry
///
/// Expired records must behave as absent for every operation.
pub trait IdempotencyStore: Send + Sync + 'static {
    /// Create the record only if no live record exists under its key
    fn put_if_absent<'a>(
        &'a self,
        record: &'a IdempotencyRecord,
    ) -> Pin<Box<dyn Future<Output = Result<PutOutcome, StoreError>> + Send + 'a>>;

    /// Read the live record, if any
    fn get<'a>(
        &'a self,
        dedup_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<IdempotencyRecord>, StoreError>> + Send + 'a>>;

    /// Set status to COMPLETE and move expiry. Returns false if no live record exists.
    fn mark_complete<'a>(
        &'a self,
        dedup_key: &'a str,
        expires_at: Timestamp,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>>;

    /// Delete the record if it is IN_PROGRESS and owned by `owner`.
    /// Returns true if a record was removed.
    fn release<'a>(
        &'a self,
        dedup_key: &'a str,
        owner: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>>;
}

// ============================================================================
// InMemoryIdempotencyStore
// ============================================================================

/// In-memory store; clones share the same records
#[derive(Clone)]
pub struct InMemoryIdempotencyStore {
    records: Arc<Mutex<HashMap<String, IdempotencyRecord>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryIdempotencyStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        InMemoryIdempotencyStore {
            records: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.records
            .lock()
            .values()
            .filter(|r| !r.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live records with the given status
    pub fn count_with_status(&self, status: RecordStatus) -> usize {
        let now = self.clock.now();
        self.records
            .lock()
            .values()
            .filter(|r| !r.is_expired(now) && r.status == status)
            .count()
    }

    /// Drop expired records; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        before - records.len()
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn put_if_absent<'a>(
        &'a self,
        record: &'a IdempotencyRecord,
    ) -> Pin<Box<dyn Future<Output = Result<PutOutcome, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut records = self.records.lock();
            match records.get(&record.dedup_key) {
                Some(existing) if !existing.is_expired(now) => Ok(PutOutcome::Exists),
                _ => {
                    records.insert(record.dedup_key.clone(), record.clone());
                    Ok(PutOutcome::Created)
                }
            }
        })
    }

    fn get<'a>(
        &'a self,
        dedup_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<IdempotencyRecord>, StoreError>> + Send + 'a>>
    {
        Box::pin(async move {
            let now = self.clock.now();
            Ok(self
                .records
                .lock()
                .get(dedup_key)
                .filter(|r| !r.is_expired(now))
                .cloned())
        })
    }

    fn mark_complete<'a>(
        &'a self,
        dedup_key: &'a str,
        expires_at: Timestamp,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut records = self.records.lock();
            match records.get_mut(dedup_key) {
                Some(record) if !record.is_expired(now) => {
                    record.status = RecordStatus::Complete;
                    record.expires_at_ms = expires_at.as_millis();
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn release<'a>(
        &'a self,
        dedup_key: &'a str,
        owner: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut records = self.records.lock();
            let owned = matches!(
                records.get(dedup_key),
                Some(r) if r.status == RecordStatus::InProgress && r.owner == owner
            );
            if owned {
                records.remove(dedup_key);
            }
            Ok(owned)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(ms: u64) -> (InMemoryIdempotencyStore, ManualClock) {
        let clock = ManualClock::new(ms);
        (InMemoryIdempotencyStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_put_if_absent_is_conditional() {
        let (store, _clock) = store_at(0);
        let record = IdempotencyRecord::in_progress("k1", "inv-a", Timestamp::from_millis(1000));

        assert_eq!(store.put_if_absent(&record).await.unwrap(), PutOutcome::Created);
        assert_eq!(store.put_if_absent(&record).await.unwrap(), PutOutcome::Exists);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_expired_record_is_absent_and_reclaimable() {
        let (store, clock) = store_at(0);
        let record = IdempotencyRecord::in_progress("k1", "inv-a", Timestamp::from_millis(1000));
        store.put_if_absent(&record).await.unwrap();

        clock.set(1000);
        assert!(store.get("k1").await.unwrap().is_none());

        let retry = IdempotencyRecord::in_progress("k1", "inv-b", Timestamp::from_millis(2000));
        assert_eq!(store.put_if_absent(&retry).await.unwrap(), PutOutcome::Created);
        assert_eq!(store.get("k1").await.unwrap().unwrap().owner, "inv-b");
    }

    #[tokio::test]
    async fn test_mark_complete() {
        let (store, _clock) = store_at(0);
        let record = IdempotencyRecord::in_progress("k1", "inv-a", Timestamp::from_millis(1000));
        store.put_if_absent(&record).await.unwrap();

        assert!(store.mark_complete("k1", Timestamp::from_millis(9000)).await.unwrap());
        let stored = store.get("k1").await.unwrap().unwrap();
        assert_eq!(stored.status, RecordStatus::Complete);
        assert_eq!(stored.expires_at_ms, 9000);

        assert!(!store.mark_complete("missing", Timestamp::from_millis(9000)).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_only_removes_own_in_progress_claim() {
        let (store, _clock) = store_at(0);
        let record = IdempotencyRecord::in_progress("k1", "inv-a", Timestamp::from_millis(1000));
        store.put_if_absent(&record).await.unwrap();

        assert!(!store.release("k1", "inv-b").await.unwrap());
        assert!(store.release("k1", "inv-a").await.unwrap());
        assert!(store.get("k1").await.unwrap().is_none());

        // COMPLETE records are never released
        store.put_if_absent(&record).await.unwrap();
        store.mark_complete("k1", Timestamp::from_millis(5000)).await.unwrap();
        assert!(!store.release("k1", "inv-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_at(0);
        for (key, exp) in [("a", 100), ("b", 200), ("c", 300)] {
            let record = IdempotencyRecord::in_progress(key, "inv", Timestamp::from_millis(exp));
            store.put_if_absent(&record).await.unwrap();
        }

        clock.set(250);
        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.len(), 1);
    }
}
