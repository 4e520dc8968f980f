//! Idempotency Filter
//!
//! Decides whether a notification is new work or a duplicate. The first
//! invocation to conditionally create the record for an (object_key,
//! version_token) pair owns it; everyone else sees `Duplicate`, whether the
//! owner has finished (COMPLETE) or not (IN_PROGRESS). There is no waiting on
//! another invocation's claim: the transport's at-least-once redelivery
//! retries naturally.
//!
//! Records move to COMPLETE only after the batch containing them was
//! delivered. Failed items are released so redelivery can reclaim them; a
//! crashed invocation's claims stay IN_PROGRESS until their TTL expires.

pub mod store;

pub use store::{IdempotencyStore, InMemoryIdempotencyStore, PutOutcome};

use crate::clock::Clock;
use crate::config::IdempotencyConfig;
use crate::error::StoreError;
use crate::model::{IdempotencyRecord, RecordStatus};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

/// Result of `check_and_claim`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Caller owns the pair and must process it
    Claimed { dedup_key: String },
    /// Another invocation owns or finished the pair
    Duplicate {
        dedup_key: String,
        /// None if the record expired between the write and the read
        status: Option<RecordStatus>,
    },
}

impl ClaimOutcome {
    pub fn dedup_key(&self) -> &str {
        match self {
            ClaimOutcome::Claimed { dedup_key } | ClaimOutcome::Duplicate { dedup_key, .. } => {
                dedup_key
            }
        }
    }

    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed { .. })
    }
}

/// Derive the sharded dedup key for a pair
///
/// The shard prefix is the first `prefix_len` hex characters of
/// SHA-256(object_key NUL version_token), spreading sequential object keys
/// across the store's partitions. The key length is embedded so that `#`
/// inside a key or version cannot make two pairs collide.
pub fn dedup_key(object_key: &str, version_token: &str, prefix_len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(object_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(version_token.as_bytes());
    let digest = hex::encode(hasher.finalize());
    let shard = &digest[..prefix_len.min(digest.len())];
    format!("{}#{}:{}#{}", shard, object_key.len(), object_key, version_token)
}

/// Duplicate suppression over an explicit store
pub struct IdempotencyFilter {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    config: IdempotencyConfig,
}

impl IdempotencyFilter {
    pub fn new(store: Arc<dyn IdempotencyStore>, clock: Arc<dyn Clock>, config: IdempotencyConfig) -> Self {
        IdempotencyFilter { store, clock, config }
    }

    pub fn key_for(&self, object_key: &str, version_token: &str) -> String {
        dedup_key(object_key, version_token, self.config.shard_prefix_len)
    }

    /// Claim the pair for `owner`, or report it as a duplicate
    pub async fn check_and_claim(
        &self,
        object_key: &str,
        version_token: &str,
        owner: &str,
    ) -> Result<ClaimOutcome, StoreError> {
        let dedup_key = self.key_for(object_key, version_token);
        let expires_at = self.clock.now() + self.config.ttl;
        let record = IdempotencyRecord::in_progress(dedup_key.clone(), owner, expires_at);

        match self.store.put_if_absent(&record).await? {
            PutOutcome::Created => {
                debug!(dedup_key = %dedup_key, "Claimed");
                Ok(ClaimOutcome::Claimed { dedup_key })
            }
            PutOutcome::Exists => {
                let status = self.store.get(&dedup_key).await?.map(|r| r.status);
                debug!(dedup_key = %dedup_key, ?status, "Duplicate");
                Ok(ClaimOutcome::Duplicate { dedup_key, status })
            }
        }
    }

    /// Record that the pair was delivered
    pub async fn mark_complete(&self, dedup_key: &str) -> Result<bool, StoreError> {
        let expires_at = self.clock.now() + self.config.completed_ttl;
        self.store.mark_complete(dedup_key, expires_at).await
    }

    /// Give up a claim so redelivery can reclaim it
    pub async fn release(&self, dedup_key: &str, owner: &str) -> Result<bool, StoreError> {
        self.store.release(dedup_key, owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::HashSet;

    fn filter() -> (IdempotencyFilter, InMemoryIdempotencyStore, ManualClock) {
        let clock = ManualClock::new(1_000);
        let store = InMemoryIdempotencyStore::new(Arc::new(clock.clone()));
        let filter = IdempotencyFilter::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            IdempotencyConfig::test(),
        );
        (filter, store, clock)
    }

    #[test]
    fn test_dedup_key_has_shard_prefix() {
        let key = dedup_key("uploads/2024/01/a.json", "v1", 4);
        let (shard, rest) = key.split_once('#').unwrap();
        assert_eq!(shard.len(), 4);
        assert!(shard.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(rest, "22:uploads/2024/01/a.json#v1");
    }

    #[test]
    fn test_dedup_key_separates_versions_and_ambiguous_splits() {
        assert_ne!(dedup_key("a", "v1", 4), dedup_key("a", "v2", 4));
        assert_ne!(dedup_key("a#b", "c", 4), dedup_key("a", "b#c", 4));
        assert_eq!(dedup_key("a", "v1", 4), dedup_key("a", "v1", 4));
    }

    #[test]
    fn test_sequential_keys_spread_across_shards() {
        let shards: HashSet<String> = (0..256)
            .map(|i| dedup_key(&format!("logs/object-{:06}", i), "1", 2)[..2].to_string())
            .collect();
        // 256 keys over 256 two-hex-char shards should not cluster
        assert!(shards.len() > 100, "only {} shards used", shards.len());
    }

    #[tokio::test]
    async fn test_first_claim_wins_then_duplicate() {
        let (filter, _store, _clock) = filter();

        let first = filter.check_and_claim("a.json", "v1", "inv-1").await.unwrap();
        assert!(first.is_claimed());

        let second = filter.check_and_claim("a.json", "v1", "inv-2").await.unwrap();
        assert_eq!(
            second,
            ClaimOutcome::Duplicate {
                dedup_key: first.dedup_key().to_string(),
                status: Some(RecordStatus::InProgress),
            }
        );
    }

    #[tokio::test]
    async fn test_complete_record_stays_duplicate() {
        let (filter, store, _clock) = filter();

        let claim = filter.check_and_claim("a.json", "v1", "inv-1").await.unwrap();
        assert!(filter.mark_complete(claim.dedup_key()).await.unwrap());
        assert_eq!(store.count_with_status(RecordStatus::Complete), 1);

        let again = filter.check_and_claim("a.json", "v1", "inv-2").await.unwrap();
        assert!(matches!(
            again,
            ClaimOutcome::Duplicate {
                status: Some(RecordStatus::Complete),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_released_claim_is_reclaimable() {
        let (filter, _store, _clock) = filter();

        let claim = filter.check_and_claim("a.json", "v1", "inv-1").await.unwrap();
        assert!(filter.release(claim.dedup_key(), "inv-1").await.unwrap());

        let retry = filter.check_and_claim("a.json", "v1", "inv-2").await.unwrap();
        assert!(retry.is_claimed());
    }

    #[tokio::test]
    async fn test_crashed_claim_reclaimable_after_ttl() {
        let (filter, _store, clock) = filter();

        filter.check_and_claim("a.json", "v1", "crashed").await.unwrap();
        assert!(!filter
            .check_and_claim("a.json", "v1", "inv-2")
            .await
            .unwrap()
            .is_claimed());

        clock.advance(IdempotencyConfig::test().ttl);
        assert!(filter
            .check_and_claim("a.json", "v1", "inv-3")
            .await
            .unwrap()
            .is_claimed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_yield_exactly_one_winner() {
        let (filter, _store, _clock) = filter();
        let filter = Arc::new(filter);

        let mut handles = Vec::new();
        for i in 0..16 {
            let filter = filter.clone();
            handles.push(tokio::spawn(async move {
                filter
                    .check_and_claim("race.json", "v7", &format!("inv-{}", i))
                    .await
                    .unwrap()
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap().is_claimed() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }
}
