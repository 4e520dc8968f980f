//! Circuit Breaker
//!
//! Gates delivery to the downstream sink. State lives in the shared
//! `BreakerStore` and is re-read on every call; nothing is cached between
//! invocations.
//!
//! ```text
//!            failures >= threshold
//!   CLOSED ─────────────────────────► OPEN
//!     ▲                               │  ▲
//!     │ trial success    cooldown     │  │ trial failure
//!     │                  elapsed      ▼  │ (cooldown restarts)
//!     └────────────────────────────  HALF_OPEN
//! ```
//!
//! OPEN → HALF_OPEN is evaluated lazily inside `allow()`. Exactly one caller
//! wins the conditional update and gets the trial; the rest fail fast. A
//! HALF_OPEN trial older than the cooldown is treated as abandoned (its
//! holder crashed) and can be claimed again the same way.

pub mod store;

pub use store::{BreakerStore, CasOutcome, InMemoryBreakerStore};

use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::error::StoreError;
use crate::model::{BreakerRecord, CircuitState};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Answer to "may I call the sink now?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Go ahead; `trial` is set when this call holds the HALF_OPEN slot
    Proceed { trial: bool },
    /// Skip delivery without a network call
    FailFast { state: CircuitState },
}

impl BreakerDecision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, BreakerDecision::Proceed { .. })
    }
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    Success,
    Failure,
}

/// Breaker for one downstream service
pub struct CircuitBreaker {
    service_name: String,
    store: Arc<dyn BreakerStore>,
    clock: Arc<dyn Clock>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(
        service_name: impl Into<String>,
        store: Arc<dyn BreakerStore>,
        clock: Arc<dyn Clock>,
        config: BreakerConfig,
    ) -> Self {
        CircuitBreaker {
            service_name: service_name.into(),
            store,
            clock,
            config,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Current shared record (CLOSED if never written)
    pub async fn state(&self) -> Result<BreakerRecord, StoreError> {
        Ok(self
            .store
            .get_state(&self.service_name)
            .await?
            .unwrap_or_else(|| BreakerRecord::closed(&self.service_name)))
    }

    /// Decide whether a delivery may be attempted
    ///
    /// A store failure is answered with `FailFast`: without the shared state
    /// there is no way to know whether the sink is healthy.
    pub async fn allow(&self) -> BreakerDecision {
        match self.try_allow().await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(service = %self.service_name, error = %e, "Breaker store unavailable, failing fast");
                BreakerDecision::FailFast {
                    state: CircuitState::Open,
                }
            }
        }
    }

    async fn try_allow(&self) -> Result<BreakerDecision, StoreError> {
        let current = self.store.get_state(&self.service_name).await?;
        let record = current
            .clone()
            .unwrap_or_else(|| BreakerRecord::closed(&self.service_name));

        match record.state {
            CircuitState::Closed => Ok(BreakerDecision::Proceed { trial: false }),
            CircuitState::Open | CircuitState::HalfOpen => {
                if !self.clock.has_elapsed(record.opened_at(), self.config.cooldown) {
                    return Ok(BreakerDecision::FailFast {
                        state: record.state,
                    });
                }

                let now = self.clock.now();
                let trial = record.next(CircuitState::HalfOpen, record.consecutive_failures, now);
                match self
                    .store
                    .conditional_update(&self.service_name, current.as_ref(), &trial)
                    .await?
                {
                    CasOutcome::Applied => {
                        info!(
                            service = %self.service_name,
                            from = %record.state,
                            "Circuit half-open, trial delivery allowed"
                        );
                        Ok(BreakerDecision::Proceed { trial: true })
                    }
                    CasOutcome::Conflict => {
                        debug!(service = %self.service_name, "Lost trial slot race");
                        Ok(BreakerDecision::FailFast {
                            state: CircuitState::Open,
                        })
                    }
                }
            }
        }
    }

    /// Fold a delivery outcome into the shared state; returns the resulting state
    ///
    /// Lost conditional updates are re-read and retried up to
    /// `max_cas_attempts` times so concurrent failures are all counted.
    pub async fn record_outcome(&self, result: DeliveryResult) -> Result<CircuitState, StoreError> {
        for _ in 0..self.config.max_cas_attempts {
            let current = self.store.get_state(&self.service_name).await?;
            let record = current
                .clone()
                .unwrap_or_else(|| BreakerRecord::closed(&self.service_name));

            let Some(next) = self.transition(&record, result) else {
                return Ok(record.state);
            };

            match self
                .store
                .conditional_update(&self.service_name, current.as_ref(), &next)
                .await?
            {
                CasOutcome::Applied => {
                    self.log_transition(&record, &next);
                    return Ok(next.state);
                }
                CasOutcome::Conflict => continue,
            }
        }

        Err(StoreError::Contended(format!(
            "breaker {} not updated after {} attempts",
            self.service_name, self.config.max_cas_attempts
        )))
    }

    /// Successor record for an outcome, or None when nothing changes
    fn transition(&self, record: &BreakerRecord, result: DeliveryResult) -> Option<BreakerRecord> {
        let now = self.clock.now();
        match (record.state, result) {
            (CircuitState::Closed, DeliveryResult::Success) => {
                if record.consecutive_failures == 0 {
                    None
                } else {
                    Some(record.next(CircuitState::Closed, 0, record.opened_at()))
                }
            }
            (CircuitState::Closed, DeliveryResult::Failure) => {
                let failures = record.consecutive_failures.saturating_add(1);
                if failures >= self.config.failure_threshold {
                    Some(record.next(CircuitState::Open, failures, now))
                } else {
                    Some(record.next(CircuitState::Closed, failures, record.opened_at()))
                }
            }
            (CircuitState::HalfOpen, DeliveryResult::Success) => {
                Some(record.next(CircuitState::Closed, 0, record.opened_at()))
            }
            (CircuitState::HalfOpen, DeliveryResult::Failure) => {
                let failures = record.consecutive_failures.saturating_add(1);
                Some(record.next(CircuitState::Open, failures, now))
            }
            // Attempts that started before the circuit opened do not move the cooldown
            (CircuitState::Open, _) => None,
        }
    }

    fn log_transition(&self, from: &BreakerRecord, to: &BreakerRecord) {
        if from.state == to.state {
            debug!(
                service = %self.service_name,
                state = %to.state,
                consecutive_failures = to.consecutive_failures,
                "Breaker updated"
            );
            return;
        }
        match to.state {
            CircuitState::Open => warn!(
                service = %self.service_name,
                from = %from.state,
                consecutive_failures = to.consecutive_failures,
                cooldown_ms = self.config.cooldown.as_millis() as u64,
                "Circuit opened"
            ),
            _ => info!(
                service = %self.service_name,
                from = %from.state,
                to = %to.state,
                "Circuit state changed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn breaker(threshold: u32, cooldown_ms: u64) -> (CircuitBreaker, InMemoryBreakerStore, ManualClock) {
        let clock = ManualClock::new(10_000);
        let store = InMemoryBreakerStore::new();
        let config = BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(cooldown_ms),
            max_cas_attempts: 8,
        };
        let breaker = CircuitBreaker::new(
            "sink",
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            config,
        );
        (breaker, store, clock)
    }

    #[tokio::test]
    async fn test_fresh_breaker_is_closed() {
        let (breaker, store, _clock) = breaker(3, 1000);
        assert_eq!(breaker.allow().await, BreakerDecision::Proceed { trial: false });
        assert!(store.snapshot("sink").is_none(), "allow() on CLOSED must not write");
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let (breaker, _store, _clock) = breaker(3, 1000);

        assert_eq!(breaker.record_outcome(DeliveryResult::Failure).await.unwrap(), CircuitState::Closed);
        assert_eq!(breaker.record_outcome(DeliveryResult::Failure).await.unwrap(), CircuitState::Closed);
        assert!(breaker.allow().await.is_proceed());
        assert_eq!(breaker.record_outcome(DeliveryResult::Failure).await.unwrap(), CircuitState::Open);

        assert_eq!(
            breaker.allow().await,
            BreakerDecision::FailFast {
                state: CircuitState::Open
            }
        );
    }

    #[tokio::test]
    async fn test_success_resets_failure_counter() {
        let (breaker, _store, _clock) = breaker(3, 1000);

        breaker.record_outcome(DeliveryResult::Failure).await.unwrap();
        breaker.record_outcome(DeliveryResult::Failure).await.unwrap();
        breaker.record_outcome(DeliveryResult::Success).await.unwrap();
        assert_eq!(breaker.state().await.unwrap().consecutive_failures, 0);

        breaker.record_outcome(DeliveryResult::Failure).await.unwrap();
        breaker.record_outcome(DeliveryResult::Failure).await.unwrap();
        assert_eq!(breaker.state().await.unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_after_cooldown_single_trial() {
        let (breaker, _store, clock) = breaker(1, 1000);
        breaker.record_outcome(DeliveryResult::Failure).await.unwrap();

        clock.advance_ms(999);
        assert!(!breaker.allow().await.is_proceed());

        clock.advance_ms(1);
        assert_eq!(breaker.allow().await, BreakerDecision::Proceed { trial: true });
        assert_eq!(breaker.state().await.unwrap().state, CircuitState::HalfOpen);

        // Trial slot is taken
        assert_eq!(
            breaker.allow().await,
            BreakerDecision::FailFast {
                state: CircuitState::HalfOpen
            }
        );
    }

    #[tokio::test]
    async fn test_trial_success_closes() {
        let (breaker, _store, clock) = breaker(1, 1000);
        breaker.record_outcome(DeliveryResult::Failure).await.unwrap();
        clock.advance_ms(1000);
        assert!(breaker.allow().await.is_proceed());

        assert_eq!(breaker.record_outcome(DeliveryResult::Success).await.unwrap(), CircuitState::Closed);
        let record = breaker.state().await.unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(breaker.allow().await, BreakerDecision::Proceed { trial: false });
    }

    #[tokio::test]
    async fn test_trial_failure_reopens_and_restarts_cooldown() {
        let (breaker, _store, clock) = breaker(1, 1000);
        breaker.record_outcome(DeliveryResult::Failure).await.unwrap();
        clock.advance_ms(1000);
        assert!(breaker.allow().await.is_proceed());

        clock.advance_ms(200);
        assert_eq!(breaker.record_outcome(DeliveryResult::Failure).await.unwrap(), CircuitState::Open);
        let reopened_at = clock.now();
        assert_eq!(breaker.state().await.unwrap().opened_at(), reopened_at);

        clock.advance_ms(999);
        assert!(!breaker.allow().await.is_proceed());
        clock.advance_ms(1);
        assert_eq!(breaker.allow().await, BreakerDecision::Proceed { trial: true });
    }

    #[tokio::test]
    async fn test_abandoned_trial_can_be_reclaimed() {
        let (breaker, _store, clock) = breaker(1, 1000);
        breaker.record_outcome(DeliveryResult::Failure).await.unwrap();
        clock.advance_ms(1000);
        assert!(breaker.allow().await.is_proceed());

        // Trial holder never reports back
        clock.advance_ms(1000);
        assert_eq!(breaker.allow().await, BreakerDecision::Proceed { trial: true });
    }

    #[tokio::test]
    async fn test_outcome_while_open_is_ignored() {
        let (breaker, _store, clock) = breaker(1, 1000);
        breaker.record_outcome(DeliveryResult::Failure).await.unwrap();
        let opened = breaker.state().await.unwrap();

        clock.advance_ms(500);
        assert_eq!(breaker.record_outcome(DeliveryResult::Failure).await.unwrap(), CircuitState::Open);
        assert_eq!(breaker.record_outcome(DeliveryResult::Success).await.unwrap(), CircuitState::Open);
        assert_eq!(breaker.state().await.unwrap(), opened);
    }
}
