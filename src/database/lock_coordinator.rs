//! Lock coordinator: ordered row locks, explicit isolation, bounded retry
//!
//! Every mutation in this subsystem runs inside a transaction opened here.
//! Two rules carry the correctness story:
//!
//! 1. Lock keys are always sorted ascending before the `FOR UPDATE` read,
//!    regardless of call-site order. Two concurrent two-gauge operations
//!    referencing the same pair in opposite order therefore acquire locks
//!    in the same global order and cannot deadlock against each other.
//! 2. The isolation level is set explicitly per transaction from injected
//!    configuration, never inherited from the store default, so a future
//!    store-configuration change cannot silently weaken the row-lock reads.
//!
//! Serialization conflicts and deadlocks surface as `Retryable` and are
//! re-attempted with bounded exponential backoff; lock-wait timeouts
//! surface as `LockTimeout` and are fatal for the attempt.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::database::gauge_store::GaugeStore;
use crate::error::{GaugeError, GaugeResult};
use crate::models::gauge::Gauge;

/// Transaction isolation level, stated in code rather than configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_set_statement(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => {
                "SET TRANSACTION ISOLATION LEVEL READ COMMITTED"
            }
            IsolationLevel::RepeatableRead => {
                "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"
            }
            IsolationLevel::Serializable => "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
        }
    }
}

/// Locking and retry knobs, injected into every coordinator.
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub isolation: IsolationLevel,
    /// Bounded wait for a contended row lock; expiry is `LockTimeout`.
    pub lock_wait_timeout: Duration,
    /// Attempts for `Retryable` conflicts, including the first.
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub backoff_base: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::RepeatableRead,
            lock_wait_timeout: Duration::from_secs(5),
            max_attempts: 3,
            backoff_base: Duration::from_millis(20),
        }
    }
}

#[derive(Clone)]
pub struct LockCoordinator {
    pool: PgPool,
    store: GaugeStore,
    config: LockConfig,
}

impl LockCoordinator {
    pub fn new(pool: PgPool, config: LockConfig) -> Self {
        let store = GaugeStore::new(pool.clone());
        Self {
            pool,
            store,
            config,
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Open a transaction with the configured isolation level and lock-wait
    /// timeout already applied.
    pub async fn begin(&self) -> GaugeResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(self.config.isolation.as_set_statement())
            .execute(&mut *tx)
            .await?;

        let timeout_stmt = format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.config.lock_wait_timeout.as_millis()
        );
        sqlx::query(&timeout_stmt).execute(&mut *tx).await?;

        Ok(tx)
    }

    /// Acquire blocking row locks on exactly the supplied gauges and return
    /// their locked snapshots. Keys are sorted (and de-duplicated) here;
    /// callers never control acquisition order.
    pub async fn lock_gauges(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        keys: &[Uuid],
    ) -> GaugeResult<Vec<Gauge>> {
        let sorted = sort_lock_keys(keys);
        let locked = self
            .store
            .fetch_by_keys_for_update(&mut *tx, &sorted)
            .await?;

        if locked.len() != sorted.len() {
            // A key vanished between resolution and locking; the row set is
            // authoritative, so report the missing gauge rather than operate
            // on a partial lock set.
            let missing = sorted
                .iter()
                .find(|k| !locked.iter().any(|g| g.internal_key == **k))
                .map(|k| k.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(GaugeError::NotFound {
                identifier: missing,
            });
        }

        debug!(locked = locked.len(), "acquired ordered row locks");
        Ok(locked)
    }

    /// Single-attempt composition: begin, lock the given keys, run the body
    /// with the locked snapshots, commit. Any error rolls the transaction
    /// back before propagating.
    pub async fn with_locked_gauges<T, F>(&self, keys: Vec<Uuid>, body: F) -> GaugeResult<T>
    where
        F: for<'t> FnOnce(
            &'t mut Transaction<'static, Postgres>,
            Vec<Gauge>,
        ) -> BoxFuture<'t, GaugeResult<T>>,
    {
        let mut tx = self.begin().await?;
        let locked = self.lock_gauges(&mut tx, &keys).await?;
        let value = body(&mut tx, locked).await?;
        tx.commit().await?;
        Ok(value)
    }

    /// Bounded retry wrapper for whole-operation attempts. Retries only
    /// `Retryable` classifications; semantic errors and lock timeouts
    /// surface to the caller immediately.
    pub async fn run_with_retry<T, F, Fut>(
        &self,
        operation: &str,
        mut attempt_fn: F,
    ) -> GaugeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GaugeResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let classified = err.classify_for(operation);
                    if classified.is_retryable() && attempt + 1 < max_attempts {
                        let delay = backoff_delay(self.config.backoff_base, attempt);
                        warn!(
                            operation,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            "serialization conflict, backing off before retry"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(classified);
                }
            }
        }
    }
}

/// Global lock-acquisition order: ascending by internal key, duplicates
/// collapsed. This single rule is the deadlock-freedom argument.
pub fn sort_lock_keys(keys: &[Uuid]) -> Vec<Uuid> {
    let mut sorted = keys.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(8));
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64);
    exp + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_sort_ascending_regardless_of_call_order() {
        let a = Uuid::from_u128(7);
        let b = Uuid::from_u128(3);
        let c = Uuid::from_u128(9);
        assert_eq!(sort_lock_keys(&[a, b, c]), vec![b, a, c]);
        assert_eq!(sort_lock_keys(&[c, a, b]), vec![b, a, c]);
    }

    #[test]
    fn duplicate_keys_collapse_to_one_lock() {
        let a = Uuid::from_u128(5);
        let b = Uuid::from_u128(1);
        assert_eq!(sort_lock_keys(&[a, b, a]), vec![b, a]);
    }

    #[test]
    fn isolation_levels_render_explicit_set_statements() {
        assert_eq!(
            IsolationLevel::RepeatableRead.as_set_statement(),
            "SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"
        );
        assert_eq!(
            IsolationLevel::Serializable.as_set_statement(),
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"
        );
    }

    #[test]
    fn default_config_matches_recommended_bounds() {
        let config = LockConfig::default();
        assert_eq!(config.isolation, IsolationLevel::RepeatableRead);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base, Duration::from_millis(20));
        assert_eq!(config.lock_wait_timeout, Duration::from_secs(5));
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let base = Duration::from_millis(20);
        // jitter is bounded by base, so attempt 3 always exceeds attempt 0
        let first = backoff_delay(base, 0);
        let later = backoff_delay(base, 3);
        assert!(later >= first || later >= base * 8);
    }
}
