//! Retry controller with backoff and partial-failure processing.
//!
//! Failures are classified first. Recoverable categories are retried with the
//! configured backoff; fatal categories surface immediately. Backoff sleeps
//! through `tokio::time::sleep` and never holds a lock while waiting.

mod classify;

pub use classify::{ErrorCategory, ErrorClassifier};

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{BackoffStrategy, RetryConfig};
use crate::core::Provenance;
use crate::error::{MigrateError, Result};

/// Maximum jitter added on top of a clamped delay.
const JITTER_RATIO: f64 = 0.10;

/// Backoff computation for one retry configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            strategy: config.strategy,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter: config.jitter,
        }
    }

    /// Delay after failed attempt `attempt` (1-based), clamped but not jittered.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Fixed => self.base_delay,
        };
        delay.min(self.max_delay)
    }

    /// Delay after failed attempt `attempt`, with jitter applied when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=JITTER_RATIO);
        delay + delay.mul_f64(extra)
    }
}

/// Successful result of [`RetryController::execute_with_retry`].
#[derive(Debug, Clone)]
pub struct Retried<T> {
    pub value: T,
    /// Attempts used, including the successful one.
    pub attempts: u32,
    /// Every delay applied between attempts, in order.
    pub delays: Vec<Duration>,
}

/// Per-category retry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStats {
    /// Operations executed.
    pub operations: u64,
    /// Retries performed (attempts beyond the first).
    pub retries: u64,
    /// Operations that succeeded after at least one retry.
    pub recovered: u64,
    /// Operations that ran out of attempts.
    pub exhausted: u64,
    /// Operations stopped by a fatal category.
    pub fatal: u64,
    /// Failures seen, by category.
    pub by_category: BTreeMap<ErrorCategory, u64>,
}

impl RetryStats {
    fn record_failure(&mut self, category: ErrorCategory) {
        *self.by_category.entry(category).or_insert(0) += 1;
    }
}

/// One item that failed inside [`RetryController::process_with_partial_failures`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// Index of the item in the input slice.
    pub index: usize,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

/// Aggregate result of partial-failure processing.
#[derive(Debug, Clone)]
pub struct PartialOutcome<T> {
    /// Successful items as `(index, value)`, in input order.
    pub successes: Vec<(usize, T)>,
    pub failures: Vec<ItemFailure>,
    /// Items actually attempted.
    pub processed: usize,
    /// Whether the failure ratio tripped and the remaining items were skipped.
    pub aborted: bool,
}

impl<T> PartialOutcome<T> {
    /// Failures over processed items; 0 when nothing was processed.
    pub fn failure_ratio(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.failures.len() as f64 / self.processed as f64
        }
    }
}

/// Classifies failures and retries recoverable ones.
pub struct RetryController {
    policy: RetryPolicy,
    classifier: ErrorClassifier,
    sub_batch_size: usize,
    stats: Mutex<RetryStats>,
}

impl RetryController {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            policy: RetryPolicy::from_config(config),
            classifier: ErrorClassifier::new(),
            sub_batch_size: config.sub_batch_size.max(1),
            stats: Mutex::new(RetryStats::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classify(&self, error: &MigrateError) -> ErrorCategory {
        self.classifier.classify(error)
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> RetryStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn update_stats(&self, f: impl FnOnce(&mut RetryStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// Returned errors are always [`MigrateError::Fatal`] or
    /// [`MigrateError::Recoverable`], except cancellation which passes through.
    pub async fn execute_with_retry<T, F, Fut>(&self, mut op: F) -> Result<Retried<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.update_stats(|s| s.operations += 1);
        let mut delays = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        self.update_stats(|s| s.recovered += 1);
                    }
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                        delays,
                    });
                }
                Err(e) => e,
            };

            if matches!(err, MigrateError::Cancelled | MigrateError::Aborted { .. }) {
                return Err(err);
            }

            let category = self.classifier.classify(&err);
            self.update_stats(|s| s.record_failure(category));

            if !category.is_recoverable() {
                debug!("Fatal {} on attempt {}: {}", category, attempt, err);
                self.update_stats(|s| s.fatal += 1);
                return Err(into_fatal(err, category));
            }

            if attempt >= self.policy.max_attempts {
                warn!(
                    "Giving up after {} attempt(s) ({}): {}",
                    attempt, category, err
                );
                self.update_stats(|s| s.exhausted += 1);
                return Err(MigrateError::Recoverable {
                    category,
                    attempts: attempt,
                    message: message_of(&err),
                });
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                "{} on attempt {}/{}, retrying in {:?}: {}",
                category, attempt, self.policy.max_attempts, delay, err
            );
            self.update_stats(|s| s.retries += 1);
            tokio::time::sleep(delay).await;
            delays.push(delay);
        }
    }

    /// Process `items` in sub-batches, retrying each item individually.
    ///
    /// After every sub-batch the failure ratio is checked against
    /// `max_failure_ratio`; once exceeded, the remaining items are skipped and
    /// the outcome is marked aborted.
    pub async fn process_with_partial_failures<I, T, F, Fut>(
        &self,
        items: &[I],
        mut f: F,
        max_failure_ratio: f64,
    ) -> PartialOutcome<T>
    where
        I: Clone,
        F: FnMut(I) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut outcome = PartialOutcome {
            successes: Vec::with_capacity(items.len()),
            failures: Vec::new(),
            processed: 0,
            aborted: false,
        };

        for (chunk_index, chunk) in items.chunks(self.sub_batch_size).enumerate() {
            let offset = chunk_index * self.sub_batch_size;
            for (i, item) in chunk.iter().enumerate() {
                let index = offset + i;
                match self.execute_with_retry(|| f(item.clone())).await {
                    Ok(retried) => outcome.successes.push((index, retried.value)),
                    Err(e) => outcome.failures.push(ItemFailure {
                        index,
                        category: self.classifier.classify(&e),
                        message: message_of(&e),
                        provenance: e.provenance().cloned(),
                    }),
                }
                outcome.processed += 1;
            }

            if outcome.failure_ratio() > max_failure_ratio {
                warn!(
                    "Failure ratio {:.3} exceeds {:.3} after {} item(s), skipping {} remaining",
                    outcome.failure_ratio(),
                    max_failure_ratio,
                    outcome.processed,
                    items.len() - outcome.processed
                );
                outcome.aborted = true;
                break;
            }
        }

        outcome
    }
}

fn message_of(err: &MigrateError) -> String {
    match err {
        MigrateError::Recoverable { message, .. } | MigrateError::Fatal { message, .. } => {
            message.clone()
        }
        MigrateError::Decode { message, .. } => message.clone(),
        MigrateError::Processing(message) => message.clone(),
        other => other.to_string(),
    }
}

fn into_fatal(err: MigrateError, category: ErrorCategory) -> MigrateError {
    match err {
        MigrateError::Fatal { .. } => err,
        other => MigrateError::Fatal {
            category,
            message: message_of(&other),
            provenance: other.provenance().cloned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(strategy: BackoffStrategy) -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            strategy,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter: false,
            max_failure_ratio: 0.1,
            sub_batch_size: 2,
        }
    }

    #[test]
    fn test_backoff_strategies() {
        let linear = RetryPolicy::from_config(&config(BackoffStrategy::Linear));
        assert_eq!(linear.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(linear.base_delay_for(3), Duration::from_millis(300));

        let exp = RetryPolicy::from_config(&config(BackoffStrategy::Exponential));
        assert_eq!(exp.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(exp.base_delay_for(2), Duration::from_millis(200));
        assert_eq!(exp.base_delay_for(3), Duration::from_millis(400));
        assert_eq!(exp.base_delay_for(10), Duration::from_millis(1000));

        let fixed = RetryPolicy::from_config(&config(BackoffStrategy::Fixed));
        assert_eq!(fixed.base_delay_for(5), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_bounded() {
        let mut cfg = config(BackoffStrategy::Fixed);
        cfg.jitter = true;
        let policy = RetryPolicy::from_config(&cfg);
        for _ in 0..50 {
            let d = policy.delay_for(1);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(110));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_recoverable_failures_then_success() {
        let controller = RetryController::new(&config(BackoffStrategy::Exponential));
        let calls = AtomicU32::new(0);

        let result = controller
            .execute_with_retry(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(MigrateError::processing("connection timed out"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, 42);
        assert_eq!(result.attempts, 3);
        assert_eq!(
            result.delays,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );

        let stats = controller.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.recovered, 1);
        assert_eq!(stats.by_category[&ErrorCategory::ConnectionTimeout], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_not_retried() {
        let controller = RetryController::new(&config(BackoffStrategy::Fixed));
        let calls = AtomicU32::new(0);

        let err = controller
            .execute_with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(MigrateError::processing("permission denied")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.category(), Some(ErrorCategory::PermissionDenied));
        assert!(matches!(err, MigrateError::Fatal { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_exhausted() {
        let controller = RetryController::new(&config(BackoffStrategy::Linear));
        let calls = AtomicU32::new(0);

        let err = controller
            .execute_with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(MigrateError::processing("mystery")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            MigrateError::Recoverable {
                category, attempts, ..
            } => {
                assert_eq!(category, ErrorCategory::Unknown);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(controller.stats().exhausted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failures_collected() {
        let controller = RetryController::new(&config(BackoffStrategy::Fixed));
        let items: Vec<u32> = (0..6).collect();

        let outcome = controller
            .process_with_partial_failures(
                &items,
                |n| async move {
                    if n == 3 {
                        Err(MigrateError::processing("malformed value"))
                    } else {
                        Ok(n * 10)
                    }
                },
                0.5,
            )
            .await;

        assert!(!outcome.aborted);
        assert_eq!(outcome.processed, 6);
        assert_eq!(outcome.successes.len(), 5);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].index, 3);
        assert_eq!(outcome.failures[0].category, ErrorCategory::InvalidDataFormat);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failures_trip_breaker() {
        let controller = RetryController::new(&config(BackoffStrategy::Fixed));
        let items: Vec<u32> = (0..10).collect();

        let outcome = controller
            .process_with_partial_failures(
                &items,
                |n| async move {
                    if n < 2 {
                        Err::<u32, _>(MigrateError::processing("invalid data"))
                    } else {
                        Ok(n)
                    }
                },
                0.1,
            )
            .await;

        // First sub-batch of 2 fails entirely.
        assert!(outcome.aborted);
        assert_eq!(outcome.processed, 2);
        assert!(outcome.successes.is_empty());
    }
}
