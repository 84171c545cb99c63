//! # Backoff
//!
//! Two layers of retry:
//! - `retry_with_backoff`: bounded exponential retry with jitter around a
//!   single API operation, for conflicts and transient failures.
//! - `FibonacciBackoff` / `RequeueTracker`: per-resource requeue delays once
//!   the in-line retry budget is spent, so a failing DevServer is revisited
//!   later instead of retried tightly.
//!
//! Requeue sequence with the defaults: 5s, 5s, 10s, 15s, 25s, 40s, 65s, ... capped at 300s.

use crate::error::ControllerError;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, warn};

/// Bounded exponential retry for one operation
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first (minimum 1)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Growth factor between retries
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default delays with a custom attempt budget
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            ..Default::default()
        }
    }

    /// No sleeping between attempts (tests)
    #[cfg(test)]
    pub fn immediate(attempts: u32) -> Self {
        Self {
            max_attempts: attempts.max(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget is spent.
///
/// The closure is called afresh for every attempt, so operations that must
/// re-read state after a conflict do so inside the closure.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, ControllerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControllerError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt >= max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                // Jitter between 0.5x and 1.5x
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered.as_millis(),
                    "Operation failed, retrying"
                );

                if !jittered.is_zero() {
                    tokio::time::sleep(jittered).await;
                }

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Fibonacci backoff calculator
///
/// Each delay is the sum of the previous two, starting from `min` twice and
/// capped at `max`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min: Duration,
    prev: Duration,
    current: Duration,
    max: Duration,
}

impl FibonacciBackoff {
    /// Create a backoff running from `min` up to `max`
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            prev: Duration::ZERO,
            current: min,
            max,
        }
    }

    /// Current delay, advancing the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        let next = self.prev.saturating_add(self.current);
        self.prev = self.current;
        self.current = next.min(self.max);
        result
    }

    /// Back to the start of the sequence
    pub fn reset(&mut self) {
        self.prev = Duration::ZERO;
        self.current = self.min;
    }
}

/// Backoff state for a resource
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

/// Requeue delays per resource key (`namespace/name`)
#[derive(Debug, Clone)]
pub struct RequeueTracker {
    min: Duration,
    max: Duration,
    states: Arc<Mutex<HashMap<String, BackoffState>>>,
}

impl Default for RequeueTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl RequeueTracker {
    /// Tracker whose per-key sequence runs from `min` to `max`
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record a failure for `key` and return (delay before requeue, consecutive failures)
    pub fn record_failure(&self, key: &str) -> (Duration, u32) {
        match self.states.lock() {
            Ok(mut states) => {
                let state = states.entry(key.to_string()).or_insert_with(|| BackoffState {
                    backoff: FibonacciBackoff::new(self.min, self.max),
                    error_count: 0,
                });
                state.error_count += 1;
                (state.backoff.next_backoff(), state.error_count)
            }
            Err(e) => {
                warn!("Failed to lock backoff states: {}, using minimum requeue delay", e);
                (self.min, 0)
            }
        }
    }

    /// Forget failures for `key` after a successful pass
    pub fn reset(&self, key: &str) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(key);
        }
    }

    /// Consecutive failures currently recorded for `key`
    pub fn error_count(&self, key: &str) -> u32 {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(key).map(|s| s.error_count))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fibonacci_backoff_sequence_and_cap() {
        let mut backoff = FibonacciBackoff::new(Duration::from_secs(5), Duration::from_secs(30));
        let seconds: Vec<u64> = (0..8).map(|_| backoff.next_backoff().as_secs()).collect();
        assert_eq!(seconds, vec![5, 5, 10, 15, 25, 30, 30, 30]);
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::new(Duration::from_secs(1), Duration::from_secs(10));
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
    }

    #[test]
    fn test_requeue_tracker_is_per_key() {
        let tracker = RequeueTracker::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(tracker.record_failure("ns/a"), (Duration::from_secs(1), 1));
        assert_eq!(tracker.record_failure("ns/a"), (Duration::from_secs(1), 2));
        assert_eq!(tracker.record_failure("ns/a"), (Duration::from_secs(2), 3));
        assert_eq!(tracker.record_failure("ns/b"), (Duration::from_secs(1), 1));

        tracker.reset("ns/a");
        assert_eq!(tracker.error_count("ns/a"), 0);
        assert_eq!(tracker.error_count("ns/b"), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_conflicts() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&RetryConfig::immediate(5), "replace", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ControllerError::Conflict("stale".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_at_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&RetryConfig::immediate(3), "list", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ControllerError::Transient("503".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(ControllerError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_repeat_terminal_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&RetryConfig::immediate(5), "synthesize", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ControllerError::Validation("no image".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(ControllerError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
