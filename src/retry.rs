//! Retry and timeout helpers.
//!
//! `with_timeout` bounds websocket connects and frame reads. `retry_async`
//! drives listen-key providers, which usually hit a rate-limited REST
//! endpoint and benefit from a couple of spaced-out attempts.

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

use tracing::debug;

/// Attempt budget and backoff for a retried async operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first one.
    pub max_attempts: usize,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Cap for the doubling backoff.
    pub max_backoff: Duration,
    /// Maximum random delay added on top of the backoff.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Policy used for listen-key requests.
    pub fn listen_key() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(2),
            jitter: Duration::from_millis(100),
        }
    }

    /// Policy that runs the operation exactly once, for providers that
    /// retry on their own.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Delay applied after failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31) as u32;
        let backoff = self
            .initial_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff);
        backoff + random_jitter(self.jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::listen_key()
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects an error, or the
/// attempt budget is spent. The last error is returned.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if attempt >= max_attempts || !should_retry(&error) {
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            event = "retry_attempt_failed",
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn random_jitter(max_jitter: Duration) -> Duration {
    let limit = max_jitter.as_millis().min(u64::MAX as u128) as u64;
    if limit == 0 {
        return Duration::ZERO;
    }
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(limit);
    Duration::from_millis(hasher.finish() % (limit + 1))
}
