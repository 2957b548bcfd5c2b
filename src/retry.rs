//! Backoff, retry and reconnect policies.
//!
//! `RetryPolicy` bounds retries of a single request (session acquisition),
//! while `ReconnectPolicy` governs how the stream worker re-establishes a
//! dropped socket. Both share the same exponential [`Backoff`] with
//! lightweight jitter.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

/// Exponential backoff with a cap and additive jitter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Delay used before the first retry.
    pub initial: Duration,
    /// Upper bound for exponential delay growth.
    pub max: Duration,
    /// Maximum random jitter added to each delay.
    pub jitter: Duration,
}

impl Backoff {
    /// Computes the delay to apply before the given retry attempt.
    ///
    /// `attempt` is 1-based; attempt `n` waits `initial * 2^(n-1)`, capped at
    /// `max`, plus jitter.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let mut delay = self.initial;
        for _ in 1..attempt {
            if delay >= self.max {
                break;
            }
            delay = std::cmp::min(delay.saturating_mul(2), self.max);
        }
        delay + jitter_duration(self.jitter, attempt)
    }
}

/// Policy controlling retries of a single request.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts including the first attempt.
    pub max_attempts: usize,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Short retries for the one-shot session acquisition request.
    pub fn acquisition() -> Self {
        Self {
            max_attempts: 2,
            backoff: Backoff {
                initial: Duration::from_millis(50),
                max: Duration::from_millis(200),
                jitter: Duration::from_millis(25),
            },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::acquisition()
    }
}

/// Policy controlling automatic reconnection after the socket closes.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    /// Maximum consecutive failed attempts before giving up.
    ///
    /// `None` retries forever. The counter resets whenever a socket opens.
    pub max_attempts: Option<usize>,
    pub backoff: Backoff,
}

impl ReconnectPolicy {
    /// Retries forever, starting at 100ms and capping at 5s.
    pub fn unlimited() -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff {
                initial: Duration::from_millis(100),
                max: Duration::from_secs(5),
                jitter: Duration::from_millis(100),
            },
        }
    }

    /// Same backoff as [`ReconnectPolicy::unlimited`] but gives up after
    /// `max_attempts` consecutive failures.
    pub fn bounded(max_attempts: usize) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::unlimited()
        }
    }

    /// Returns whether the 1-based `attempt` may still be made.
    pub fn allows(&self, attempt: usize) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }

    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Executes an async operation with retry behavior controlled by `policy`.
///
/// `op` receives the 1-based attempt number and must return a future that
/// resolves to the operation result. `should_retry` determines whether each
/// error is retryable.
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
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.backoff.delay_for_attempt(attempt);
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
    }
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ ((attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}
