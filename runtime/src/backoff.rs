//! Bounded exponential backoff for redelivering inbound messages.
//!
//! A message whose processing fails with a non-terminal error is redelivered
//! up to `max_attempts` times. Redelivery `n` (1-based) waits
//! `base_delay × multiplier^(n−1)`, capped at `max_delay`. With the defaults
//! the waits are 1s, 2s, 4s, 8s, 16s.
//!
//! # Example
//!
//! ```rust
//! use exception_collector_runtime::backoff::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::default();
//! let waits: Vec<_> = policy.schedule().map(|d| d.as_secs()).collect();
//! assert_eq!(waits, vec![1, 2, 4, 8, 16]);
//! ```

use std::time::Duration;
use tokio::time::sleep;

/// Redelivery policy: `{max_attempts, base_delay, multiplier, max_delay}`.
///
/// # Default Values
///
/// - `max_attempts`: 5
/// - `base_delay`: 1 second
/// - `multiplier`: 2.0
/// - `max_delay`: 30 seconds
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Redeliveries after the first failed attempt.
    pub max_attempts: u32,
    /// Wait before the first redelivery.
    pub base_delay: Duration,
    /// Growth factor between consecutive waits.
    pub multiplier: f64,
    /// Cap on any single wait.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Create a new policy builder starting from the defaults.
    #[must_use]
    pub fn builder() -> BackoffPolicyBuilder {
        BackoffPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Wait before redelivery `attempt` (1-based).
    ///
    /// Attempt 0 has no wait. Overflowing or non-finite products saturate at
    /// `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Every wait this policy will ever impose, in order.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(|attempt| self.delay_for_attempt(attempt))
    }

    /// Upper bound on total waiting before a message is dead-lettered.
    #[must_use]
    pub fn total_delay(&self) -> Duration {
        self.schedule().sum()
    }
}

/// Builder for [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct BackoffPolicyBuilder {
    policy: BackoffPolicy,
}

impl BackoffPolicyBuilder {
    /// Set the number of redeliveries.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts;
        self
    }

    /// Set the first wait.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Set the cap on a single wait.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Build the [`BackoffPolicy`].
    #[must_use]
    pub fn build(self) -> BackoffPolicy {
        self.policy
    }
}

/// Retry an async operation under `policy`.
///
/// Runs `operation` once, then up to `max_attempts` more times with the
/// policy's waits in between. Returns the last error when all runs fail.
///
/// # Errors
///
/// Returns the error of the final run.
///
/// # Example
///
/// ```rust
/// use exception_collector_runtime::backoff::{BackoffPolicy, retry_with_backoff};
///
/// # async fn example() -> Result<(), String> {
/// let value = retry_with_backoff(&BackoffPolicy::default(), || async {
///     Ok::<_, String>(42)
/// }).await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &BackoffPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt >= policy.max_attempts => {
                tracing::error!(attempt, error = %err, "Operation failed after max retries");
                return Err(err);
            }
            Err(err) => {
                attempt += 1;
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn default_schedule_doubles_from_one_second() {
        let policy = BackoffPolicy::default();
        let waits: Vec<_> = policy.schedule().collect();
        assert_eq!(
            waits,
            [1, 2, 4, 8, 16].map(Duration::from_secs).to_vec()
        );
        assert_eq!(policy.total_delay(), Duration::from_secs(31));
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn waits_are_capped() {
        let policy = BackoffPolicy::builder().max_attempts(8).build();
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(30));

        let wild = BackoffPolicy::builder().multiplier(1e300).build();
        assert_eq!(wild.delay_for_attempt(5), wild.max_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_gives_up_after_policy() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let result = retry_with_backoff(&BackoffPolicy::default(), || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("down")
            }
        })
        .await;

        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(started.elapsed(), Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_backoff_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry_with_backoff(&BackoffPolicy::default(), || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("flaky")
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    proptest! {
        #[test]
        fn waits_never_exceed_cap_and_never_shrink(
            base_ms in 1u64..5_000,
            multiplier in 1.0f64..10.0,
            max_s in 1u64..120,
        ) {
            let policy = BackoffPolicy::builder()
                .base_delay(Duration::from_millis(base_ms))
                .multiplier(multiplier)
                .max_delay(Duration::from_secs(max_s))
                .max_attempts(10)
                .build();
            let waits: Vec<_> = policy.schedule().collect();
            for pair in waits.windows(2) {
                prop_assert!(pair[0] <= pair[1]);
            }
            prop_assert!(waits.iter().all(|w| *w <= policy.max_delay));
        }
    }
}
