//! Per-actor mutation rate limiting.
//!
//! Counters live in fixed minute and hour buckets keyed by
//! `(actor, operation, window, bucket)`. A call is admitted only if both
//! windows have budget left; admission counts against both. Rejections carry
//! the time until the overflowing bucket rolls over.
//!
//! Buckets more than two periods old are evicted, opportunistically during
//! [`check_limit`](MutationRateLimiter::check_limit) and on a timer via
//! [`spawn_eviction`](MutationRateLimiter::spawn_eviction).

use crate::metrics::RateLimitMetrics;
use chrono::{DateTime, Utc};
use exception_collector_core::environment::{Clock, SystemClock};
use exception_collector_core::error::{CollectorError, RateWindow};
use exception_collector_core::lifecycle::MutationKind;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Rate limiter ceilings.
///
/// # Default Values
///
/// - `per_minute`: 30
/// - `per_hour`: 500
/// - `eviction_interval`: 60 seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Calls per actor and operation per minute.
    pub per_minute: u32,
    /// Calls per actor and operation per hour.
    pub per_hour: u32,
    /// How often stale buckets are swept.
    pub eviction_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 30,
            per_hour: 500,
            eviction_interval: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    const fn limit(&self, window: RateWindow) -> u32 {
        match window {
            RateWindow::Minute => self.per_minute,
            RateWindow::Hour => self.per_hour,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    actor: String,
    operation: MutationKind,
    window: RateWindow,
    bucket: i64,
}

#[derive(Debug)]
struct State {
    counters: HashMap<WindowKey, u32>,
    last_eviction: DateTime<Utc>,
}

/// Usage snapshot for one actor and operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    /// Calls admitted in the current minute bucket.
    pub minute_count: u32,
    /// Minute ceiling.
    pub minute_limit: u32,
    /// Calls admitted in the current hour bucket.
    pub hour_count: u32,
    /// Hour ceiling.
    pub hour_limit: u32,
}

impl RateLimitStatus {
    /// Calls still admitted before a rejection.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.minute_limit
            .saturating_sub(self.minute_count)
            .min(self.hour_limit.saturating_sub(self.hour_count))
    }
}

/// Gates externally triggered mutations per actor.
///
/// # Example
///
/// ```rust
/// use exception_collector_runtime::rate_limiter::MutationRateLimiter;
/// use exception_collector_core::lifecycle::MutationKind;
///
/// let limiter = MutationRateLimiter::default();
/// assert!(limiter.check_limit("alice", MutationKind::Acknowledge).is_ok());
/// assert_eq!(limiter.status("alice", MutationKind::Acknowledge).minute_count, 1);
/// ```
pub struct MutationRateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl MutationRateLimiter {
    /// Create a limiter reading time from `clock`.
    #[must_use]
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            state: Mutex::new(State {
                counters: HashMap::new(),
                last_eviction: now,
            }),
        }
    }

    /// Configured ceilings.
    #[must_use]
    pub const fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Admit or reject one call by `actor`.
    ///
    /// # Errors
    ///
    /// [`CollectorError::RateLimitExceeded`] when either window is exhausted.
    /// Rejected calls do not consume budget.
    pub fn check_limit(&self, actor: &str, operation: MutationKind) -> Result<(), CollectorError> {
        let now = self.clock.now();
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if elapsed(state.last_eviction, now) >= self.config.eviction_interval {
            Self::evict(&mut state, now);
        }

        for window in [RateWindow::Minute, RateWindow::Hour] {
            let limit = self.config.limit(window);
            let window_key = key(actor, operation, window, now);
            let count = state.counters.get(&window_key).copied().unwrap_or(0);
            if count >= limit {
                let retry_after = until_next_bucket(window, now);
                RateLimitMetrics::record_rejection(operation);
                tracing::warn!(
                    actor,
                    %operation,
                    %window,
                    limit,
                    retry_after_ms = retry_after.as_millis(),
                    "Rate limit exceeded"
                );
                return Err(CollectorError::RateLimitExceeded {
                    actor: actor.to_string(),
                    operation,
                    window,
                    limit,
                    retry_after,
                });
            }
        }

        for window in [RateWindow::Minute, RateWindow::Hour] {
            *state
                .counters
                .entry(key(actor, operation, window, now))
                .or_insert(0) += 1;
        }
        Ok(())
    }

    /// Current usage for `actor` and `operation`.
    #[must_use]
    pub fn status(&self, actor: &str, operation: MutationKind) -> RateLimitStatus {
        let now = self.clock.now();
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let count = |window| {
            state
                .counters
                .get(&key(actor, operation, window, now))
                .copied()
                .unwrap_or(0)
        };
        RateLimitStatus {
            minute_count: count(RateWindow::Minute),
            minute_limit: self.config.per_minute,
            hour_count: count(RateWindow::Hour),
            hour_limit: self.config.per_hour,
        }
    }

    /// Drop buckets more than two periods old; returns how many went.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Self::evict(&mut state, now)
    }

    /// Forget every counter.
    pub fn clear(&self) {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .counters
            .clear();
    }

    /// Live bucket count.
    #[must_use]
    pub fn tracked_windows(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .counters
            .len()
    }

    /// Sweep stale buckets every `eviction_interval` until the limiter is
    /// dropped.
    pub fn spawn_eviction(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.eviction_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let evicted = limiter.evict_expired();
                if evicted > 0 {
                    tracing::debug!(evicted, "Evicted stale rate limit windows");
                }
            }
        })
    }

    fn evict(state: &mut State, now: DateTime<Utc>) -> usize {
        let before = state.counters.len();
        state
            .counters
            .retain(|key, _| bucket(key.window, now) - key.bucket < 2);
        state.last_eviction = now;
        before - state.counters.len()
    }
}

impl Default for MutationRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default(), Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for MutationRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationRateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[allow(clippy::cast_possible_wrap)]
const fn window_millis(window: RateWindow) -> i64 {
    window.duration().as_millis() as i64
}

fn bucket(window: RateWindow, now: DateTime<Utc>) -> i64 {
    now.timestamp_millis().div_euclid(window_millis(window))
}

fn key(actor: &str, operation: MutationKind, window: RateWindow, now: DateTime<Utc>) -> WindowKey {
    WindowKey {
        actor: actor.to_string(),
        operation,
        window,
        bucket: bucket(window, now),
    }
}

fn until_next_bucket(window: RateWindow, now: DateTime<Utc>) -> Duration {
    let size = window_millis(window);
    let next_start = (bucket(window, now) + 1) * size;
    let remaining = next_start - now.timestamp_millis();
    Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}
