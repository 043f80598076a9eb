//! Retry policies for the retryable failure family.
//!
//! Policies are stateless and shared across calls; all mutable bookkeeping
//! lives in a per-call [`RetryState`] owned by the invocation loop. Body
//! translation failures never reach a policy.

use std::time::{Duration, Instant, SystemTime};

use rand::Rng;

use crate::error::InvokeError;

/// What the invocation loop should do after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given duration, then re-execute the attempt.
    ProceedAfter(Duration),
    /// Give up and surface the failure to the caller.
    Propagate,
}

/// Per-call retry bookkeeping.
#[derive(Debug, Clone)]
pub struct RetryState {
    attempt: u32,
    started: Instant,
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryState {
    #[must_use]
    pub fn new() -> Self {
        RetryState {
            attempt: 1,
            started: Instant::now(),
        }
    }

    /// The attempt that just failed, starting at 1.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Wall time since the first attempt began.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_retry(&mut self) {
        self.attempt += 1;
    }
}

/// Decides whether a retryable failure is worth another attempt.
pub trait RetryPolicy: Send + Sync {
    fn decide(&self, state: &mut RetryState, failure: &InvokeError) -> RetryDecision;
}

/// Exponential backoff parameters with bounded jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on any single delay, jitter and server hints included.
    pub max: Duration,
    /// Growth factor per attempt. Values below 1.0 are treated as 2.0.
    pub multiplier: f64,
    /// Relative jitter in `[0.0, 1.0]`; the delay is scaled by a random
    /// factor in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 1.5,
            jitter: 0.1,
        }
    }
}

impl ExponentialBackoff {
    /// Delay before retry number `retry` (1-based), jitter applied.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            2.0
        };
        let exponent = retry.saturating_sub(1).min(63);
        let raw = self.initial.as_secs_f64() * multiplier.powi(exponent as i32);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + rand::rng().random_range(-jitter..=jitter)
        } else {
            1.0
        };
        // Cap last so jitter cannot push a delay past `max`.
        Duration::from_secs_f64((raw * factor).clamp(0.0, self.max.as_secs_f64()))
    }
}

/// Default policy: bounded attempts with exponential backoff, honoring
/// `Retry-After` hints.
///
/// A server-supplied resume instant takes precedence over the computed
/// backoff; it is clamped to the backoff maximum, and an instant already in
/// the past retries immediately.
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    max_attempts: u32,
    max_elapsed: Option<Duration>,
    backoff: ExponentialBackoff,
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        DefaultRetryPolicy {
            max_attempts: 5,
            max_elapsed: None,
            backoff: ExponentialBackoff::default(),
        }
    }
}

impl DefaultRetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        DefaultRetryPolicy {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Caps the total wall time spent across attempts and sleeps.
    #[must_use]
    pub fn max_elapsed(mut self, limit: Duration) -> Self {
        self.max_elapsed = Some(limit);
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn delay_after(&self, state: &RetryState, failure: &InvokeError) -> Duration {
        if let Some(resume_at) = failure.retry_after() {
            let hint = resume_at
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO);
            return hint.min(self.backoff.max);
        }
        self.backoff.delay_for(state.attempt())
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn decide(&self, state: &mut RetryState, failure: &InvokeError) -> RetryDecision {
        if state.attempt() >= self.max_attempts {
            return RetryDecision::Propagate;
        }
        if let Some(limit) = self.max_elapsed {
            if state.elapsed() >= limit {
                return RetryDecision::Propagate;
            }
        }
        let delay = self.delay_after(state, failure);
        state.record_retry();
        RetryDecision::ProceedAfter(delay)
    }
}

/// Policy that never retries; every failure propagates on first occurrence.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl RetryPolicy for NeverRetry {
    fn decide(&self, _state: &mut RetryState, _failure: &InvokeError) -> RetryDecision {
        RetryDecision::Propagate
    }
}
