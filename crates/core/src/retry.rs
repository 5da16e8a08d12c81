// Retry policy and backoff
//
// One backoff algorithm shared by the task queue and the workflow engine.
// Attempt numbers passed to `delay_for_attempt` are 0-based: attempt 0 is the
// delay before the first retry.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::serde_util::duration_millis;

/// Delay growth between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    /// Always `initial_delay`
    Fixed,
    /// `initial_delay + initial_delay * n`, capped at `max_delay`
    Linear,
    /// `initial_delay * multiplier^n`, capped at `max_delay`
    #[default]
    Exponential,
}

/// Retry configuration for queue jobs and workflow steps
///
/// # Example
///
/// ```
/// use fleetflow_core::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_delay(Duration::from_secs(1))
///     .with_max_delay(Duration::from_secs(60));
///
/// assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries
    pub max_attempts: u32,

    #[serde(default, alias = "backoff_type")]
    pub backoff: BackoffType,

    #[serde(with = "duration_millis", alias = "initial_delay_ms")]
    pub initial_delay: Duration,

    #[serde(
        default = "default_max_delay",
        with = "duration_millis",
        alias = "max_delay_ms"
    )]
    pub max_delay: Duration,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter factor (0.0-1.0); 0.1 means +/-10%
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff: 3 attempts, 1s initial, 60s cap, 2x multiplier, no jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffType::Exponential,
            initial_delay: Duration::from_secs(1),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: 0.0,
        }
    }

    /// Same delay before every retry
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: BackoffType::Fixed,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn linear(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: BackoffType::Linear,
            initial_delay,
            max_delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            backoff: BackoffType::Fixed,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffType) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Nanosecond arithmetic keeps millisecond policies exact
        let initial = self.initial_delay.as_nanos() as f64;
        let max = self.max_delay.as_nanos() as f64;

        let base = match self.backoff {
            BackoffType::Fixed => initial,
            BackoffType::Linear => (initial + initial * attempt as f64).min(max),
            BackoffType::Exponential => {
                let exponent = attempt.min(i32::MAX as u32) as i32;
                (initial * self.multiplier.powi(exponent)).min(max)
            }
        };

        let jittered = if self.jitter > 0.0 && base > 0.0 {
            let mut rng = rand::thread_rng();
            let range = base * self.jitter;
            (base + rng.gen_range(-range..range)).max(0.0)
        } else {
            base
        };

        if jittered.is_finite() && jittered < u64::MAX as f64 {
            Duration::from_nanos(jittered.round() as u64)
        } else {
            self.max_delay
        }
    }

    /// True while `retries_so_far` is below the retry budget
    pub fn has_attempts_remaining(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_attempts
    }
}
