// src/backoff.rs
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategies for job retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    Fixed { secs: u64 },
    Linear { increment_secs: u64, cap_secs: u64 },
    Exponential { base_secs: u64, cap_secs: u64 },
}

impl BackoffStrategy {
    /// Deterministic delay before the next attempt. `attempt` is the number
    /// of attempts already made (so the first retry passes 1). Non-decreasing
    /// in `attempt` up to the configured cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { secs } => Duration::from_secs(*secs),
            BackoffStrategy::Linear {
                increment_secs,
                cap_secs,
            } => {
                let delay = increment_secs.saturating_mul(attempt as u64).min(*cap_secs);
                Duration::from_secs(delay)
            }
            BackoffStrategy::Exponential { base_secs, cap_secs } => {
                let delay = base_secs
                    .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
                    .min(*cap_secs);
                Duration::from_secs(delay)
            }
        }
    }

    /// Delay with up to `jitter_secs` of uniform random noise added, so
    /// retries of jobs that failed together do not all wake together.
    pub fn delay_with_jitter(&self, attempt: u32, jitter_secs: u64) -> Duration {
        let base = self.delay(attempt);
        if jitter_secs == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_secs * 1000);
        base + Duration::from_millis(jitter)
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base_secs: 2,
            cap_secs: 300,
        }
    }
}

/// Convenience type alias
pub type Backoff = BackoffStrategy;
