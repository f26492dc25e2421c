//! Exponential backoff schedule for payout retries.
//!
//! The schedule comes from `backon`; the orchestrator only reads the delay for a given attempt
//! and persists `next_attempt_at`, so retries survive restarts instead of sleeping in-task.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

/// Attempts past this index all sit at the cap.
const MAX_SCHEDULED_ATTEMPT: u32 = 64;

/// Delay schedule between transient payout failures.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry (before jitter).
    pub base_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f32,
    /// Maximum delay (before jitter).
    pub max_delay: Duration,
    /// Adds a random extra of up to one full delay on top of the scheduled value.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn builder(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_factor(self.multiplier.max(1.0))
            .with_max_delay(self.max_delay)
            .with_max_times(MAX_SCHEDULED_ATTEMPT as usize + 1);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Delay before retry number `attempt` (0-indexed): `base * multiplier^attempt`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.builder()
            .build()
            .nth(attempt.min(MAX_SCHEDULED_ATTEMPT) as usize)
            .unwrap_or(self.max_delay)
    }
}
