use std::time::Duration;

use ::backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

/// Parameters of the exponential backoff applied to transient API errors.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Each delay is drawn from `delay * (1 ± randomization_factor)`.
    pub randomization_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            randomization_factor: 0.5,
        }
    }
}

impl BackoffPolicy {
    /// A backoff that never gives up; watchers retry until they are cancelled.
    pub fn start(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial.min(self.max))
            .with_max_interval(self.max)
            .with_multiplier(self.multiplier.max(1.0))
            .with_randomization_factor(self.randomization_factor.clamp(0.0, 1.0))
            .with_max_elapsed_time(None)
            .build()
    }
}
