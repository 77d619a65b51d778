use std::time::Duration;

/// Exponential restart backoff for a single service.
///
/// The first restart waits `base`, and each consecutive failure doubles the delay up to `max`. Once a service has
/// stayed healthy for at least `reset_after`, its failure count starts over.
#[derive(Clone, Debug)]
pub struct RestartBackoff {
    base: Duration,
    max: Duration,
    reset_after: Duration,
    failures: u32,
}

impl RestartBackoff {
    pub fn new(base: Duration, max: Duration, reset_after: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            reset_after,
            failures: 0,
        }
    }

    /// Number of consecutive failures counted so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Records a failure and returns how long to wait before the next start.
    ///
    /// `healthy_for` is how long the failed instance had been continuously healthy, if it ever was.
    pub fn next_delay(&mut self, healthy_for: Option<Duration>) -> Duration {
        if healthy_for.is_some_and(|d| d >= self.reset_after) {
            self.failures = 0;
        }

        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(self.failures))
            .clamp(self.base, self.max);
        self.failures = self.failures.saturating_add(1);
        delay
    }
}
