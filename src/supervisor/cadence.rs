use std::time::Duration;

/// Spacing of proactive contract checks over a session's lifetime.
///
/// Nothing is checked before `initial_delay`; after that the interval shrinks
/// linearly from `long_interval` to `short_interval` as elapsed time
/// approaches the session timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveCadence {
    pub initial_delay: Duration,
    pub long_interval: Duration,
    pub short_interval: Duration,
}

impl AdaptiveCadence {
    /// Interval to wait after a check made at `elapsed`; `None` before the
    /// initial delay.
    pub fn interval_at(&self, elapsed: Duration, timeout: Duration) -> Option<Duration> {
        if elapsed < self.initial_delay {
            return None;
        }
        let span = timeout.saturating_sub(self.initial_delay).as_secs_f64();
        let progress = if span > 0.0 {
            ((elapsed - self.initial_delay).as_secs_f64() / span).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let long = self.long_interval.as_secs_f64();
        let short = self.short_interval.as_secs_f64().min(long);
        Some(Duration::from_secs_f64(long - (long - short) * progress))
    }

    /// Elapsed time at which the first check is due.
    pub const fn first_check(&self) -> Duration {
        self.initial_delay
    }
}
