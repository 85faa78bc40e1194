//! Exponential reconnect backoff.
//!
//! Successive delays follow `min(first * factor^k, max)`. The delay resets
//! to `first` once a connection reaches the active state, so a later
//! outage starts over from the short end of the schedule.

use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    first: Duration,
    max: Duration,
    factor: f64,
    current: Duration,
}

impl Backoff {
    /// Construction clamps degenerate inputs: the first delay is at least
    /// one millisecond, the maximum at least the first, the factor at
    /// least one.
    pub(crate) fn new(first: Duration, max: Duration, factor: f64) -> Self {
        let first = first.max(Duration::from_millis(1));
        let max = max.max(first);
        let factor = if factor < 1.0 { 1.0 } else { factor };
        Self {
            first,
            max,
            factor,
            current: first,
        }
    }

    /// The delay to sleep before the next attempt; advances the schedule.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = Duration::from_secs_f64(self.current.as_secs_f64() * self.factor);
        self.current = grown.min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.first;
    }
}
