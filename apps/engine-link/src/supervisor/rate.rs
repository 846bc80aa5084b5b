use std::time::Duration;

const WINDOW: Duration = Duration::from_millis(500);

/// Events-per-second estimate over half-second windows.
///
/// Time is supplied by the caller (the engine reports its own frame and
/// update deltas), so the sample never reads a clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateSample {
    accumulated: Duration,
    count: u32,
    rate: u32,
}

impl RateSample {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one event that took `delta`. Crossing the window boundary
    /// publishes `count * 2` and starts a new window.
    pub fn record(&mut self, delta: Duration) {
        self.count = self.count.saturating_add(1);
        self.accumulated = self.accumulated.saturating_add(delta);
        if self.accumulated >= WINDOW {
            self.rate = self.count.saturating_mul(2);
            self.count = 0;
            self.accumulated = Duration::ZERO;
        }
    }

    /// Last published rate. Zero until the first window completes.
    pub fn per_second(&self) -> u32 {
        self.rate
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_zero_before_first_window() {
        let mut sample = RateSample::new();
        for _ in 0..10 {
            sample.record(Duration::from_millis(10));
        }
        assert_eq!(sample.per_second(), 0);
    }

    #[test]
    fn fifteen_events_in_a_window_report_thirty() {
        let mut sample = RateSample::new();
        for _ in 0..15 {
            sample.record(Duration::from_micros(33_334));
        }
        assert_eq!(sample.per_second(), 30);
    }

    #[test]
    fn window_restarts_after_rollover() {
        let mut sample = RateSample::new();
        for _ in 0..15 {
            sample.record(Duration::from_micros(33_334));
        }
        for _ in 0..5 {
            sample.record(Duration::from_millis(100));
        }
        assert_eq!(sample.per_second(), 10);
    }

    #[test]
    fn reset_clears_published_rate() {
        let mut sample = RateSample::new();
        sample.record(Duration::from_secs(1));
        assert_eq!(sample.per_second(), 2);
        sample.reset();
        assert_eq!(sample, RateSample::new());
    }
}
