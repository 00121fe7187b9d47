use std::time::Duration;

/// Feedback the Controller reports after each capture-compare cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerFeedback {
    /// The new frame was `Identical` to the canvas tail.
    Idle,
    /// The new frame was accepted as a `Scrolled` append.
    Motion,
    /// Bypass the pending delay and tick again immediately.
    Force,
}

/// Single-input, single-output timing policy.
///
/// Deliberately synchronous and free of any `tokio` dependency: the
/// Controller owns the actual sleeping (mirroring how `Scheduler` in this
/// codebase is a pure elapsed-time calculator while `CaptureEngine` does the
/// waiting), which keeps the backoff policy itself trivial to unit test.
#[derive(Debug, Clone)]
pub struct CaptureScheduler {
    base_interval: Duration,
    max_interval: Duration,
    current_interval: Duration,
    force_pending: bool,
}

impl CaptureScheduler {
    pub fn new(capture_interval_ms: u64, identical_backoff_ms: u64) -> Self {
        let base_interval = Duration::from_millis(capture_interval_ms.max(1));
        let max_interval =
            Duration::from_millis(identical_backoff_ms.saturating_mul(4).max(1)).max(base_interval);
        Self {
            base_interval,
            max_interval,
            current_interval: base_interval,
            force_pending: false,
        }
    }

    /// The delay to wait before the next capture. A pending `Force` feedback
    /// collapses this to zero exactly once.
    pub fn next_delay(&mut self) -> Duration {
        if self.force_pending {
            self.force_pending = false;
            return Duration::ZERO;
        }
        self.current_interval
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn on_feedback(&mut self, feedback: SchedulerFeedback) {
        match feedback {
            SchedulerFeedback::Idle => {
                let scaled = self.current_interval.mul_f64(1.5);
                self.current_interval = scaled.min(self.max_interval);
            }
            SchedulerFeedback::Motion => {
                self.current_interval = self.base_interval;
            }
            SchedulerFeedback::Force => {
                self.force_pending = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_base_interval() {
        let mut scheduler = CaptureScheduler::new(150, 400);
        assert_eq!(scheduler.next_delay(), Duration::from_millis(150));
    }

    #[test]
    fn idle_feedback_backs_off_by_one_and_a_half_times() {
        let mut scheduler = CaptureScheduler::new(100, 400);
        scheduler.on_feedback(SchedulerFeedback::Idle);
        assert_eq!(scheduler.current_interval(), Duration::from_millis(150));
        scheduler.on_feedback(SchedulerFeedback::Idle);
        assert_eq!(scheduler.current_interval(), Duration::from_millis(225));
    }

    #[test]
    fn idle_backoff_is_capped_at_four_times_identical_backoff() {
        let mut scheduler = CaptureScheduler::new(100, 200);
        for _ in 0..20 {
            scheduler.on_feedback(SchedulerFeedback::Idle);
        }
        assert_eq!(scheduler.current_interval(), Duration::from_millis(800));
    }

    #[test]
    fn motion_feedback_resets_to_base_interval() {
        let mut scheduler = CaptureScheduler::new(100, 200);
        for _ in 0..5 {
            scheduler.on_feedback(SchedulerFeedback::Idle);
        }
        scheduler.on_feedback(SchedulerFeedback::Motion);
        assert_eq!(scheduler.current_interval(), Duration::from_millis(100));
    }

    #[test]
    fn force_feedback_makes_the_next_delay_zero_exactly_once() {
        let mut scheduler = CaptureScheduler::new(150, 400);
        scheduler.on_feedback(SchedulerFeedback::Force);
        assert_eq!(scheduler.next_delay(), Duration::ZERO);
        assert_eq!(scheduler.next_delay(), Duration::from_millis(150));
    }

    #[test]
    fn base_interval_never_exceeds_backoff_cap() {
        let scheduler = CaptureScheduler::new(500, 100);
        assert!(scheduler.current_interval() <= Duration::from_millis(500));
    }
}
