use std::time::{Duration, Instant};

/// Polling interval of one live metrics loop.
///
/// A success resets the interval to `nominal`. A failure keeps the current
/// interval unless nothing succeeded for longer than `tolerance`, in which case
/// the loop falls back to `fallback`. One dropped request therefore does not
/// slow the loop down, a real outage does.
#[derive(Clone, Debug)]
pub(crate) struct PollingState {
    nominal: Duration,
    fallback: Duration,
    tolerance: Duration,
    current: Duration,
    last_success: Option<Instant>,
}

impl PollingState {
    /// `last_success` of `None` means the first failure already escalates.
    pub(crate) fn new(
        nominal: Duration,
        fallback: Duration,
        tolerance: Duration,
        last_success: Option<Instant>,
    ) -> Self {
        PollingState {
            nominal,
            fallback,
            tolerance,
            current: nominal,
            last_success,
        }
    }

    pub(crate) fn interval(&self) -> Duration {
        self.current
    }

    pub(crate) fn on_success(&mut self, now: Instant) {
        self.current = self.nominal;
        self.last_success = Some(now);
    }

    pub(crate) fn on_failure(&mut self, now: Instant) {
        let overdue = match self.last_success {
            Some(last) => now.saturating_duration_since(last) >= self.tolerance,
            None => true,
        };
        if overdue {
            self.current = self.fallback;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOMINAL: Duration = Duration::from_secs(1);
    const FALLBACK: Duration = Duration::from_secs(60);
    const TOLERANCE: Duration = Duration::from_secs(20);

    #[test]
    fn failure_within_tolerance_keeps_interval() {
        let start = Instant::now();
        let mut state = PollingState::new(NOMINAL, FALLBACK, TOLERANCE, Some(start));
        state.on_failure(start + Duration::from_secs(5));
        state.on_failure(start + Duration::from_secs(19));
        assert_eq!(state.interval(), NOMINAL);
    }

    #[test]
    fn failures_past_tolerance_fall_back_and_success_resets() {
        let start = Instant::now();
        let mut state = PollingState::new(NOMINAL, FALLBACK, TOLERANCE, Some(start));
        state.on_failure(start + Duration::from_secs(10));
        state.on_failure(start + Duration::from_secs(21));
        assert_eq!(state.interval(), FALLBACK);
        state.on_failure(start + Duration::from_secs(81));
        assert_eq!(state.interval(), FALLBACK);

        state.on_success(start + Duration::from_secs(141));
        assert_eq!(state.interval(), NOMINAL);

        // tolerance is measured from the latest success
        state.on_failure(start + Duration::from_secs(150));
        assert_eq!(state.interval(), NOMINAL);
    }

    #[test]
    fn no_prior_success_escalates_immediately() {
        let mut state = PollingState::new(NOMINAL, FALLBACK, TOLERANCE, None);
        state.on_failure(Instant::now());
        assert_eq!(state.interval(), FALLBACK);
    }
}
