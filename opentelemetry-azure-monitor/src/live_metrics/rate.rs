use super::model::LiveMetric;
use super::source::MetricsSnapshotSource;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const REQUEST_RATE: &str = "\\ApplicationInsights\\Requests/Sec";
const REQUEST_FAILURE_RATE: &str = "\\ApplicationInsights\\Requests Failed/Sec";
const REQUEST_DURATION: &str = "\\ApplicationInsights\\Request Duration";
const DEPENDENCY_RATE: &str = "\\ApplicationInsights\\Dependency Calls/Sec";
const DEPENDENCY_FAILURE_RATE: &str = "\\ApplicationInsights\\Dependency Calls Failed/Sec";
const DEPENDENCY_DURATION: &str = "\\ApplicationInsights\\Dependency Call Duration";

/// Turns a monotonically growing counter into a per-second rate.
#[derive(Debug, Default)]
pub struct RateTracker {
    last: Option<(Instant, u64)>,
    last_rate: f64,
}

impl RateTracker {
    /// New tracker; the first sample always reports a rate of zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rate of `count` since the previous sample.
    ///
    /// If no time elapsed since the previous sample the previous rate is
    /// returned again.
    pub fn rate(&mut self, count: u64, now: Instant) -> f64 {
        let Some((last_time, last_count)) = self.last else {
            self.last = Some((now, count));
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(last_time).as_secs_f64();
        if elapsed > 0.0 {
            self.last_rate = count.saturating_sub(last_count) as f64 / elapsed;
            self.last = Some((now, count));
        }
        self.last_rate
    }
}

#[derive(Debug, Default)]
struct CallCounts {
    total: u64,
    failed: u64,
    duration: Duration,
    calls_rate: RateTracker,
    failed_rate: RateTracker,
    // calls and duration seen at the previous collection
    last_total: u64,
    last_duration: Duration,
}

/// Names of the three metrics a [`CallCounter`] reports.
#[derive(Debug)]
struct CallMetricNames {
    rate: &'static str,
    failure_rate: &'static str,
    duration: &'static str,
}

const REQUEST_METRICS: CallMetricNames = CallMetricNames {
    rate: REQUEST_RATE,
    failure_rate: REQUEST_FAILURE_RATE,
    duration: REQUEST_DURATION,
};

const DEPENDENCY_METRICS: CallMetricNames = CallMetricNames {
    rate: DEPENDENCY_RATE,
    failure_rate: DEPENDENCY_FAILURE_RATE,
    duration: DEPENDENCY_DURATION,
};

/// Counts completed calls and reports their rates and mean duration.
#[derive(Debug, Default)]
struct CallCounter {
    counts: Mutex<CallCounts>,
}

impl CallCounter {
    fn record(&self, duration: Duration, success: bool) {
        let mut counts = self
            .counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counts.total += 1;
        if !success {
            counts.failed += 1;
        }
        counts.duration += duration;
    }

    fn collect_at(&self, names: &CallMetricNames, now: Instant) -> Vec<LiveMetric> {
        let mut counts = self
            .counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let counts = &mut *counts;

        let calls = counts.calls_rate.rate(counts.total, now);
        let failed = counts.failed_rate.rate(counts.failed, now);

        let new_calls = counts.total - counts.last_total;
        let new_duration = counts.duration.saturating_sub(counts.last_duration);
        let mean_ms = if new_calls == 0 {
            0.0
        } else {
            new_duration.as_nanos() as f64 / 1e6 / new_calls as f64
        };
        counts.last_total = counts.total;
        counts.last_duration = counts.duration;

        vec![
            LiveMetric::new(names.rate, calls),
            LiveMetric::new(names.failure_rate, failed),
            LiveMetric::new(names.duration, mean_ms),
        ]
    }
}

/// Request throughput metrics fed by the instrumentation layer.
///
/// Call [`record_request`](Self::record_request) once per completed incoming
/// request; each collection reports the request and failure rates and the
/// mean request duration since the previous collection.
#[derive(Debug, Default)]
pub struct RequestRateCollector {
    counter: CallCounter,
}

impl RequestRateCollector {
    /// An empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed request.
    pub fn record_request(&self, duration: Duration, success: bool) {
        self.counter.record(duration, success);
    }

    fn collect_at(&self, now: Instant) -> Vec<LiveMetric> {
        self.counter.collect_at(&REQUEST_METRICS, now)
    }
}

impl MetricsSnapshotSource for RequestRateCollector {
    fn collect(&self) -> Vec<LiveMetric> {
        self.collect_at(Instant::now())
    }
}

/// Outgoing call metrics, the counterpart of [`RequestRateCollector`] for
/// dependencies such as HTTP calls to other services or database queries.
#[derive(Debug, Default)]
pub struct DependencyRateCollector {
    counter: CallCounter,
}

impl DependencyRateCollector {
    /// An empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed outgoing call.
    pub fn record_dependency(&self, duration: Duration, success: bool) {
        self.counter.record(duration, success);
    }

    fn collect_at(&self, now: Instant) -> Vec<LiveMetric> {
        self.counter.collect_at(&DEPENDENCY_METRICS, now)
    }
}

impl MetricsSnapshotSource for DependencyRateCollector {
    fn collect(&self) -> Vec<LiveMetric> {
        self.collect_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_starts_at_zero_then_follows_counter() {
        let start = Instant::now();
        let mut tracker = RateTracker::new();
        assert_eq!(tracker.rate(10, start), 0.0);
        assert_eq!(tracker.rate(30, start + Duration::from_secs(2)), 10.0);
        assert_eq!(tracker.rate(30, start + Duration::from_secs(4)), 0.0);
    }

    #[test]
    fn zero_elapsed_reuses_last_rate() {
        let start = Instant::now();
        let mut tracker = RateTracker::new();
        tracker.rate(0, start);
        let later = start + Duration::from_secs(1);
        assert_eq!(tracker.rate(5, later), 5.0);
        assert_eq!(tracker.rate(50, later), 5.0);
    }

    #[test]
    fn request_collector_reports_rates_and_mean_duration() {
        let collector = RequestRateCollector::new();
        let start = Instant::now();
        collector.collect_at(start);

        collector.record_request(Duration::from_millis(10), true);
        collector.record_request(Duration::from_millis(30), false);
        let metrics = collector.collect_at(start + Duration::from_secs(2));

        assert_eq!(
            metrics,
            vec![
                LiveMetric::new(REQUEST_RATE, 1.0),
                LiveMetric::new(REQUEST_FAILURE_RATE, 0.5),
                LiveMetric::new(REQUEST_DURATION, 20.0),
            ]
        );

        let idle = collector.collect_at(start + Duration::from_secs(3));
        assert_eq!(idle[0].value, 0.0);
        assert_eq!(idle[2].value, 0.0);
    }

    #[test]
    fn dependency_collector_reports_its_own_metrics() {
        let collector = DependencyRateCollector::new();
        let start = Instant::now();
        collector.collect_at(start);

        collector.record_dependency(Duration::from_millis(4), false);
        collector.record_dependency(Duration::from_millis(8), false);
        collector.record_dependency(Duration::from_millis(12), true);
        collector.record_dependency(Duration::from_millis(16), true);
        let metrics = collector.collect_at(start + Duration::from_secs(4));

        assert_eq!(
            metrics,
            vec![
                LiveMetric::new("\\ApplicationInsights\\Dependency Calls/Sec", 1.0),
                LiveMetric::new("\\ApplicationInsights\\Dependency Calls Failed/Sec", 0.5),
                LiveMetric::new("\\ApplicationInsights\\Dependency Call Duration", 10.0),
            ]
        );
    }

    #[test]
    fn request_and_dependency_collectors_are_independent() {
        let requests = RequestRateCollector::new();
        let dependencies = DependencyRateCollector::new();
        let start = Instant::now();
        requests.collect_at(start);
        dependencies.collect_at(start);

        requests.record_request(Duration::from_millis(50), true);
        let later = start + Duration::from_secs(1);
        assert_eq!(requests.collect_at(later)[0].value, 1.0);
        assert_eq!(dependencies.collect_at(later)[0].value, 0.0);
    }
}
