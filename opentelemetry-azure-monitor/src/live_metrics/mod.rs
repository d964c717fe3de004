//! Live Metrics stream.
//!
//! The manager alternates between two mutually exclusive loops:
//!
//! * probing: ping the service every few seconds and ask whether a viewer has
//!   the live stream open.
//! * streaming: post metric snapshots and queued documents every second while
//!   a viewer is attached.
//!
//! Each loop runs on its own thread and adapts its interval to failures. A
//! supervisor thread looks at the subscription flag reported by the active loop
//! and swaps loops when it changed. The old loop is always joined before the
//! new one starts.
mod interval;
mod model;
mod rate;
mod sender;
mod source;

pub use model::{LiveMetric, LiveMetricDocument, LiveMetricDocumentProperty, LiveMetricEnvelope};
pub use rate::{DependencyRateCollector, RateTracker, RequestRateCollector};
pub use source::{DocumentQueue, MetricsSnapshotSource};

use crate::error::ExporterBuildError;
use crate::http::HttpClient;
use futures_executor::block_on;
use interval::PollingState;
use opentelemetry::{otel_debug, otel_error, otel_info, otel_warn, Context};
use sender::LiveMetricsSender;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default Live Metrics service.
pub const DEFAULT_LIVE_METRICS_ENDPOINT: &str = "https://rt.services.visualstudio.com";

const PING_INTERVAL: Duration = Duration::from_secs(5);
const POST_INTERVAL: Duration = Duration::from_secs(1);
const FALLBACK_INTERVAL: Duration = Duration::from_secs(60);
const PING_TOLERANCE: Duration = Duration::from_secs(60);
const POST_TOLERANCE: Duration = Duration::from_secs(20);
const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(2);

/// Which loop is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Waiting for a viewer.
    Probing,
    /// Posting snapshots to an attached viewer.
    Streaming,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Probing => "Probing",
            Mode::Streaming => "Streaming",
        }
    }
}

/// Timing and endpoint of the live metrics stream.
#[derive(Clone, Debug)]
pub struct LiveMetricsConfig {
    /// Service base URL.
    pub endpoint: String,
    /// Nominal interval between pings.
    pub ping_interval: Duration,
    /// Nominal interval between posts.
    pub post_interval: Duration,
    /// Interval used once failures exceeded the tolerance window.
    pub fallback_interval: Duration,
    /// How long pings may fail before falling back.
    pub ping_tolerance: Duration,
    /// How long posts may fail before falling back.
    pub post_tolerance: Duration,
    /// How often the supervisor checks the subscription.
    pub supervisor_interval: Duration,
}

impl Default for LiveMetricsConfig {
    fn default() -> Self {
        LiveMetricsConfig {
            endpoint: DEFAULT_LIVE_METRICS_ENDPOINT.to_string(),
            ping_interval: PING_INTERVAL,
            post_interval: POST_INTERVAL,
            fallback_interval: FALLBACK_INTERVAL,
            ping_tolerance: PING_TOLERANCE,
            post_tolerance: POST_TOLERANCE,
            supervisor_interval: SUPERVISOR_INTERVAL,
        }
    }
}

/// State published by a running loop for the supervisor.
#[derive(Debug)]
struct LoopStatus {
    subscribed: AtomicBool,
    interval_ms: AtomicU64,
}

struct ActiveLoop {
    mode: Mode,
    status: Arc<LoopStatus>,
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// What occupies the single loop position.
enum Slot {
    /// No loop, either stopped or a spawn failed.
    Idle,
    /// A caller is joining the old loop and will start the next one.
    Switching,
    Active(ActiveLoop),
}

impl Slot {
    fn active(&self) -> Option<&ActiveLoop> {
        match self {
            Slot::Active(active) => Some(active),
            Slot::Idle | Slot::Switching => None,
        }
    }
}

struct ManagerInner {
    sender: LiveMetricsSender,
    source: Arc<dyn MetricsSnapshotSource>,
    documents: DocumentQueue,
    config: LiveMetricsConfig,
    is_shutdown: AtomicBool,
    slot: Mutex<Slot>,
}

/// Runs the live metrics protocol in the background.
///
/// Created by the exporter when live metrics are enabled. Dropping the manager
/// shuts it down.
pub struct LiveMetricsManager {
    inner: Arc<ManagerInner>,
    supervisor: Mutex<Option<Sender<()>>>,
}

impl fmt::Debug for LiveMetricsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveMetricsManager")
            .field("sender", &self.inner.sender)
            .field("mode", &self.mode())
            .finish()
    }
}

impl LiveMetricsManager {
    /// Start probing and the supervisor thread.
    pub fn start(
        client: Arc<dyn HttpClient>,
        instrumentation_key: &str,
        source: Arc<dyn MetricsSnapshotSource>,
        config: LiveMetricsConfig,
    ) -> Result<Self, ExporterBuildError> {
        let inner = Arc::new(ManagerInner {
            sender: LiveMetricsSender::new(client, &config.endpoint, instrumentation_key),
            source,
            documents: DocumentQueue::new(),
            config,
            is_shutdown: AtomicBool::new(false),
            slot: Mutex::new(Slot::Idle),
        });

        {
            let mut slot = inner.lock_slot();
            *slot = inner.spawn_loop(Mode::Probing).map_or(Slot::Idle, Slot::Active);
        }

        let (stop_sender, stop_receiver) = mpsc::channel::<()>();
        let supervised = Arc::clone(&inner);
        let interval = supervised.config.supervisor_interval;
        let spawned = thread::Builder::new()
            .name("OpenTelemetry.AzureMonitor.LiveMetrics".to_string())
            .spawn(move || {
                otel_debug!(name: "LiveMetricsManager.SupervisorStarted");
                loop {
                    match stop_receiver.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => supervised.check_subscription(),
                        _ => break,
                    }
                }
                otel_debug!(name: "LiveMetricsManager.SupervisorStopped");
            });

        if let Err(err) = spawned {
            otel_error!(
                name: "LiveMetricsManager.SupervisorStartError",
                error = format!("{:?}", err)
            );
            inner.stop();
            return Err(ExporterBuildError::ThreadSpawnFailed);
        }

        Ok(LiveMetricsManager {
            inner,
            supervisor: Mutex::new(Some(stop_sender)),
        })
    }

    /// Currently running loop, `None` after shutdown or while loops are
    /// being swapped.
    pub fn mode(&self) -> Option<Mode> {
        self.inner.lock_slot().active().map(|active| active.mode)
    }

    /// Interval the active loop currently waits between requests.
    pub fn current_interval(&self) -> Option<Duration> {
        self.inner
            .lock_slot()
            .active()
            .map(|active| Duration::from_millis(active.status.interval_ms.load(Ordering::Acquire)))
    }

    /// Queue receiving envelopes to show in the live stream.
    pub fn documents(&self) -> &DocumentQueue {
        &self.inner.documents
    }

    /// Switch loops if the subscription changed since the last check.
    ///
    /// Runs on the supervisor thread every couple of seconds; exposed so the
    /// switch can be forced without waiting for it. A call made while another
    /// caller is swapping the loops returns without doing anything.
    pub fn check_subscription(&self) {
        self.inner.check_subscription();
    }

    /// Stop the active loop and the supervisor.
    ///
    /// Does not wait for in-flight requests: the threads exit when they next
    /// wake up. Idempotent.
    pub fn shutdown(&self) {
        self.inner.stop();
        let supervisor = match self.supervisor.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(supervisor);
    }
}

impl Drop for LiveMetricsManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ManagerInner {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stop(&self) {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.documents.set_collecting(false);
        // dropping the sender wakes the loop, its handle is detached.
        // A caller mid-switch sees the shutdown flag and does not respawn.
        let previous = std::mem::replace(&mut *self.lock_slot(), Slot::Idle);
        if let Slot::Active(active) = previous {
            otel_info!(
                name: "LiveMetricsManager.Shutdown",
                mode = active.mode.as_str()
            );
        }
    }

    fn check_subscription(self: &Arc<Self>) {
        let (previous, next) = {
            let mut slot = self.lock_slot();
            if self.is_shutdown.load(Ordering::Acquire) {
                return;
            }
            let next = match &*slot {
                Slot::Active(current) => {
                    let subscribed = current.status.subscribed.load(Ordering::Acquire);
                    match (current.mode, subscribed) {
                        (Mode::Probing, true) => Mode::Streaming,
                        (Mode::Streaming, false) => Mode::Probing,
                        _ => return,
                    }
                }
                Slot::Switching => return,
                // a previous spawn failed, start over
                Slot::Idle => Mode::Probing,
            };
            (std::mem::replace(&mut *slot, Slot::Switching), next)
        };

        if let Slot::Active(previous) = previous {
            otel_info!(
                name: "LiveMetricsManager.ModeSwitch",
                from = previous.mode.as_str(),
                to = next.as_str()
            );
            drop(previous.stop);
            if previous.handle.join().is_err() {
                otel_warn!(
                    name: "LiveMetricsManager.LoopPanicked",
                    mode = previous.mode.as_str()
                );
            }
        }

        let mut slot = self.lock_slot();
        if self.is_shutdown.load(Ordering::Acquire) {
            *slot = Slot::Idle;
            return;
        }
        self.documents.set_collecting(next == Mode::Streaming);
        *slot = self.spawn_loop(next).map_or(Slot::Idle, Slot::Active);
    }

    fn spawn_loop(self: &Arc<Self>, mode: Mode) -> Option<ActiveLoop> {
        let (nominal, tolerance, last_success, subscribed) = match mode {
            Mode::Probing => (
                self.config.ping_interval,
                self.config.ping_tolerance,
                None,
                false,
            ),
            Mode::Streaming => (
                self.config.post_interval,
                self.config.post_tolerance,
                Some(Instant::now()),
                true,
            ),
        };
        let polling = PollingState::new(
            nominal,
            self.config.fallback_interval,
            tolerance,
            last_success,
        );
        let status = Arc::new(LoopStatus {
            subscribed: AtomicBool::new(subscribed),
            interval_ms: AtomicU64::new(nominal.as_millis() as u64),
        });

        let (stop, stop_receiver) = mpsc::channel::<()>();
        let inner = Arc::clone(self);
        let loop_status = Arc::clone(&status);
        let spawned = thread::Builder::new()
            .name(format!("OpenTelemetry.AzureMonitor.LiveMetrics.{}", mode.as_str()))
            .spawn(move || inner.run_loop(mode, polling, &loop_status, stop_receiver));

        match spawned {
            Ok(handle) => Some(ActiveLoop {
                mode,
                status,
                stop,
                handle,
            }),
            Err(err) => {
                otel_error!(
                    name: "LiveMetricsManager.LoopStartError",
                    mode = mode.as_str(),
                    error = format!("{:?}", err)
                );
                None
            }
        }
    }

    fn run_loop(
        &self,
        mode: Mode,
        mut polling: PollingState,
        status: &LoopStatus,
        stop: Receiver<()>,
    ) {
        // requests made here must not be instrumented themselves
        let _suppress_guard = Context::enter_telemetry_suppressed_scope();
        otel_debug!(name: "LiveMetricsManager.LoopStarted", mode = mode.as_str());

        loop {
            let attempt = match mode {
                Mode::Probing => block_on(self.sender.ping(&self.envelope(None))),
                Mode::Streaming => {
                    let mut envelope = self.envelope(Some(self.documents.drain()));
                    envelope.metrics = Some(self.source.collect());
                    block_on(self.sender.post(&envelope))
                }
            };

            let now = Instant::now();
            match attempt {
                Ok(response) if response.ok => {
                    polling.on_success(now);
                    match mode {
                        // a probe only ever turns the flag on
                        Mode::Probing if response.subscribed => {
                            status.subscribed.store(true, Ordering::Release)
                        }
                        Mode::Probing => {}
                        Mode::Streaming => status
                            .subscribed
                            .store(response.subscribed, Ordering::Release),
                    }
                }
                Ok(_) => {
                    polling.on_failure(now);
                    otel_debug!(
                        name: "LiveMetricsManager.RequestRejected",
                        mode = mode.as_str()
                    );
                }
                Err(err) => {
                    polling.on_failure(now);
                    otel_debug!(
                        name: "LiveMetricsManager.RequestFailed",
                        mode = mode.as_str(),
                        error = format!("{}", err)
                    );
                }
            }
            status
                .interval_ms
                .store(polling.interval().as_millis() as u64, Ordering::Release);

            match stop.recv_timeout(polling.interval()) {
                Err(RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        }
        otel_debug!(name: "LiveMetricsManager.LoopStopped", mode = mode.as_str());
    }

    fn envelope(&self, documents: Option<Vec<LiveMetricDocument>>) -> LiveMetricEnvelope {
        let mut envelope = LiveMetricEnvelope::new(self.sender.instrumentation_key());
        envelope.documents = documents;
        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::test_http_client::{Reply, TestHttpClient};
    use crate::Envelope;
    use serde_json::json;

    #[derive(Debug)]
    struct FixedSource;

    impl MetricsSnapshotSource for FixedSource {
        fn collect(&self) -> Vec<LiveMetric> {
            vec![LiveMetric::new("\\Memory\\Available Bytes", 42.0)]
        }
    }

    fn config() -> LiveMetricsConfig {
        LiveMetricsConfig {
            endpoint: "https://live.example.com".to_string(),
            ping_interval: Duration::from_millis(20),
            post_interval: Duration::from_millis(20),
            fallback_interval: Duration::from_millis(500),
            ping_tolerance: Duration::from_secs(60),
            post_tolerance: Duration::from_secs(20),
            // the tests drive the switch themselves
            supervisor_interval: Duration::from_secs(3600),
        }
    }

    fn manager(client: &TestHttpClient) -> LiveMetricsManager {
        LiveMetricsManager::start(
            Arc::new(client.clone()),
            "ikey",
            Arc::new(FixedSource),
            config(),
        )
        .unwrap()
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn starts_probing_and_stays_without_subscription() {
        let client = TestHttpClient::new(Reply::Status(200, ""));
        let manager = manager(&client);
        wait_for(|| client.requests_to("/ping") >= 1);

        manager.check_subscription();
        assert_eq!(manager.mode(), Some(Mode::Probing));
        assert_eq!(client.requests_to("/post"), 0);
        assert!(!manager.documents().is_collecting());
    }

    #[test]
    fn subscribed_ping_switches_to_streaming() {
        let client = TestHttpClient::new(Reply::StatusWithHeader(
            200,
            "x-ms-qps-subscribed",
            "true",
        ));
        let manager = manager(&client);
        // the flag is published once the first ping completed
        wait_for(|| client.requests_to("/ping") >= 2);

        manager.check_subscription();
        assert_eq!(manager.mode(), Some(Mode::Streaming));
        assert!(manager.documents().is_collecting());

        let pings = client.requests_to("/ping");
        wait_for(|| client.requests_to("/post") >= 2);
        assert_eq!(client.requests_to("/ping"), pings);

        let posted = client.bodies().pop().unwrap();
        assert_eq!(posted[0]["InstrumentationKey"], "ikey");
        assert_eq!(posted[0]["Metrics"][0]["Value"], 42.0);
        manager.shutdown();
    }

    #[test]
    fn unsubscribed_post_switches_back_to_probing() {
        let client = TestHttpClient::new(Reply::Status(200, ""));
        client.push(Reply::StatusWithHeader(200, "x-ms-qps-subscribed", "true"));
        let manager = manager(&client);
        // the flag is published once the first ping completed
        wait_for(|| client.requests_to("/ping") >= 2);

        manager.check_subscription();
        assert_eq!(manager.mode(), Some(Mode::Streaming));
        wait_for(|| client.requests_to("/post") >= 2);

        manager.check_subscription();
        assert_eq!(manager.mode(), Some(Mode::Probing));
        assert!(!manager.documents().is_collecting());
    }

    #[test]
    fn streamed_documents_are_posted() {
        let client = TestHttpClient::new(Reply::StatusWithHeader(
            200,
            "x-ms-qps-subscribed",
            "true",
        ));
        let manager = manager(&client);
        wait_for(|| client.requests_to("/ping") >= 2);
        manager.check_subscription();

        let queued = manager.documents().push(
            Envelope::new("Microsoft.ApplicationInsights.Event", "t")
                .with_data("EventData", json!({"properties": {"k": "v"}})),
        );
        assert!(queued);
        wait_for(|| {
            client.bodies().iter().any(|body| {
                body[0]["Documents"]
                    .as_array()
                    .is_some_and(|documents| !documents.is_empty())
            })
        });
    }

    #[test]
    fn concurrent_checks_keep_a_single_loop() {
        let client = TestHttpClient::new(Reply::StatusWithHeader(
            200,
            "x-ms-qps-subscribed",
            "true",
        ))
        .with_delay(Duration::from_millis(30));
        let manager = manager(&client);
        wait_for(|| client.requests_to("/ping") >= 2);

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        manager.check_subscription();
                        thread::sleep(Duration::from_millis(2));
                    }
                });
            }
        });

        assert_eq!(client.max_in_flight(), 1);
        assert_eq!(manager.mode(), Some(Mode::Streaming));
        assert!(manager.documents().is_collecting());
        manager.shutdown();
    }

    #[test]
    fn failing_pings_fall_back() {
        let client = TestHttpClient::new(Reply::TransportError);
        let manager = manager(&client);
        wait_for(|| manager.current_interval() == Some(Duration::from_millis(500)));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let client = TestHttpClient::new(Reply::Status(200, ""));
        let manager = manager(&client);
        manager.shutdown();
        manager.shutdown();
        assert_eq!(manager.mode(), None);

        manager.check_subscription();
        assert_eq!(manager.mode(), None);
    }
}
