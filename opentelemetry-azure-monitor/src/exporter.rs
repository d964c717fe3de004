//! The exporter facade tying configuration, transmission, retry storage and
//! live metrics together.
use crate::config;
use crate::error::ExporterBuildError;
use crate::http::HttpClient;
use crate::live_metrics::{LiveMetricsConfig, LiveMetricsManager, MetricsSnapshotSource};
use crate::storage::{
    LocalFileStorage, StorageConfig, DEFAULT_MAINTENANCE_PERIOD, DEFAULT_MAX_SIZE,
    DEFAULT_RETENTION_PERIOD,
};
use crate::transmission::{ExportResult, Transmitter};
use crate::Envelope;
use http::Uri;
use opentelemetry::{otel_debug, otel_info, otel_warn};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Callback run on every envelope before it is sent. Returning `false` drops
/// the envelope.
///
/// A processor that panics is logged and skipped; the envelope is kept.
pub type TelemetryProcessor = Arc<dyn Fn(&mut Envelope) -> bool + Send + Sync>;

/// Exports envelopes to Azure Monitor.
///
/// Batches that fail with a retryable error are kept in a local retry queue and
/// resent after the next successful export.
pub struct AzureMonitorExporter {
    instrumentation_key: String,
    transmitter: Transmitter,
    processors: RwLock<Vec<TelemetryProcessor>>,
    live_metrics: Option<LiveMetricsManager>,
    is_shutdown: AtomicBool,
}

impl fmt::Debug for AzureMonitorExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureMonitorExporter")
            .field("transmitter", &self.transmitter)
            .field("live_metrics", &self.live_metrics)
            .finish()
    }
}

impl AzureMonitorExporter {
    /// Configure a new exporter.
    pub fn builder() -> AzureMonitorExporterBuilder {
        AzureMonitorExporterBuilder::default()
    }

    /// Instrumentation key the exporter sends with.
    pub fn instrumentation_key(&self) -> &str {
        &self.instrumentation_key
    }

    /// Register a processor. Processors run in the order they were added; the
    /// first one returning `false` drops the envelope.
    pub fn add_telemetry_processor<F>(&self, processor: F)
    where
        F: Fn(&mut Envelope) -> bool + Send + Sync + 'static,
    {
        self.processors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(processor));
    }

    /// Remove all processors.
    pub fn clear_telemetry_processors(&self) {
        self.processors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn apply_telemetry_processors(&self, envelopes: Vec<Envelope>) -> Vec<Envelope> {
        // processors may register or clear processors themselves
        let processors: Vec<TelemetryProcessor> = self
            .processors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if processors.is_empty() {
            return envelopes;
        }
        envelopes
            .into_iter()
            .filter_map(|mut envelope| {
                processors
                    .iter()
                    .all(|processor| run_processor(processor, &mut envelope))
                    .then_some(envelope)
            })
            .collect()
    }

    /// Send a batch.
    ///
    /// A retryable failure stores the batch for later; a success resends
    /// whatever the retry queue holds. Errors never escape: the outcome is
    /// reported through the returned [`ExportResult`].
    ///
    /// With the async `reqwest` client the future must be polled inside a
    /// Tokio runtime.
    pub async fn export(&self, envelopes: Vec<Envelope>) -> ExportResult {
        if self.is_shutdown.load(Ordering::Acquire) {
            otel_debug!(
                name: "AzureMonitorExporter.ExportAfterShutdown",
                items = envelopes.len()
            );
            return ExportResult::FailedNotRetryable;
        }

        let envelopes = self.apply_telemetry_processors(envelopes);
        if let Some(live_metrics) = &self.live_metrics {
            let documents = live_metrics.documents();
            if documents.is_collecting() {
                for envelope in &envelopes {
                    documents.push(envelope.clone());
                }
            }
        }

        let result = self.transmitter.transmit(&envelopes).await;
        match result {
            ExportResult::FailedRetryable => match self.transmitter.storage() {
                Some(storage) => {
                    storage.put(&envelopes, Duration::ZERO);
                }
                None => {
                    otel_warn!(
                        name: "AzureMonitorExporter.RetryDropped",
                        message = "No retry storage available.",
                        items = envelopes.len()
                    );
                }
            },
            ExportResult::Success => self.transmitter.transmit_from_storage().await,
            ExportResult::FailedNotRetryable => {}
        }
        result
    }

    /// Live metrics manager, when live metrics were enabled.
    pub fn live_metrics(&self) -> Option<&LiveMetricsManager> {
        self.live_metrics.as_ref()
    }

    /// Stop the live metrics stream and the retry storage maintenance.
    /// Subsequent exports are refused. Idempotent.
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(live_metrics) = &self.live_metrics {
            live_metrics.shutdown();
        }
        if let Some(storage) = self.transmitter.storage() {
            storage.shutdown();
        }
        otel_info!(name: "AzureMonitorExporter.Shutdown");
    }
}

impl Drop for AzureMonitorExporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builder for [`AzureMonitorExporter`].
///
/// Values not set here are looked up in the environment, see
/// [`ENV_CONNECTION_STRING`](crate::config::ENV_CONNECTION_STRING),
/// [`ENV_INSTRUMENTATION_KEY`](crate::config::ENV_INSTRUMENTATION_KEY) and
/// [`ENV_TIMEOUT`](crate::config::ENV_TIMEOUT).
#[derive(Default)]
pub struct AzureMonitorExporterBuilder {
    connection_string: Option<String>,
    instrumentation_key: Option<String>,
    endpoint: Option<String>,
    timeout: Option<Duration>,
    client: Option<Arc<dyn HttpClient>>,
    storage_path: Option<PathBuf>,
    storage_max_size: Option<u64>,
    storage_maintenance_period: Option<Duration>,
    storage_retention_period: Option<Duration>,
    live_metrics: Option<Arc<dyn MetricsSnapshotSource>>,
    live_metrics_config: Option<LiveMetricsConfig>,
}

impl fmt::Debug for AzureMonitorExporterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureMonitorExporterBuilder")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("storage_path", &self.storage_path)
            .field("live_metrics", &self.live_metrics.is_some())
            .finish()
    }
}

impl AzureMonitorExporterBuilder {
    /// Connection string of the Application Insights resource.
    pub fn with_connection_string<T: Into<String>>(mut self, connection_string: T) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    /// Instrumentation key, used when no connection string provides one.
    pub fn with_instrumentation_key<T: Into<String>>(mut self, instrumentation_key: T) -> Self {
        self.instrumentation_key = Some(instrumentation_key.into());
        self
    }

    /// Ingestion service base URL, used when no connection string provides
    /// one. `/v2/track` is appended.
    pub fn with_endpoint<T: Into<String>>(mut self, endpoint: T) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Timeout of each request. It also sizes the lease taken while resending
    /// stored batches, so it should match the timeout of a custom client.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Custom HTTP client.
    ///
    /// Live metrics loops drive the client with a plain executor on their own
    /// threads, so a client used with live metrics must not depend on an
    /// async runtime.
    pub fn with_http_client<T: HttpClient + 'static>(mut self, client: T) -> Self {
        self.client = Some(Arc::new(client));
        self
    }

    /// Directory of the retry queue.
    pub fn with_storage_path<T: Into<PathBuf>>(mut self, path: T) -> Self {
        self.storage_path = Some(path.into());
        self
    }

    /// Size cap of the retry queue in bytes.
    pub fn with_storage_max_size(mut self, max_size: u64) -> Self {
        self.storage_max_size = Some(max_size);
        self
    }

    /// Interval of the retry queue sweep. Zero disables the sweep thread.
    pub fn with_storage_maintenance_period(mut self, period: Duration) -> Self {
        self.storage_maintenance_period = Some(period);
        self
    }

    /// Age after which queued batches are discarded.
    pub fn with_storage_retention_period(mut self, period: Duration) -> Self {
        self.storage_retention_period = Some(period);
        self
    }

    /// Enable the live metrics stream, publishing the metrics of `source`.
    pub fn with_live_metrics<T: MetricsSnapshotSource + 'static>(mut self, source: T) -> Self {
        self.live_metrics = Some(Arc::new(source));
        self
    }

    /// Endpoint and timing of the live metrics stream.
    pub fn with_live_metrics_config(mut self, config: LiveMetricsConfig) -> Self {
        self.live_metrics_config = Some(config);
        self
    }

    /// Resolve the configuration and start the exporter.
    ///
    /// A retry queue directory that cannot be created does not fail the
    /// build: the exporter then runs without retry buffering.
    pub fn build(self) -> Result<AzureMonitorExporter, ExporterBuildError> {
        let resolved = config::resolve(
            self.connection_string.as_deref(),
            self.instrumentation_key.as_deref(),
            self.endpoint.as_deref(),
        )?;
        let timeout = self.timeout.unwrap_or_else(config::timeout_from_env);

        let endpoint = resolved
            .endpoint
            .parse::<Uri>()
            .map_err(|err| ExporterBuildError::InvalidUri(resolved.endpoint.clone(), err.to_string()))?;

        let custom_client = self.client.is_some();
        let client = match self.client {
            Some(client) => client,
            None => default_http_client(timeout).ok_or(ExporterBuildError::NoHttpClient)?,
        };
        if self.live_metrics.is_some() {
            check_live_metrics_client(custom_client, DEFAULT_CLIENT_IS_BLOCKING)?;
        }

        let storage_path = self.storage_path.unwrap_or_else(|| {
            std::env::temp_dir().join(format!("opentelemetry-rust-{}", resolved.instrumentation_key))
        });
        let storage_config = StorageConfig::new(storage_path)
            .with_max_size(self.storage_max_size.unwrap_or(DEFAULT_MAX_SIZE))
            .with_maintenance_period(
                self.storage_maintenance_period
                    .unwrap_or(DEFAULT_MAINTENANCE_PERIOD),
            )
            .with_retention_period(
                self.storage_retention_period
                    .unwrap_or(DEFAULT_RETENTION_PERIOD),
            );
        let storage = match LocalFileStorage::new(storage_config) {
            Ok(storage) => Some(Arc::new(storage)),
            Err(err) => {
                otel_warn!(
                    name: "AzureMonitorExporter.StorageDisabled",
                    error = format!("{}", err)
                );
                None
            }
        };

        let live_metrics = match self.live_metrics {
            Some(source) => Some(LiveMetricsManager::start(
                Arc::clone(&client),
                &resolved.instrumentation_key,
                source,
                self.live_metrics_config.unwrap_or_default(),
            )?),
            None => None,
        };

        otel_debug!(
            name: "AzureMonitorExporter.Built",
            endpoint = resolved.endpoint.clone(),
            timeout_ms = timeout.as_millis() as u64,
            storage = storage.is_some(),
            live_metrics = live_metrics.is_some()
        );

        Ok(AzureMonitorExporter {
            instrumentation_key: resolved.instrumentation_key,
            transmitter: Transmitter::new(client, endpoint, timeout, storage),
            processors: RwLock::new(Vec::new()),
            live_metrics,
            is_shutdown: AtomicBool::new(false),
        })
    }
}

fn run_processor(processor: &TelemetryProcessor, envelope: &mut Envelope) -> bool {
    match catch_unwind(AssertUnwindSafe(|| processor(&mut *envelope))) {
        Ok(keep) => keep,
        Err(_) => {
            otel_warn!(
                name: "AzureMonitorExporter.TelemetryProcessorFailed",
                envelope = envelope.name.clone()
            );
            true
        }
    }
}

/// Live metrics run without an async runtime. The default client only works
/// there when it is the blocking one.
fn check_live_metrics_client(
    custom_client: bool,
    default_is_blocking: bool,
) -> Result<(), ExporterBuildError> {
    if custom_client || default_is_blocking {
        Ok(())
    } else {
        Err(ExporterBuildError::LiveMetricsClientUnsupported)
    }
}

const DEFAULT_CLIENT_IS_BLOCKING: bool = cfg!(all(
    feature = "reqwest-blocking-client",
    not(target_arch = "wasm32")
));

#[cfg(all(feature = "reqwest-blocking-client", not(target_arch = "wasm32")))]
fn default_http_client(timeout: Duration) -> Option<Arc<dyn HttpClient>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .ok()?;
    Some(Arc::new(client))
}

#[cfg(all(
    feature = "reqwest-client",
    not(all(feature = "reqwest-blocking-client", not(target_arch = "wasm32")))
))]
fn default_http_client(timeout: Duration) -> Option<Arc<dyn HttpClient>> {
    #[cfg(not(target_arch = "wasm32"))]
    let client = reqwest::Client::builder().timeout(timeout).build().ok()?;
    #[cfg(target_arch = "wasm32")]
    let client = {
        let _ = timeout;
        reqwest::Client::new()
    };
    Some(Arc::new(client))
}

#[cfg(not(any(
    feature = "reqwest-client",
    all(feature = "reqwest-blocking-client", not(target_arch = "wasm32"))
)))]
fn default_http_client(_timeout: Duration) -> Option<Arc<dyn HttpClient>> {
    None
}
