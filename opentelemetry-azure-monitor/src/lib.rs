//! # OpenTelemetry Azure Monitor Exporter
//!
//! Delivers telemetry envelopes to the Azure Monitor (Application Insights)
//! ingestion service.
//!
//! Delivery is at least once: batches the service could not accept because of
//! throttling, server errors or network failures are persisted to a local
//! retry queue and resent after the next successful export. The queue is
//! bounded in size and age, survives restarts, and may be shared by several
//! processes pointing at the same directory.
//!
//! Optionally, the exporter keeps a Live Metrics stream open: it pings the
//! Live Metrics service and, while someone watches the stream in the Azure
//! portal, posts metric snapshots every second.
//!
//! Turning spans, logs or metrics into [`Envelope`]s is not part of this crate.
//!
//! ## Quickstart
//!
//! ```no_run
//! use opentelemetry_azure_monitor::{AzureMonitorExporter, Envelope, ExportResult};
//! use serde_json::json;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let exporter = AzureMonitorExporter::builder()
//!         .with_connection_string(
//!             "InstrumentationKey=00000000-0000-4000-8000-000000000000",
//!         )
//!         .build()?;
//!
//!     let envelope = Envelope::new("Microsoft.ApplicationInsights.Event", "2024-01-01T00:00:00Z")
//!         .with_data("EventData", json!({"ver": 2, "name": "checkout"}));
//!
//!     let result = futures_executor::block_on(exporter.export(vec![envelope]));
//!     assert_ne!(result, ExportResult::FailedNotRetryable);
//!
//!     exporter.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! | Environment variable                    | Builder method               |
//! |-----------------------------------------|------------------------------|
//! | `APPLICATIONINSIGHTS_CONNECTION_STRING` | `with_connection_string`     |
//! | `APPINSIGHTS_INSTRUMENTATIONKEY`        | `with_instrumentation_key`   |
//! | `OTEL_EXPORTER_AZURE_MONITOR_TIMEOUT`   | `with_timeout`               |
//!
//! Values set on the builder take precedence, except that an ingestion
//! endpoint found in a connection string wins over [`with_endpoint`].
//!
//! [`with_endpoint`]: AzureMonitorExporterBuilder::with_endpoint
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![doc(
    html_logo_url = "https://raw.githubusercontent.com/open-telemetry/opentelemetry-rust/main/assets/logo.svg"
)]

pub mod config;
mod envelope;
mod error;
mod exporter;
pub mod http;
pub mod live_metrics;
pub mod storage;
mod transmission;

pub use envelope::{Data, Envelope};
pub use error::{Error, ExporterBuildError, Result};
pub use exporter::{AzureMonitorExporter, AzureMonitorExporterBuilder, TelemetryProcessor};
pub use transmission::{ExportResult, Transmitter};
