//! Error types for the Azure Monitor exporter.
use crate::http::HttpError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type used by fallible storage and transmission helpers.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised inside the delivery pipeline.
///
/// None of these ever reach the instrumented application: the exporter converts
/// them into an [`ExportResult`](crate::ExportResult) or logs and drops them.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The retry queue directory could not be created or accessed. Retry
    /// buffering is disabled, the primary send path keeps working.
    #[error("retry storage at {path:?} is unavailable: {source}")]
    StorageUnavailable {
        /// Directory that was requested.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A blob on disk could not be deserialized.
    #[error("blob {path:?} is corrupt: {source}")]
    CorruptBlob {
        /// Blob location.
        path: PathBuf,
        /// Decoding failure.
        #[source]
        source: serde_json::Error,
    },

    /// Generic I/O failure on a blob.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Envelopes could not be encoded.
    #[error("failed to serialize envelopes: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The HTTP request could not be built or sent.
    #[error("request failed: {0}")]
    RequestFailed(#[source] HttpError),
}

/// Errors that can occur while building an [`AzureMonitorExporter`](crate::AzureMonitorExporter).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExporterBuildError {
    /// The connection string could not be parsed.
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// The instrumentation key is not a valid UUID.
    #[error("invalid instrumentation key: {0}")]
    InvalidInstrumentationKey(String),

    /// No instrumentation key was configured or found in the environment.
    #[error("instrumentation key cannot be none or empty")]
    MissingInstrumentationKey,

    /// No Http client specified.
    #[error("no http client specified")]
    NoHttpClient,

    /// Invalid URI.
    #[error("invalid URI {0}. Reason {1}")]
    InvalidUri(String, String),

    /// Live metrics were requested but the only available client is the async
    /// `reqwest` client, which needs a Tokio runtime the background loops do
    /// not have. Enable `reqwest-blocking-client` or pass a custom client.
    #[error("live metrics need a blocking or custom http client")]
    LiveMetricsClientUnsupported,

    /// Spawning a background thread failed.
    #[error("spawning a new thread failed")]
    ThreadSpawnFailed,
}
