//! Durable, size and age bounded retry queue on local disk.
//!
//! Batches that could not be delivered are written to a directory as blobs.
//! Several exporters, in the same process or in different processes, may share
//! one directory: a blob is claimed by renaming it to a name that encodes a
//! lease expiry, and only one rename of a given file can succeed. No lock file
//! or in-process mutex is involved.
//!
//! Two bounds keep the directory from growing without limit:
//!
//! * admission: [`LocalFileStorage::put`] refuses new batches once the
//!   directory holds `max_size` bytes or more. Already queued batches win over
//!   new ones.
//! * retention: any scan deletes blobs older than `retention_period`, leased or
//!   not.
mod blob;

pub use blob::LocalFileBlob;

use crate::error::{Error, Result};
use crate::Envelope;
use blob::{earlier, format_timestamp, split_lease, BLOB_SUFFIX, TMP_SUFFIX};
use chrono::Utc;
use opentelemetry::{otel_debug, otel_error, otel_info, otel_warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Default cap on the total size of the retry directory, 50 MiB.
pub const DEFAULT_MAX_SIZE: u64 = 50 * 1024 * 1024;
/// Default interval of the background maintenance sweep.
pub const DEFAULT_MAINTENANCE_PERIOD: Duration = Duration::from_secs(60);
/// Default maximum age of a queued batch, 7 days.
pub const DEFAULT_RETENTION_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Temporary files older than this are leftovers of a crashed writer.
const WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for [`LocalFileStorage`].
#[derive(Clone, Debug)]
pub struct StorageConfig {
    /// Directory holding the blobs. Created if missing.
    pub path: PathBuf,
    /// Admission limit in bytes for the whole directory.
    pub max_size: u64,
    /// Interval of the background sweep. Zero disables the sweep thread.
    pub maintenance_period: Duration,
    /// Blobs older than this are deleted without being sent.
    pub retention_period: Duration,
}

impl StorageConfig {
    /// Configuration with default limits for the given directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StorageConfig {
            path: path.into(),
            max_size: DEFAULT_MAX_SIZE,
            maintenance_period: DEFAULT_MAINTENANCE_PERIOD,
            retention_period: DEFAULT_RETENTION_PERIOD,
        }
    }

    /// Set the admission limit in bytes.
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the background sweep interval.
    pub fn with_maintenance_period(mut self, period: Duration) -> Self {
        self.maintenance_period = period;
        self
    }

    /// Set the retention period.
    pub fn with_retention_period(mut self, period: Duration) -> Self {
        self.retention_period = period;
        self
    }
}

/// A directory of [`LocalFileBlob`]s used as a retry queue.
#[derive(Debug)]
pub struct LocalFileStorage {
    inner: Arc<StorageInner>,
    maintenance: Mutex<Option<Sender<()>>>,
}

#[derive(Debug)]
struct StorageInner {
    path: PathBuf,
    max_size: u64,
    retention_period: Duration,
}

impl LocalFileStorage {
    /// Open (creating if necessary) the directory described by `config`, sweep
    /// expired blobs and start the maintenance thread.
    ///
    /// Returns [`Error::StorageUnavailable`] if the directory cannot be created.
    /// The exporter then runs without retry buffering.
    pub fn new(config: StorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.path).map_err(|source| Error::StorageUnavailable {
            path: config.path.clone(),
            source,
        })?;

        let inner = Arc::new(StorageInner {
            path: config.path,
            max_size: config.max_size,
            retention_period: config.retention_period,
        });
        inner.scan();

        let maintenance = if config.maintenance_period.is_zero() {
            None
        } else {
            Self::spawn_maintenance(Arc::clone(&inner), config.maintenance_period)
        };

        Ok(LocalFileStorage {
            inner,
            maintenance: Mutex::new(maintenance),
        })
    }

    fn spawn_maintenance(inner: Arc<StorageInner>, period: Duration) -> Option<Sender<()>> {
        let (stop_sender, stop_receiver) = mpsc::channel::<()>();
        let result = thread::Builder::new()
            .name("OpenTelemetry.AzureMonitor.StorageMaintenance".to_string())
            .spawn(move || {
                otel_info!(
                    name: "LocalFileStorage.MaintenanceStarted",
                    period_ms = period.as_millis() as u64
                );
                loop {
                    match stop_receiver.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => inner.maintain(),
                        // dropped or signaled sender: stop
                        _ => break,
                    }
                }
                otel_info!(name: "LocalFileStorage.MaintenanceStopped");
            });

        match result {
            Ok(_) => Some(stop_sender),
            Err(err) => {
                otel_error!(
                    name: "LocalFileStorage.MaintenanceStartError",
                    error = format!("{:?}", err)
                );
                None
            }
        }
    }

    /// Directory backing this storage.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Persist `batch` as a new blob.
    ///
    /// Returns `None` when the directory is at or over its size limit, or when
    /// writing fails; both cases are logged. With a non-zero `lease_period` the
    /// blob stays invisible to [`get`](Self::get) until the lease lapses.
    pub fn put(&self, batch: &[Envelope], lease_period: Duration) -> Option<LocalFileBlob> {
        let size = self.inner.current_size();
        if size >= self.inner.max_size {
            otel_warn!(
                name: "LocalFileStorage.PutRefused",
                message = "Retry storage is full, dropping the batch.",
                size = size,
                max_size = self.inner.max_size,
                items = batch.len()
            );
            return None;
        }

        let name = format!(
            "{}-{:08x}{}",
            format_timestamp(Utc::now()),
            rand::random::<u32>(),
            BLOB_SUFFIX
        );
        match LocalFileBlob::new(self.inner.path.join(name)).put(batch, lease_period) {
            Ok(blob) => {
                otel_debug!(
                    name: "LocalFileStorage.Put",
                    path = format!("{}", blob.path().display()),
                    items = batch.len()
                );
                Some(blob)
            }
            Err(err) => {
                otel_warn!(
                    name: "LocalFileStorage.PutFailed",
                    error = format!("{}", err),
                    items = batch.len()
                );
                None
            }
        }
    }

    /// Return one blob that is neither expired nor leased, without claiming it.
    ///
    /// Callers must [`lease`](LocalFileBlob::lease) the blob before reading it.
    pub fn get(&self) -> Option<LocalFileBlob> {
        self.gets().into_iter().next()
    }

    /// Return every eligible blob, oldest first. Expired blobs and stale
    /// temporary files found along the way are deleted.
    pub fn gets(&self) -> Vec<LocalFileBlob> {
        self.inner.scan()
    }

    /// Stop the maintenance thread. Idempotent.
    pub fn shutdown(&self) {
        let sender = match self.maintenance.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
    }
}

impl Drop for LocalFileStorage {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl StorageInner {
    fn maintain(&self) {
        if !self.path.is_dir() {
            if let Err(err) = fs::create_dir_all(&self.path) {
                otel_warn!(
                    name: "LocalFileStorage.RecreateDirectoryFailed",
                    path = format!("{}", self.path.display()),
                    error = format!("{}", err)
                );
                return;
            }
        }
        self.scan();
    }

    /// Best effort: entries that vanish while we look at them are skipped.
    fn current_size(&self) -> u64 {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.metadata().ok())
            .filter(|metadata| metadata.is_file())
            .map(|metadata| metadata.len())
            .sum()
    }

    fn scan(&self) -> Vec<LocalFileBlob> {
        let now = Utc::now();
        let lease_deadline = format_timestamp(now);
        let retention_deadline = format_timestamp(earlier(now, self.retention_period));
        let write_deadline = format_timestamp(earlier(now, WRITE_TIMEOUT));

        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(err) => {
                otel_warn!(
                    name: "LocalFileStorage.ScanFailed",
                    path = format!("{}", self.path.display()),
                    error = format!("{}", err)
                );
                return Vec::new();
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();

        let mut blobs = Vec::new();
        for name in names {
            let path = self.path.join(&name);
            if name.ends_with(TMP_SUFFIX) {
                if name < write_deadline {
                    remove_expired(&path, "LocalFileStorage.StaleTemporaryFileRemoved");
                }
                continue;
            }

            let (base, lease_expiry) = split_lease(&name);
            if !base.ends_with(BLOB_SUFFIX) {
                continue;
            }
            if name < retention_deadline {
                remove_expired(&path, "LocalFileStorage.ExpiredBlobRemoved");
                continue;
            }
            if lease_expiry.is_some_and(|expiry| expiry > lease_deadline.as_str()) {
                continue;
            }
            blobs.push(LocalFileBlob::new(path));
        }
        blobs
    }
}

/// Another process may have removed the file first; that is not an error.
fn remove_expired(path: &Path, event: &'static str) {
    match fs::remove_file(path) {
        Ok(()) => {
            otel_info!(
                name: "LocalFileStorage.DataDropped",
                reason = event,
                path = format!("{}", path.display())
            );
        }
        Err(err) => {
            otel_debug!(
                name: "LocalFileStorage.RemoveFailed",
                path = format!("{}", path.display()),
                error = format!("{}", err)
            );
        }
    }
}
