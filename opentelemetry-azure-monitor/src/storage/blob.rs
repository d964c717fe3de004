use crate::error::{Error, Result};
use crate::Envelope;
use chrono::{DateTime, Utc};
use opentelemetry::otel_debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub(crate) const BLOB_SUFFIX: &str = ".blob";
pub(crate) const LOCK_SUFFIX: &str = ".lock";
pub(crate) const TMP_SUFFIX: &str = ".tmp";

/// Fixed width so that lexicographic order of names equals chronological order.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H%M%S%.6f";

pub(crate) fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

fn to_delta(period: Duration) -> chrono::Duration {
    chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

pub(crate) fn later(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_delta(period)).unwrap_or(now)
}

pub(crate) fn earlier(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(to_delta(period))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Splits `name@expiry.lock` into `(name, Some(expiry))`; unleased names are
/// returned unchanged.
pub(crate) fn split_lease(name: &str) -> (&str, Option<&str>) {
    if let Some(stripped) = name.strip_suffix(LOCK_SUFFIX) {
        if let Some(at) = stripped.rfind('@') {
            return (&stripped[..at], Some(&stripped[at + 1..]));
        }
    }
    (name, None)
}

/// A single batch of envelopes persisted on disk.
///
/// The file name carries all of the blob's state: the creation time prefix and,
/// while leased, the lease expiry suffix. Claiming a blob is a rename to a new
/// expiry; the rename fails for every caller but the first, which makes it the
/// only synchronization needed between threads or processes sharing a
/// directory.
#[derive(Clone, Debug)]
pub struct LocalFileBlob {
    path: PathBuf,
}

impl LocalFileBlob {
    pub(crate) fn new(path: PathBuf) -> Self {
        LocalFileBlob { path }
    }

    /// Current location of the blob on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and decode the batch stored in this blob.
    ///
    /// A blob that cannot be decoded yields [`Error::CorruptBlob`]; retrying
    /// will not help, so callers should delete it.
    pub fn get(&self) -> Result<Vec<Envelope>> {
        let content = fs::read_to_string(&self.path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|source| Error::CorruptBlob {
                    path: self.path.clone(),
                    source,
                })
            })
            .collect()
    }

    /// Write `batch` through a temporary file and publish it with a rename, so
    /// a crash mid-write never exposes a partial blob. A non-zero
    /// `lease_period` publishes the blob already leased.
    pub(crate) fn put(mut self, batch: &[Envelope], lease_period: Duration) -> Result<Self> {
        let mut content = Vec::new();
        for envelope in batch {
            serde_json::to_writer(&mut content, envelope)?;
            content.push(b'\n');
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(TMP_SUFFIX);
        let tmp = PathBuf::from(tmp);

        if let Err(err) = fs::write(&tmp, content) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }

        if !lease_period.is_zero() {
            self.path = self.leased_path(later(Utc::now(), lease_period));
        }

        if let Err(err) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(self)
    }

    /// Try to take ownership of the blob until `now + period`.
    ///
    /// Returns `true` iff this caller won the rename. Losing means another
    /// holder renamed or deleted the file first.
    pub fn lease(&mut self, period: Duration) -> bool {
        let target = self.leased_path(later(Utc::now(), period));
        match fs::rename(&self.path, &target) {
            Ok(()) => {
                self.path = target;
                true
            }
            Err(err) => {
                otel_debug!(
                    name: "LocalFileBlob.LeaseLost",
                    path = format!("{}", self.path.display()),
                    error = format!("{}", err)
                );
                false
            }
        }
    }

    /// Remove the blob from disk.
    ///
    /// Fails if the file is already gone; callers that only want the blob not
    /// to exist anymore can ignore the error.
    pub fn delete(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }

    fn leased_path(&self, expiry: DateTime<Utc>) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (base, _) = split_lease(&name);
        self.path
            .with_file_name(format!("{}@{}{}", base, format_timestamp(expiry), LOCK_SUFFIX))
    }
}
