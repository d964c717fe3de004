//! Delivery of envelope batches to the ingestion endpoint.
//!
//! The [`Transmitter`] posts one batch, maps the HTTP outcome to an
//! [`ExportResult`], and uses the [`LocalFileStorage`] retry queue both for
//! items the service rejected individually and for draining previously
//! failed batches.
use crate::error::Error;
use crate::http::HttpClient;
use crate::storage::LocalFileStorage;
use crate::Envelope;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{Method, Request, Uri};
use opentelemetry::{otel_debug, otel_error, otel_info, otel_warn};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Extra lease time on top of the send timeout when claiming a stored blob,
/// so the lease outlives one full send attempt.
const LEASE_MARGIN: Duration = Duration::from_secs(5);
/// Lease applied to a blob whose resend failed with a retryable error: short,
/// so a later drain can pick it up again soon.
const RETRY_LEASE: Duration = Duration::from_secs(1);

/// Statuses for which the whole batch is retried.
const RETRYABLE_STATUS: [u16; 3] = [
    429, // Too Many Requests
    500, // Internal Server Error
    503, // Service Unavailable
];

/// Statuses for which a single item of a partial success is re-queued.
const RETRYABLE_ITEM_STATUS: [u16; 4] = [
    429, // Too Many Requests
    439, // Too Many Requests over extended time
    500, // Internal Server Error
    503, // Service Unavailable
];

/// Verdict of one transmission attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportResult {
    /// The batch was accepted.
    Success,
    /// The whole batch should be retried later.
    FailedRetryable,
    /// The batch was dropped; the reason has been logged.
    FailedNotRetryable,
}

/// Body of a `206 Partial Content` response from the ingestion service.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackResponse {
    #[serde(default)]
    items_received: usize,
    #[serde(default)]
    items_accepted: usize,
    #[serde(default)]
    errors: Vec<TrackError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackError {
    index: usize,
    status_code: u16,
    #[serde(default)]
    message: String,
}

/// Sends batches of envelopes to the ingestion endpoint.
pub struct Transmitter {
    client: Arc<dyn HttpClient>,
    endpoint: Uri,
    timeout: Duration,
    storage: Option<Arc<LocalFileStorage>>,
}

impl fmt::Debug for Transmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transmitter")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("storage", &self.storage.as_ref().map(|s| s.path().to_owned()))
            .finish()
    }
}

impl Transmitter {
    /// Create a transmitter.
    ///
    /// `timeout` must match the timeout enforced by `client`; it sizes the lease
    /// taken on stored blobs. Without `storage`, items that should be retried
    /// are dropped and logged.
    pub fn new(
        client: Arc<dyn HttpClient>,
        endpoint: Uri,
        timeout: Duration,
        storage: Option<Arc<LocalFileStorage>>,
    ) -> Self {
        Transmitter {
            client,
            endpoint,
            timeout,
            storage,
        }
    }

    /// The retry queue, if retry buffering is available.
    pub fn storage(&self) -> Option<&Arc<LocalFileStorage>> {
        self.storage.as_ref()
    }

    /// Send `envelopes` and classify the outcome. Never fails: every error is
    /// mapped to an [`ExportResult`].
    pub async fn transmit(&self, envelopes: &[Envelope]) -> ExportResult {
        if envelopes.is_empty() {
            return ExportResult::Success;
        }

        let request = match self.build_request(envelopes) {
            Ok(request) => request,
            Err(err) => {
                otel_warn!(
                    name: "Transmitter.RequestBuildFailed",
                    error = format!("{}", err)
                );
                return ExportResult::FailedRetryable;
            }
        };

        let response = match self.client.send_bytes(request).await {
            Ok(response) => response,
            Err(err) => {
                otel_warn!(
                    name: "Transmitter.TransientError",
                    message = "Transient client side error.",
                    error = format!("{}", err)
                );
                return ExportResult::FailedRetryable;
            }
        };

        let status = response.status().as_u16();
        let body = response.into_body();
        match status {
            200 => {
                otel_info!(
                    name: "Transmitter.Succeeded",
                    items = envelopes.len()
                );
                ExportResult::Success
            }
            206 => match serde_json::from_slice::<TrackResponse>(&body) {
                // nothing to act on per item, resend the whole batch
                Ok(track)
                    if track.errors.is_empty() && track.items_accepted < envelopes.len() =>
                {
                    otel_warn!(
                        name: "Transmitter.PartialSuccessWithoutErrors",
                        items = envelopes.len(),
                        items_accepted = track.items_accepted
                    );
                    ExportResult::FailedRetryable
                }
                Ok(track) => {
                    self.handle_partial_success(envelopes, track);
                    ExportResult::FailedNotRetryable
                }
                // cannot parse the body, resend the whole batch
                Err(_) => ExportResult::FailedRetryable,
            },
            status if RETRYABLE_STATUS.contains(&status) => {
                otel_warn!(
                    name: "Transmitter.RetryableStatus",
                    status = status,
                    body = String::from_utf8_lossy(&body).into_owned()
                );
                ExportResult::FailedRetryable
            }
            status => {
                otel_error!(
                    name: "Transmitter.DataDropped",
                    status = status,
                    items = envelopes.len(),
                    body = String::from_utf8_lossy(&body).into_owned()
                );
                ExportResult::FailedNotRetryable
            }
        }
    }

    fn build_request(&self, envelopes: &[Envelope]) -> Result<Request<Bytes>, Error> {
        let body = serde_json::to_vec(envelopes)?;
        Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .body(Bytes::from(body))
            .map_err(|err| Error::RequestFailed(Box::new(err)))
    }

    /// Items rejected with a retryable status are queued one by one; the batch
    /// as a whole is not retried, since that would resend accepted items.
    fn handle_partial_success(&self, envelopes: &[Envelope], track: TrackResponse) {
        otel_info!(
            name: "Transmitter.PartialSuccess",
            items_received = track.items_received,
            items_accepted = track.items_accepted,
            errors = track.errors.len()
        );

        let mut resend = Vec::new();
        for error in track.errors {
            let Some(envelope) = envelopes.get(error.index) else {
                otel_warn!(
                    name: "Transmitter.PartialSuccessIndexOutOfRange",
                    index = error.index,
                    items = envelopes.len()
                );
                continue;
            };
            if RETRYABLE_ITEM_STATUS.contains(&error.status_code) {
                resend.push(envelope.clone());
            } else {
                otel_error!(
                    name: "Transmitter.DataDropped",
                    status = error.status_code,
                    message = error.message.as_str(),
                    envelope = format!("{:?}", envelope)
                );
            }
        }

        if resend.is_empty() {
            return;
        }
        match &self.storage {
            Some(storage) => {
                if storage.put(&resend, Duration::ZERO).is_none() {
                    otel_warn!(
                        name: "Transmitter.ResendNotStored",
                        items = resend.len()
                    );
                }
            }
            None => {
                otel_warn!(
                    name: "Transmitter.ResendDropped",
                    message = "No retry storage available.",
                    items = resend.len()
                );
            }
        }
    }

    /// Resend every batch currently eligible in the retry queue.
    ///
    /// Each blob is leased for longer than one send attempt, so concurrent
    /// drains in other threads or processes skip it. A retryable failure only
    /// keeps a short lease; success or a permanent failure deletes the blob.
    pub async fn transmit_from_storage(&self) {
        let Some(storage) = &self.storage else {
            return;
        };

        for mut blob in storage.gets() {
            if !blob.lease(self.timeout + LEASE_MARGIN) {
                continue;
            }

            let envelopes = match blob.get() {
                Ok(envelopes) => envelopes,
                Err(err) => {
                    otel_warn!(
                        name: "Transmitter.StoredBatchUnreadable",
                        error = format!("{}", err)
                    );
                    let _ = blob.delete();
                    continue;
                }
            };

            match self.transmit(&envelopes).await {
                ExportResult::FailedRetryable => {
                    blob.lease(RETRY_LEASE);
                }
                ExportResult::Success | ExportResult::FailedNotRetryable => {
                    if let Err(err) = blob.delete() {
                        otel_debug!(
                            name: "Transmitter.StoredBatchDeleteFailed",
                            error = format!("{}", err)
                        );
                    }
                }
            }
        }
    }
}
