use super::model::LiveMetricEnvelope;
use crate::error::Error;
use crate::http::HttpClient;
use bytes::Bytes;
use chrono::Utc;
use http::header::{CONTENT_TYPE, EXPECT};
use http::{Method, Request, Uri};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Response header carrying the subscription flag.
pub(crate) const SUBSCRIBED_HEADER: &str = "x-ms-qps-subscribed";
const TRANSMISSION_TIME_HEADER: &str = "x-ms-qps-transmission-time";

/// Outcome of one ping or post that reached the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LiveMetricsResponse {
    /// 2xx status.
    pub(crate) ok: bool,
    /// Whether a viewer is attached; a missing header reads as `false`.
    pub(crate) subscribed: bool,
}

/// Talks to the QuickPulse service.
pub(crate) struct LiveMetricsSender {
    client: Arc<dyn HttpClient>,
    endpoint: String,
    instrumentation_key: String,
}

impl fmt::Debug for LiveMetricsSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveMetricsSender")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl LiveMetricsSender {
    pub(crate) fn new(
        client: Arc<dyn HttpClient>,
        endpoint: &str,
        instrumentation_key: &str,
    ) -> Self {
        LiveMetricsSender {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            instrumentation_key: instrumentation_key.to_string(),
        }
    }

    pub(crate) fn instrumentation_key(&self) -> &str {
        &self.instrumentation_key
    }

    /// Announce the process and ask whether anyone is watching.
    pub(crate) async fn ping(
        &self,
        envelope: &LiveMetricEnvelope,
    ) -> Result<LiveMetricsResponse, Error> {
        self.send("ping", envelope).await
    }

    /// Publish one sample.
    pub(crate) async fn post(
        &self,
        envelope: &LiveMetricEnvelope,
    ) -> Result<LiveMetricsResponse, Error> {
        self.send("post", &[envelope]).await
    }

    async fn send<T: Serialize + ?Sized>(
        &self,
        operation: &str,
        payload: &T,
    ) -> Result<LiveMetricsResponse, Error> {
        let uri: Uri = format!(
            "{}/QuickPulseService.svc/{}?ikey={}",
            self.endpoint, operation, self.instrumentation_key
        )
        .parse()
        .map_err(|err: http::uri::InvalidUri| Error::RequestFailed(Box::new(err)))?;

        let body = serde_json::to_vec(payload)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(EXPECT, "100-continue")
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .header(
                TRANSMISSION_TIME_HEADER,
                Utc::now().timestamp_millis().to_string(),
            )
            .body(Bytes::from(body))
            .map_err(|err| Error::RequestFailed(Box::new(err)))?;

        let response = self
            .client
            .send_bytes(request)
            .await
            .map_err(Error::RequestFailed)?;

        let subscribed = response
            .headers()
            .get(SUBSCRIBED_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(LiveMetricsResponse {
            ok: response.status().is_success(),
            subscribed,
        })
    }
}
