//! HTTP transport used by the ingestion and Live Metrics senders.
use async_trait::async_trait;
use std::fmt::Debug;

#[doc(no_inline)]
pub use bytes::Bytes;
#[doc(no_inline)]
pub use http::{Request, Response};

/// Boxed transport error.
pub type HttpError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A minimal interface necessary for sending requests over HTTP.
///
/// Users sometimes choose HTTP clients that rely on a certain async runtime. This
/// trait allows users to bring their choice of HTTP client.
///
/// Unlike a general purpose client wrapper, implementations must hand back
/// responses with a non-success status as `Ok`: the transmitter needs to see 206,
/// 429 and 5xx responses to decide what is retried.
#[async_trait]
pub trait HttpClient: Debug + Send + Sync {
    /// Send the specified HTTP request with `Bytes` payload.
    ///
    /// Returns the HTTP response including the status code, headers and body.
    ///
    /// Returns an error if it can't connect to the server or the request could not be
    /// completed, e.g. because of a timeout or a loss of connection.
    async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError>;
}

#[cfg(feature = "reqwest")]
mod reqwest {
    use opentelemetry::otel_debug;

    use super::{async_trait, Bytes, HttpClient, HttpError, Request, Response};

    #[async_trait]
    impl HttpClient for reqwest::Client {
        async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
            otel_debug!(name: "ReqwestClient.Send");
            let request = request.try_into()?;
            let mut response = self.execute(request).await?;
            let headers = std::mem::take(response.headers_mut());
            let mut http_response = Response::builder()
                .status(response.status())
                .body(response.bytes().await?)?;
            *http_response.headers_mut() = headers;

            Ok(http_response)
        }
    }

    #[cfg(all(feature = "reqwest-blocking-client", not(target_arch = "wasm32")))]
    #[async_trait]
    impl HttpClient for reqwest::blocking::Client {
        async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
            otel_debug!(name: "ReqwestBlockingClient.Send");
            let request = request.try_into()?;
            let mut response = self.execute(request)?;
            let headers = std::mem::take(response.headers_mut());
            let mut http_response = Response::builder()
                .status(response.status())
                .body(response.bytes()?)?;
            *http_response.headers_mut() = headers;

            Ok(http_response)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_http_client {
    use super::{async_trait, Bytes, HttpClient, HttpError, Request, Response};
    use std::collections::VecDeque;
    use std::fmt::Debug;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// A scripted reply for [`TestHttpClient`].
    #[derive(Clone, Debug)]
    pub(crate) enum Reply {
        Status(u16, &'static str),
        StatusWithHeader(u16, &'static str, &'static str),
        TransportError,
    }

    /// Records every request and answers from a script; once the script is
    /// exhausted the fallback reply is used.
    #[derive(Clone)]
    pub(crate) struct TestHttpClient {
        script: Arc<Mutex<VecDeque<Reply>>>,
        fallback: Reply,
        requests: Arc<Mutex<Vec<Request<Bytes>>>>,
        delay: Duration,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl Debug for TestHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("test http client")
        }
    }

    impl TestHttpClient {
        pub(crate) fn new(fallback: Reply) -> Self {
            TestHttpClient {
                script: Arc::new(Mutex::new(VecDeque::new())),
                fallback,
                requests: Arc::new(Mutex::new(Vec::new())),
                delay: Duration::ZERO,
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Block every send for `delay` before answering.
        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Highest number of sends observed running at the same time.
        pub(crate) fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        pub(crate) fn push(&self, reply: Reply) {
            self.script.lock().unwrap().push_back(reply);
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub(crate) fn requests_to(&self, path_suffix: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.uri().path().ends_with(path_suffix))
                .count()
        }

        pub(crate) fn bodies(&self) -> Vec<serde_json::Value> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| serde_json::from_slice(r.body()).unwrap())
                .collect()
        }

        pub(crate) fn last_request<T>(&self, f: impl FnOnce(&Request<Bytes>) -> T) -> T {
            f(self.requests.lock().unwrap().last().unwrap())
        }
    }

    #[async_trait]
    impl HttpClient for TestHttpClient {
        async fn send_bytes(&self, request: Request<Bytes>) -> Result<Response<Bytes>, HttpError> {
            self.requests.lock().unwrap().push(request);
            if !self.delay.is_zero() {
                let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(running, Ordering::SeqCst);
                std::thread::sleep(self.delay);
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            let reply = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            match reply {
                Reply::Status(status, body) => Ok(Response::builder()
                    .status(status)
                    .body(Bytes::from_static(body.as_bytes()))?),
                Reply::StatusWithHeader(status, header, value) => Ok(Response::builder()
                    .status(status)
                    .header(header, value)
                    .body(Bytes::new())?),
                Reply::TransportError => Err("connection refused".into()),
            }
        }
    }
}
