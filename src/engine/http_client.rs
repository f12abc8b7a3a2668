use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use http::{HeaderMap, Method, Request};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::stats::Tags;

/// Default per-request timeout applied by `VuContext`.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Bytes>,
    pub headers: Vec<(String, String)>,
    /// Overrides the VU's default request timeout.
    pub timeout: Option<Duration>,
    /// Value of the `name` tag; defaults to the URL.
    pub name: Option<String>,
    pub tags: Tags,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: Vec::new(),
            timeout: None,
            name: None,
            tags: Tags::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the body and set `Content-Type: application/json`.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        Ok(self.header("Content-Type", "application/json").body(body))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Approximate size on the wire: request line, headers and body.
    pub fn wire_size(&self) -> usize {
        let mut size = self.method.as_str().len() + 1 + self.url.len() + 11;
        for (k, v) in &self.headers {
            size += k.len() + 2 + v.len() + 2;
        }
        size + 2 + self.body.as_ref().map_or(0, |b| b.len())
    }
}

/// What a transport hands back for a completed exchange.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Approximate size on the wire: status line, headers and body.
    pub fn wire_size(&self) -> usize {
        let mut size = 15;
        for (k, v) in &self.headers {
            size += k.as_str().len() + 2 + v.len() + 2;
        }
        size + 2 + self.body.len()
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("failed to read response body: {0}")]
    Body(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// The HTTP collaborator. Implementations are shared by every VU.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<TransportResponse, TransportError>;
}

/// Response as seen by iteration code. Transport failures show up as
/// `status == 0` with `error` set.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub method: Method,
    pub url: String,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub duration: Duration,
    pub error: Option<String>,
}

impl HttpResponse {
    pub(crate) fn from_transport(
        request: &HttpRequest,
        result: Result<TransportResponse, TransportError>,
        duration: Duration,
    ) -> Self {
        match result {
            Ok(response) => Self {
                method: request.method.clone(),
                url: request.url.clone(),
                status: response.status,
                headers: response.headers,
                body: response.body,
                duration,
                error: None,
            },
            Err(e) => Self {
                method: request.method.clone(),
                url: request.url.clone(),
                status: 0,
                headers: HeaderMap::new(),
                body: Bytes::new(),
                duration,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Pooled hyper client speaking HTTP/1.1 and HTTP/2 over plain TCP or rustls.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HyperTransport {
    /// Sizes the idle pool and HTTP/2 windows for the expected concurrency.
    pub fn for_vus(max_vus: u64) -> Self {
        let pool_size = (max_vus as usize).clamp(16, 2000);
        // Smaller windows at high concurrency keep memory bounded.
        let (conn_window, stream_window): (u32, u32) = if max_vus > 5000 {
            (128 * 1024, 64 * 1024)
        } else if max_vus > 2000 {
            (256 * 1024, 128 * 1024)
        } else {
            (512 * 1024, 256 * 1024)
        };

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let tls = match hyper_rustls::HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                warn!(error = %e, "no native root certificates; HTTPS targets will fail verification");
                let config = rustls::ClientConfig::builder()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth();
                hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(config)
            }
        };
        let https = tls
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool_size)
            .http2_initial_connection_window_size(conn_window)
            .http2_initial_stream_window_size(stream_window)
            .build(https);

        Self { client }
    }
}

#[async_trait]
impl HttpTransport for HyperTransport {
    async fn send(&self, request: &HttpRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(request.url.as_str());
        for (k, v) in &request.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        let req = builder
            .body(Full::new(request.body.clone().unwrap_or_default()))
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| TransportError::Request(error_chain(&e)))?;

        // The body is always read to completion so the connection can be reused.
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| TransportError::Body(e.to_string()))?
            .to_bytes();

        Ok(TransportResponse {
            status: parts.status.as_u16(),
            headers: parts.headers,
            body,
        })
    }
}

/// hyper's client errors put the useful part ("connection refused") in the source chain.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    type Handler =
        Box<dyn Fn(&HttpRequest) -> Result<TransportResponse, TransportError> + Send + Sync>;

    /// One request as the mock saw it. `started`/`finished` come from a
    /// shared event counter, so they order requests across VUs.
    #[derive(Debug, Clone)]
    pub(crate) struct LoggedRequest {
        pub method: Method,
        pub url: String,
        pub body: Option<Bytes>,
        pub headers: Vec<(String, String)>,
        pub started: u64,
        pub finished: u64,
    }

    impl LoggedRequest {
        pub(crate) fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }

        pub(crate) fn body_text(&self) -> String {
            self.body
                .as_ref()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default()
        }
    }

    /// Scripted transport: answers through a closure after a fixed latency.
    pub(crate) struct MockTransport {
        handler: Handler,
        latency: Duration,
        clock: AtomicU64,
        log: Mutex<Vec<LoggedRequest>>,
    }

    impl MockTransport {
        pub(crate) fn new(
            handler: impl Fn(&HttpRequest) -> Result<TransportResponse, TransportError>
                + Send
                + Sync
                + 'static,
        ) -> Self {
            Self {
                handler: Box::new(handler),
                latency: Duration::ZERO,
                clock: AtomicU64::new(0),
                log: Mutex::new(Vec::new()),
            }
        }

        /// Every request gets `status` with a small JSON body.
        pub(crate) fn status(status: u16) -> Self {
            Self::new(move |_| Ok(TransportResponse::new(status, "[{\"id\":1}]")))
        }

        pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        pub(crate) fn requests(&self) -> Vec<LoggedRequest> {
            self.log.lock().clone()
        }
    }

    #[async_trait]
    impl HttpTransport for MockTransport {
        async fn send(&self, request: &HttpRequest) -> Result<TransportResponse, TransportError> {
            let started = self.clock.fetch_add(1, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let result = (self.handler)(request);
            let finished = self.clock.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push(LoggedRequest {
                method: request.method.clone(),
                url: request.url.clone(),
                body: request.body.clone(),
                headers: request.headers.clone(),
                started,
                finished,
            });
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let req = HttpRequest::post("http://localhost/tickets")
            .json(&serde_json::json!({"customer_id": 1}))
            .unwrap()
            .name("create")
            .tag("flow", "write");
        assert_eq!(req.method, Method::POST);
        assert_eq!(req.body.as_deref(), Some(&b"{\"customer_id\":1}"[..]));
        assert_eq!(
            req.headers,
            vec![("Content-Type".to_string(), "application/json".to_string())]
        );
        assert_eq!(req.name.as_deref(), Some("create"));
        assert_eq!(req.tags.get("flow").map(String::as_str), Some("write"));
        assert!(req.wire_size() > req.url.len());
    }

    #[test]
    fn test_failed_response_has_status_zero() {
        let req = HttpRequest::get("http://localhost/");
        let resp = HttpResponse::from_transport(
            &req,
            Err(TransportError::Request("connection refused".into())),
            Duration::from_millis(3),
        );
        assert_eq!(resp.status, 0);
        assert!(!resp.is_success());
        assert_eq!(resp.error.as_deref(), Some("request failed: connection refused"));
    }

    #[test]
    fn test_response_helpers() {
        let req = HttpRequest::get("http://localhost/");
        let resp = HttpResponse::from_transport(
            &req,
            Ok(TransportResponse::new(200, "[1,2,3]")),
            Duration::from_millis(1),
        );
        assert!(resp.is_success());
        assert_eq!(resp.text(), "[1,2,3]");
        assert_eq!(resp.json::<Vec<u32>>().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_hyper_transport_reports_connection_errors() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let transport = HyperTransport::for_vus(1);
        // Reserve a free port, then release it so nothing listens there.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = transport
            .send(&HttpRequest::get(format!("http://127.0.0.1:{}/", port)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Request(_)));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let transport = HyperTransport::for_vus(1);
        let err = transport
            .send(&HttpRequest::get("not a url"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest(_)));
    }
}
