//! Outbound HTTP calls made from inside pipelines.
//!
//! Both `http://` and `https://` endpoints are supported; TLS goes through
//! rustls with the webpki root set. Every call carries its own timeout;
//! expiry resolves to `ExecError::Timeout` rather than hanging the pipeline.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use serde_json::Value;

use crate::errors::{ExecError, ExecResult};
use crate::options::is_web_url;

/// JSON-over-HTTP GET.
#[async_trait]
pub trait OutboundClient: Send + Sync + 'static {
    async fn get(
        &self,
        path: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> ExecResult<Value>;
}

/// hyper-backed client for a single base URL.
#[derive(Clone, Debug)]
pub struct HttpClient {
    base_url: String,
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
}

impl HttpClient {
    pub fn new(base_url: &str) -> ExecResult<Self> {
        if !is_web_url(base_url) {
            return Err(ExecError::Config(format!(
                "outbound base URL must use http:// or https://, got {}",
                base_url
            )));
        }
        base_url
            .parse::<Uri>()
            .map_err(|e| ExecError::Config(format!("invalid outbound base URL {}: {}", base_url, e)))?;

        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, path: &str, headers: &[(&str, &str)]) -> ExecResult<Request<Empty<Bytes>>> {
        let uri: Uri = format!("{}{}", self.base_url, path)
            .parse()
            .map_err(|e| ExecError::InvalidArgument(format!("invalid request path {}: {}", path, e)))?;

        let mut builder = Request::builder().method(Method::GET).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder
            .body(Empty::new())
            .map_err(|e| ExecError::InvalidArgument(format!("invalid request: {}", e)))
    }
}

#[async_trait]
impl OutboundClient for HttpClient {
    async fn get(
        &self,
        path: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> ExecResult<Value> {
        let request = self.request(path, headers)?;
        tracing::debug!(base_url = %self.base_url, path = %path, timeout_ms = timeout.as_millis() as u64, "outbound GET");

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| ExecError::Upstream(format!("GET {} failed: {}", path, e)))?;

            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| ExecError::Upstream(format!("GET {} body: {}", path, e)))?
                .to_bytes();

            if !status.is_success() {
                return Err(ExecError::Upstream(format!("GET {} returned {}", path, status)));
            }
            serde_json::from_slice::<Value>(&body)
                .map_err(|e| ExecError::Upstream(format!("GET {} returned invalid JSON: {}", path, e)))
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ExecError::Timeout(timeout))?
    }
}

/// Canned behaviour for [`StaticClient`].
#[derive(Debug, Clone)]
pub enum StaticReply {
    Respond(Value),
    Fail(ExecError),
    /// Never answer; the call times out.
    Hang,
}

/// In-memory client that answers every call the same way and remembers
/// what it was asked.
#[derive(Debug)]
pub struct StaticClient {
    reply: StaticReply,
    requests: Mutex<Vec<String>>,
}

impl StaticClient {
    pub fn new(reply: StaticReply) -> Self {
        Self {
            reply,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(value: Value) -> Self {
        Self::new(StaticReply::Respond(value))
    }

    pub fn fail(error: ExecError) -> Self {
        Self::new(StaticReply::Fail(error))
    }

    pub fn hanging() -> Self {
        Self::new(StaticReply::Hang)
    }

    /// Paths requested so far, with headers as `name: value` after a `|`.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl OutboundClient for StaticClient {
    async fn get(
        &self,
        path: &str,
        headers: &[(&str, &str)],
        timeout: Duration,
    ) -> ExecResult<Value> {
        let rendered: Vec<String> = headers.iter().map(|(n, v)| format!("{}: {}", n, v)).collect();
        self.requests
            .lock()
            .push(format!("{}|{}", path, rendered.join(",")));

        match &self.reply {
            StaticReply::Respond(value) => Ok(value.clone()),
            StaticReply::Fail(error) => Err(error.clone()),
            StaticReply::Hang => {
                tokio::time::sleep(timeout).await;
                Err(ExecError::Timeout(timeout))
            }
        }
    }
}
