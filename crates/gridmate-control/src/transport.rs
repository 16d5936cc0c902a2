use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

const REQUEST_TIMEOUT_SECS: u64 = 60;

/// HTTP method for a transport operation. The control plane only ever
/// needs these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// One transport-level request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            body: Some(body.into()),
        }
    }
}

/// A completed transport-level response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Transport failures. Always retried later via backoff, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request timed out")]
    Timeout,

    #[error("server returned HTTP {0}")]
    Status(u16),

    #[error("operation was abandoned before completion")]
    Canceled,
}

pub type TransportResult = Result<HttpResponse, TransportError>;

/// The abstract request/response primitive beneath the op channel.
///
/// Implementations must be safe to call from any task; the returned future
/// is driven on a spawned task, not inside `poll()`.
pub trait HttpTransport: Send + Sync {
    fn execute(&self, req: HttpRequest) -> BoxFuture<'static, TransportResult>;
}

/// Production transport backed by a shared `reqwest` client.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("gridmate/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport for ReqwestTransport {
    fn execute(&self, req: HttpRequest) -> BoxFuture<'static, TransportResult> {
        let client = self.client.clone();
        async move {
            let builder = match req.method {
                HttpMethod::Get => client.get(&req.url),
                HttpMethod::Post => client
                    .post(&req.url)
                    .header("Content-Type", "application/json")
                    .body(req.body.unwrap_or_default()),
            };
            let resp = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Connect(e.to_string())
                }
            })?;
            let status = resp.status().as_u16();
            if !(200..300).contains(&status) {
                return Err(TransportError::Status(status));
            }
            let body = resp
                .text()
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            Ok(HttpResponse { status, body })
        }
        .boxed()
    }
}

/// In-memory transport used by tests: canned outcomes are handed out in
/// order and every request is recorded.
#[derive(Default)]
pub struct MockTransport {
    outcomes: Mutex<Vec<TransportResult>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome for the next request.
    pub fn push_outcome(&self, outcome: TransportResult) {
        self.outcomes.lock().unwrap().push(outcome);
    }

    /// Queue a successful 200 response with the given body.
    pub fn push_body(&self, body: impl Into<String>) {
        self.push_outcome(Ok(HttpResponse {
            status: 200,
            body: body.into(),
        }));
    }

    /// Requests executed so far, oldest first.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HttpTransport for MockTransport {
    fn execute(&self, req: HttpRequest) -> BoxFuture<'static, TransportResult> {
        self.requests.lock().unwrap().push(req);
        let mut outcomes = self.outcomes.lock().unwrap();
        let outcome = if outcomes.is_empty() {
            Err(TransportError::Connect("no canned outcome".to_string()))
        } else {
            outcomes.remove(0)
        };
        async move { outcome }.boxed()
    }
}
