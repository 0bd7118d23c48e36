//! reqwest-backed [`Transport`] for talking to PostgREST.
//!
//! Each request runs on a tokio task and reports back through a oneshot
//! channel, so issuing and polling never block the caller. The underlying
//! client is reused across requests for connection pooling.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::transport::{HttpRequest, HttpResponse, InFlight, Readiness, Transport};

/// Errors that can occur during HTTP client operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    /// HTTP request failed before a response arrived
    #[error("HTTP request failed: {0}")]
    Request(String),

    /// Request timeout
    #[error("Request timed out")]
    Timeout,

    /// The request task ended without reporting a result
    #[error("Request abandoned")]
    Abandoned,

    /// Client configuration error
    #[error("Client configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err.to_string())
        }
    }
}

/// HTTP transport for a single PostgREST server.
pub struct HttpTransport {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// Base URL without a trailing slash
    base_url: String,

    /// Request timeout duration
    timeout: Duration,

    /// Runtime the request tasks are spawned on
    runtime: Handle,
}

impl HttpTransport {
    /// Create a transport for `base_url`.
    ///
    /// Must be called from within a tokio runtime; request tasks are spawned
    /// on that runtime.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if there is no runtime or the HTTP
    /// client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let runtime = Handle::try_current().map_err(|e| ClientError::Config(e.to_string()))?;

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            runtime,
        })
    }

    /// Get the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn build(&self, request: HttpRequest) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .request(request.method, url)
            .timeout(self.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        builder
    }
}

impl Transport for HttpTransport {
    fn issue(&mut self, request: HttpRequest) -> Result<Box<dyn InFlight>, ClientError> {
        debug!(
            method = %request.method,
            path = %request.path,
            bytes = request.body.as_ref().map_or(0, String::len),
            "Issuing request"
        );

        let builder = self.build(request);
        let (tx, rx) = oneshot::channel();
        let task = self.runtime.spawn(async move {
            let _ = tx.send(execute(builder).await);
        });

        Ok(Box::new(HttpInFlight { rx, task }))
    }
}

async fn execute(builder: RequestBuilder) -> Result<HttpResponse, ClientError> {
    let response = builder.send().await?;
    let status = response.status();
    let body = response.text().await?;
    Ok(HttpResponse { status, body })
}

struct HttpInFlight {
    rx: oneshot::Receiver<Result<HttpResponse, ClientError>>,
    task: JoinHandle<()>,
}

impl InFlight for HttpInFlight {
    fn poll(&mut self) -> Readiness {
        match self.rx.try_recv() {
            Ok(Ok(response)) => Readiness::Ready(response),
            Ok(Err(err)) => Readiness::Failed(err),
            Err(TryRecvError::Empty) => Readiness::Pending,
            Err(TryRecvError::Closed) => Readiness::Failed(ClientError::Abandoned),
        }
    }
}

impl Drop for HttpInFlight {
    fn drop(&mut self) {
        self.task.abort();
    }
}
