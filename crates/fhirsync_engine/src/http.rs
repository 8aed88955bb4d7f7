//! HTTP transport implementation.
//!
//! This module provides an HTTP-based transport for the sync engine.
//! The actual HTTP client is abstracted via a trait so the engine does not
//! pick an HTTP stack (reqwest, ureq, a platform client, ...) for the
//! application.

use crate::error::{SyncError, SyncResult};
use crate::transport::RemoteTransport;
use fhirsync_protocol::{
    endpoints, BatchWriteRequest, BatchWriteResponse, CountRequest, CountResponse, FetchRequest,
    FetchResponse, WireMessage, WriteOutcome, WriteRequest,
};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// A failed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    /// Response status, `None` if no response arrived.
    pub status: Option<u16>,
    /// Error message.
    pub message: String,
}

impl HttpError {
    /// Creates an error for a request that got no response.
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// Creates an error for an unsuccessful response.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Returns true if repeating the request later may succeed.
    ///
    /// Network failures, throttling and server errors are retryable;
    /// other client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self.status {
            None => true,
            Some(status) => status == 408 || status == 429 || status >= 500,
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl From<HttpError> for SyncError {
    fn from(err: HttpError) -> Self {
        SyncError::Transport {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the response body.
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, HttpError>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// HTTP-based remote transport.
///
/// Uses CBOR encoding for request/response bodies.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the sync server (e.g., "https://fhir.example.org").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Cleared by `close`.
    open: AtomicBool,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            open: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the HTTP client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Returns true if the transport is open and the client is healthy.
    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    /// Closes the transport; later requests fail without being sent.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn post<Req, Res>(&self, endpoint: &str, request: &Req) -> SyncResult<Res>
    where
        Req: WireMessage,
        Res: WireMessage,
    {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SyncError::transport_fatal("transport closed"));
        }
        if !self.client.is_healthy() {
            return Err(SyncError::transport_retryable("HTTP client unavailable"));
        }

        let body = request
            .encode()
            .map_err(|e| SyncError::Protocol(format!("failed to encode request: {e}")))?;

        let url = format!("{}{}", self.base_url, endpoint);
        let response_body = self.client.post(&url, body).map_err(|e| {
            *self.last_error.write() = Some(e.to_string());
            SyncError::from(e)
        })?;

        *self.last_error.write() = None;

        Res::decode(&response_body)
            .map_err(|e| SyncError::Decode(format!("failed to decode response: {e}")))
    }
}

impl<C: HttpClient> RemoteTransport for HttpTransport<C> {
    fn fetch_changes(&self, request: &FetchRequest) -> SyncResult<FetchResponse> {
        self.post(endpoints::CHANGES, request)
    }

    fn write_record(&self, request: &WriteRequest) -> SyncResult<WriteOutcome> {
        self.post(endpoints::WRITE, request)
    }

    fn write_batch(&self, request: &BatchWriteRequest) -> SyncResult<BatchWriteResponse> {
        self.post(endpoints::BATCH, request)
    }

    fn count_changes(&self, request: &CountRequest) -> SyncResult<Option<u64>> {
        let response: CountResponse = self.post(endpoints::COUNT, request)?;
        Ok(response.total)
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a POST request and returns the response body.
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, HttpError>;
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    healthy: AtomicBool,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self {
            server,
            healthy: AtomicBool::new(true),
        }
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }

    /// Simulates losing or regaining the network.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, HttpError> {
        if !self.is_healthy() {
            return Err(HttpError::network("network unreachable"));
        }
        let path = url
            .find(endpoints::PREFIX)
            .map(|i| &url[i..])
            .unwrap_or(url);

        self.server.handle_post(path, &body)
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
