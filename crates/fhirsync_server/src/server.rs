//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::RequestHandler;
use crate::store::RecordStore;
use fhirsync_protocol::{
    endpoints, BatchWriteRequest, BatchWriteResponse, CountRequest, CountResponse, FetchRequest,
    FetchResponse, SyncMessage, Timestamp, WireMessage, WriteOutcome, WriteRequest,
};
use std::sync::Arc;
use tracing::warn;

/// The sync server.
///
/// Serves the change feed and write endpoints over an in-memory
/// [`RecordStore`]. Transport is left to the caller: an HTTP front end (or
/// a loopback client in tests) hands every POST to [`SyncServer::handle_post`].
///
/// # Example
///
/// ```
/// use fhirsync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
/// assert_eq!(server.record_count(), 0);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    store: Arc<RecordStore>,
}

impl SyncServer {
    /// Creates a new sync server with an empty store.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(RecordStore::new()))
    }

    /// Creates a sync server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<RecordStore>) -> Self {
        let handler = RequestHandler::new(config, Arc::clone(&store));
        Self { handler, store }
    }

    /// Handles a change feed request.
    pub fn handle_fetch(&self, request: &FetchRequest) -> ServerResult<FetchResponse> {
        self.handler.handle_fetch(request)
    }

    /// Handles a single write.
    pub fn handle_write(&self, request: &WriteRequest) -> ServerResult<WriteOutcome> {
        self.handler.handle_write(request)
    }

    /// Handles a batch write.
    pub fn handle_batch(&self, request: &BatchWriteRequest) -> ServerResult<BatchWriteResponse> {
        self.handler.handle_batch(request)
    }

    /// Handles a change count request.
    pub fn handle_count(&self, request: &CountRequest) -> ServerResult<CountResponse> {
        self.handler.handle_count(request)
    }

    /// Handles a POST to one of the sync endpoints.
    ///
    /// The body is the CBOR encoding of the endpoint's request message and
    /// the response is the CBOR encoding of its reply.
    pub fn handle_post(&self, path: &str, body: &[u8]) -> ServerResult<Vec<u8>> {
        let result = match path {
            endpoints::CHANGES => self.handle_fetch(&FetchRequest::decode(body)?)?.encode(),
            endpoints::WRITE => self.handle_write(&WriteRequest::decode(body)?)?.encode(),
            endpoints::BATCH => self.handle_batch(&BatchWriteRequest::decode(body)?)?.encode(),
            endpoints::COUNT => self.handle_count(&CountRequest::decode(body)?)?.encode(),
            other => return Err(ServerError::UnknownEndpoint(other.to_string())),
        };
        result.map_err(|err| {
            warn!(path, error = %err, "failed to encode response");
            ServerError::from(err)
        })
    }

    /// Handles a sync message (dispatches to appropriate handler).
    pub fn handle_message(&self, message: SyncMessage) -> ServerResult<SyncMessage> {
        match message {
            SyncMessage::FetchRequest(req) => self.handle_fetch(&req).map(SyncMessage::FetchResponse),
            SyncMessage::WriteRequest(req) => self.handle_write(&req).map(SyncMessage::WriteResponse),
            SyncMessage::BatchWriteRequest(req) => {
                self.handle_batch(&req).map(SyncMessage::BatchWriteResponse)
            }
            SyncMessage::CountRequest(req) => self.handle_count(&req).map(SyncMessage::CountResponse),
            other => Err(ServerError::InvalidRequest(format!(
                "unexpected message type {}",
                other.type_code()
            ))),
        }
    }

    /// Returns the record store.
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        self.handler.config()
    }

    /// Returns the number of records the server holds.
    pub fn record_count(&self) -> usize {
        self.store.len()
    }

    /// Returns the most recently assigned version.
    pub fn clock(&self) -> Timestamp {
        self.store.clock()
    }
}
