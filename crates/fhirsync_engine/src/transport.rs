//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use fhirsync_protocol::{
    BatchEntryOutcome, BatchWriteRequest, BatchWriteResponse, CountRequest, FetchRequest,
    FetchResponse, RecordKey, ResourceType, Timestamp, WriteOutcome, WriteRequest,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A remote transport handles network communication with the server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, loopback, mock for testing, etc.). Every call is
/// a suspension point of the sync pass.
pub trait RemoteTransport: Send + Sync {
    /// Fetches one page of the change feed.
    fn fetch_changes(&self, request: &FetchRequest) -> SyncResult<FetchResponse>;

    /// Writes one record.
    fn write_record(&self, request: &WriteRequest) -> SyncResult<WriteOutcome>;

    /// Writes several records in one request.
    fn write_batch(&self, request: &BatchWriteRequest) -> SyncResult<BatchWriteResponse>;

    /// Counts the records a fetch would return, if the server can tell.
    ///
    /// Only used for progress reporting.
    fn count_changes(&self, _request: &CountRequest) -> SyncResult<Option<u64>> {
        Ok(None)
    }
}

impl<T: RemoteTransport + ?Sized> RemoteTransport for Arc<T> {
    fn fetch_changes(&self, request: &FetchRequest) -> SyncResult<FetchResponse> {
        (**self).fetch_changes(request)
    }

    fn write_record(&self, request: &WriteRequest) -> SyncResult<WriteOutcome> {
        (**self).write_record(request)
    }

    fn write_batch(&self, request: &BatchWriteRequest) -> SyncResult<BatchWriteResponse> {
        (**self).write_batch(request)
    }

    fn count_changes(&self, request: &CountRequest) -> SyncResult<Option<u64>> {
        (**self).count_changes(request)
    }
}

type FetchHook = Box<dyn Fn(&FetchRequest) + Send + Sync>;
type WriteHook = Box<dyn Fn(&WriteRequest) + Send + Sync>;

/// A scripted transport for testing.
///
/// Fetches pop pages queued per resource type; an exhausted queue answers
/// with an empty final page. Writes pop outcomes queued per record and
/// default to acceptance at a fresh version. Batch writes answer with a
/// queued response or, if none is queued, with per-record scripted
/// outcomes.
pub struct MockTransport {
    connected: AtomicBool,
    pages: Mutex<HashMap<ResourceType, VecDeque<SyncResult<FetchResponse>>>>,
    outcomes: Mutex<HashMap<RecordKey, VecDeque<SyncResult<WriteOutcome>>>>,
    batch_responses: Mutex<VecDeque<SyncResult<BatchWriteResponse>>>,
    counts: Mutex<HashMap<ResourceType, u64>>,
    fetches: Mutex<Vec<FetchRequest>>,
    writes: Mutex<Vec<WriteRequest>>,
    batches: Mutex<Vec<BatchWriteRequest>>,
    fetch_hook: Mutex<Option<FetchHook>>,
    write_hook: Mutex<Option<WriteHook>>,
    next_version: AtomicU64,
}

impl MockTransport {
    /// Creates a connected mock transport with nothing scripted.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            pages: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(HashMap::new()),
            batch_responses: Mutex::new(VecDeque::new()),
            counts: Mutex::new(HashMap::new()),
            fetches: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            fetch_hook: Mutex::new(None),
            write_hook: Mutex::new(None),
            next_version: AtomicU64::new(1_000),
        }
    }

    /// Queues a page for a resource type.
    pub fn push_page(&self, resource_type: impl Into<ResourceType>, page: FetchResponse) {
        self.pages
            .lock()
            .entry(resource_type.into())
            .or_default()
            .push_back(Ok(page));
    }

    /// Queues a fetch failure for a resource type.
    pub fn push_fetch_error(&self, resource_type: impl Into<ResourceType>, error: SyncError) {
        self.pages
            .lock()
            .entry(resource_type.into())
            .or_default()
            .push_back(Err(error));
    }

    /// Queues the outcome of the next write of a record.
    pub fn push_outcome(&self, key: RecordKey, outcome: WriteOutcome) {
        self.outcomes
            .lock()
            .entry(key)
            .or_default()
            .push_back(Ok(outcome));
    }

    /// Queues a transport failure for the next write of a record.
    pub fn push_write_error(&self, key: RecordKey, error: SyncError) {
        self.outcomes
            .lock()
            .entry(key)
            .or_default()
            .push_back(Err(error));
    }

    /// Queues the response of the next batch write.
    pub fn push_batch_response(&self, response: SyncResult<BatchWriteResponse>) {
        self.batch_responses.lock().push_back(response);
    }

    /// Sets the change count reported for a resource type.
    pub fn set_count(&self, resource_type: impl Into<ResourceType>, count: u64) {
        self.counts.lock().insert(resource_type.into(), count);
    }

    /// Installs a hook called at the start of every fetch.
    pub fn on_fetch(&self, hook: impl Fn(&FetchRequest) + Send + Sync + 'static) {
        *self.fetch_hook.lock() = Some(Box::new(hook));
    }

    /// Installs a hook called before every write is answered, including
    /// each write of a batch.
    pub fn on_write(&self, hook: impl Fn(&WriteRequest) + Send + Sync + 'static) {
        *self.write_hook.lock() = Some(Box::new(hook));
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns true if the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns every fetch request received so far.
    pub fn fetches(&self) -> Vec<FetchRequest> {
        self.fetches.lock().clone()
    }

    /// Returns every single write received so far.
    pub fn writes(&self) -> Vec<WriteRequest> {
        self.writes.lock().clone()
    }

    /// Returns every batch write received so far.
    pub fn batches(&self) -> Vec<BatchWriteRequest> {
        self.batches.lock().clone()
    }

    fn check_connected(&self) -> SyncResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(SyncError::transport_retryable("not connected"))
        }
    }

    fn run_write_hook(&self, request: &WriteRequest) {
        if let Some(hook) = self.write_hook.lock().as_ref() {
            hook(request);
        }
    }

    fn next_outcome(&self, key: &RecordKey) -> SyncResult<WriteOutcome> {
        let scripted = self
            .outcomes
            .lock()
            .get_mut(key)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or_else(|| {
            let version = self.next_version.fetch_add(1, Ordering::SeqCst);
            Ok(WriteOutcome::Accepted {
                version: Timestamp::from_millis(version),
            })
        })
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteTransport for MockTransport {
    fn fetch_changes(&self, request: &FetchRequest) -> SyncResult<FetchResponse> {
        if let Some(hook) = self.fetch_hook.lock().as_ref() {
            hook(request);
        }
        self.check_connected()?;
        self.fetches.lock().push(request.clone());

        self.pages
            .lock()
            .get_mut(&request.resource_type)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| Ok(FetchResponse::last(Vec::new())))
    }

    fn write_record(&self, request: &WriteRequest) -> SyncResult<WriteOutcome> {
        self.check_connected()?;
        self.writes.lock().push(request.clone());
        self.run_write_hook(request);
        self.next_outcome(&request.record.key())
    }

    fn write_batch(&self, request: &BatchWriteRequest) -> SyncResult<BatchWriteResponse> {
        self.check_connected()?;
        self.batches.lock().push(request.clone());
        for write in &request.writes {
            self.run_write_hook(write);
        }

        if let Some(response) = self.batch_responses.lock().pop_front() {
            return response;
        }

        let outcomes = request
            .writes
            .iter()
            .map(|write| {
                let key = write.record.key();
                let outcome = self.next_outcome(&key)?;
                Ok(BatchEntryOutcome { key, outcome })
            })
            .collect::<SyncResult<Vec<_>>>()?;
        Ok(BatchWriteResponse::new(outcomes))
    }

    fn count_changes(&self, request: &CountRequest) -> SyncResult<Option<u64>> {
        self.check_connected()?;
        Ok(self.counts.lock().get(&request.resource_type).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhirsync_testkit::{patient, patient_key, patient_type, ts};

    #[test]
    fn mock_transport_connection() {
        let transport = MockTransport::new();
        assert!(transport.is_connected());

        transport.set_connected(false);
        let result = transport.fetch_changes(&FetchRequest::new(patient_type(), None, 10));
        assert!(matches!(
            result,
            Err(SyncError::Transport {
                retryable: true,
                ..
            })
        ));
    }

    #[test]
    fn pages_are_served_in_order_then_exhausted() {
        let transport = MockTransport::new();
        transport.push_page(
            "Patient",
            FetchResponse::new(vec![patient("p1", 1, "a")], Some("c1".into())),
        );
        transport.push_page("Patient", FetchResponse::last(vec![patient("p2", 2, "b")]));

        let request = FetchRequest::new(patient_type(), None, 10);
        let first = transport.fetch_changes(&request).unwrap();
        assert_eq!(first.next_cursor.as_deref(), Some("c1"));
        let second = transport.fetch_changes(&request).unwrap();
        assert_eq!(second.records[0].id, "p2");
        let third = transport.fetch_changes(&request).unwrap();
        assert!(third.records.is_empty());
        assert!(third.next_cursor.is_none());
        assert_eq!(transport.fetches().len(), 3);
    }

    #[test]
    fn writes_default_to_accepted() {
        let transport = MockTransport::new();
        transport.push_outcome(patient_key("p1"), WriteOutcome::rejected("no"));

        let request = WriteRequest::new(patient("p1", 1, "a"), Some(ts(1)));
        assert_eq!(
            transport.write_record(&request).unwrap(),
            WriteOutcome::rejected("no")
        );
        assert!(transport.write_record(&request).unwrap().is_accepted());
        assert_eq!(transport.writes().len(), 2);
    }

    #[test]
    fn batch_without_script_uses_per_record_outcomes() {
        let transport = MockTransport::new();
        transport.push_outcome(patient_key("p2"), WriteOutcome::rejected("invalid"));

        let request = BatchWriteRequest::new(vec![
            WriteRequest::new(patient("p1", 1, "a"), None),
            WriteRequest::new(patient("p2", 1, "b"), None),
        ]);
        let response = transport.write_batch(&request).unwrap();
        assert!(response.outcomes[0].outcome.is_accepted());
        assert_eq!(response.outcomes[1].key, patient_key("p2"));
        assert!(!response.outcomes[1].outcome.is_accepted());
    }

    #[test]
    fn count_is_unknown_unless_set() {
        let transport = MockTransport::new();
        let request = CountRequest::new(patient_type(), None);
        assert_eq!(transport.count_changes(&request).unwrap(), None);

        transport.set_count("Patient", 12);
        assert_eq!(transport.count_changes(&request).unwrap(), Some(12));
    }
}
