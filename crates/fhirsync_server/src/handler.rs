//! Request handlers for sync endpoints.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::store::{Cursor, RecordStore};
use fhirsync_protocol::{
    BatchEntryOutcome, BatchWriteRequest, BatchWriteResponse, CountRequest, CountResponse,
    FetchRequest, FetchResponse, ScopeFilter, WriteOutcome, WriteRequest,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Filter selecting records by id, with comma-separated values.
pub const ID_FILTER: &str = "_id";

/// Handler for sync requests.
pub struct RequestHandler {
    config: ServerConfig,
    store: Arc<RecordStore>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(config: ServerConfig, store: Arc<RecordStore>) -> Self {
        Self { config, store }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Handles a change feed request.
    pub fn handle_fetch(&self, request: &FetchRequest) -> ServerResult<FetchResponse> {
        if request.resource_type.as_str().is_empty() {
            return Err(ServerError::InvalidRequest("empty resource type".into()));
        }
        let ids = id_selection(&request.filters)?;
        let cursor = request.cursor.as_deref().map(Cursor::parse).transpose()?;
        let limit = request.limit.clamp(1, self.config.max_page_size) as usize;

        let (records, more) = self.store.changes(
            &request.resource_type,
            request.since,
            cursor.as_ref(),
            limit,
            ids.as_ref(),
        );
        let next_cursor = if more {
            records.last().map(|record| Cursor::after(record).encode())
        } else {
            None
        };

        debug!(
            resource_type = %request.resource_type,
            records = records.len(),
            more,
            "served change page"
        );
        Ok(FetchResponse::new(records, next_cursor))
    }

    /// Handles a single write.
    ///
    /// Empty bodies and records refused by the validator are rejected;
    /// everything else goes through the optimistic-concurrency check.
    pub fn handle_write(&self, request: &WriteRequest) -> ServerResult<WriteOutcome> {
        let record = &request.record;
        if record.id.is_empty() || record.resource_type.as_str().is_empty() {
            return Err(ServerError::InvalidRequest(
                "record without type or id".into(),
            ));
        }
        if record.body.is_empty() {
            return Ok(WriteOutcome::rejected("empty record body"));
        }
        if let Err(reason) = self.config.validate(record) {
            info!(record = %record.key(), %reason, "write rejected");
            return Ok(WriteOutcome::rejected(reason));
        }

        let outcome = self.store.write(record, request.known_version);
        match &outcome {
            WriteOutcome::Accepted { version } => {
                debug!(record = %record.key(), %version, "write accepted")
            }
            WriteOutcome::Conflict { server } => debug!(
                record = %record.key(),
                known_version = ?request.known_version,
                server_version = %server.last_modified,
                "write conflict"
            ),
            WriteOutcome::Rejected { .. } => {}
        }
        Ok(outcome)
    }

    /// Handles a batch write.
    ///
    /// Each write is settled on its own; a malformed entry is rejected
    /// without affecting the others.
    pub fn handle_batch(&self, request: &BatchWriteRequest) -> ServerResult<BatchWriteResponse> {
        if request.writes.len() > self.config.max_batch_size {
            return Err(ServerError::BatchTooLarge {
                size: request.writes.len(),
                max: self.config.max_batch_size,
            });
        }

        let mut outcomes = Vec::with_capacity(request.writes.len());
        for write in &request.writes {
            let outcome = match self.handle_write(write) {
                Ok(outcome) => outcome,
                Err(err) if err.is_client_error() => WriteOutcome::rejected(err.to_string()),
                Err(err) => return Err(err),
            };
            outcomes.push(BatchEntryOutcome {
                key: write.record.key(),
                outcome,
            });
        }
        Ok(BatchWriteResponse::new(outcomes))
    }

    /// Handles a change count request.
    pub fn handle_count(&self, request: &CountRequest) -> ServerResult<CountResponse> {
        let ids = id_selection(&request.filters)?;
        let total = self
            .store
            .count(&request.resource_type, request.since, ids.as_ref());
        Ok(CountResponse { total: Some(total) })
    }
}

/// Turns the request filters into an id selection.
///
/// Several `_id` filters intersect. Any other filter name is refused.
fn id_selection(filters: &[ScopeFilter]) -> ServerResult<Option<HashSet<String>>> {
    let mut selection: Option<HashSet<String>> = None;
    for filter in filters {
        if filter.name != ID_FILTER {
            return Err(ServerError::UnsupportedFilter(filter.name.clone()));
        }
        let ids: HashSet<String> = filter
            .value
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect();
        selection = Some(match selection {
            None => ids,
            Some(current) => current.intersection(&ids).cloned().collect(),
        });
    }
    Ok(selection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhirsync_protocol::{Record, Timestamp};
    use fhirsync_testkit::prelude::*;

    fn create_handler(config: ServerConfig, records: Vec<Record>) -> RequestHandler {
        let store = Arc::new(RecordStore::new());
        for record in records {
            store.insert(record);
        }
        RequestHandler::new(config, store)
    }

    #[test]
    fn fetch_empty() {
        let handler = create_handler(ServerConfig::default(), vec![]);
        let page = handler
            .handle_fetch(&FetchRequest::new(patient_type(), None, 10))
            .unwrap();
        assert!(page.records.is_empty());
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn fetch_follows_cursor() {
        let handler = create_handler(ServerConfig::default(), record_run("Patient", 5, 1));

        let first = handler
            .handle_fetch(&FetchRequest::new(patient_type(), None, 3))
            .unwrap();
        assert_eq!(first.records.len(), 3);
        assert_eq!(first.next_cursor.as_deref(), Some("3:patient-2"));

        let second = handler
            .handle_fetch(&FetchRequest::new(patient_type(), None, 3).with_cursor(first.next_cursor))
            .unwrap();
        assert_eq!(second.records.len(), 2);
        assert!(second.next_cursor.is_none());
    }

    #[test]
    fn fetch_caps_page_size() {
        let config = ServerConfig::default().with_max_page_size(2);
        let handler = create_handler(config, record_run("Patient", 5, 1));

        let page = handler
            .handle_fetch(&FetchRequest::new(patient_type(), None, 500))
            .unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(page.next_cursor.is_some());
    }

    #[test]
    fn fetch_rejects_bad_cursor_and_filters() {
        let handler = create_handler(ServerConfig::default(), vec![]);

        let bad_cursor = FetchRequest::new(patient_type(), None, 10).with_cursor(Some("x".into()));
        assert!(matches!(
            handler.handle_fetch(&bad_cursor),
            Err(ServerError::InvalidCursor(_))
        ));

        let bad_filter = FetchRequest::new(patient_type(), None, 10)
            .with_filters(vec![ScopeFilter::new("name", "smith")]);
        assert!(matches!(
            handler.handle_fetch(&bad_filter),
            Err(ServerError::UnsupportedFilter(_))
        ));
    }

    #[test]
    fn id_filters_intersect() {
        let handler = create_handler(ServerConfig::default(), record_run("Patient", 4, 1));
        let request = FetchRequest::new(patient_type(), None, 10).with_filters(vec![
            ScopeFilter::new(ID_FILTER, "patient-0, patient-1,patient-2"),
            ScopeFilter::new(ID_FILTER, "patient-1,patient-2,patient-3"),
        ]);

        let page = handler.handle_fetch(&request).unwrap();
        let ids: Vec<_> = page.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["patient-1", "patient-2"]);

        let count = handler
            .handle_count(&CountRequest::new(patient_type(), None).with_filters(request.filters))
            .unwrap();
        assert_eq!(count.total, Some(2));
    }

    #[test]
    fn write_rejects_empty_body() {
        let handler = create_handler(ServerConfig::default(), vec![]);
        let outcome = handler
            .handle_write(&WriteRequest::new(patient("p1", 0, ""), None))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::rejected("empty record body"));
    }

    #[test]
    fn write_runs_validator() {
        let config = ServerConfig::default().with_validator(|record| {
            if record.body.starts_with(b"{") {
                Ok(())
            } else {
                Err("body is not a JSON object".into())
            }
        });
        let handler = create_handler(config, vec![]);

        let outcome = handler
            .handle_write(&WriteRequest::new(patient("p1", 0, "plain"), None))
            .unwrap();
        assert_eq!(outcome, WriteOutcome::rejected("body is not a JSON object"));

        let outcome = handler
            .handle_write(&WriteRequest::new(patient("p1", 0, "{}"), None))
            .unwrap();
        assert!(outcome.is_accepted());
    }

    #[test]
    fn write_without_id_is_invalid() {
        let handler = create_handler(ServerConfig::default(), vec![]);
        let record = Record::new("Patient", "", Timestamp::ZERO, b"x".to_vec());
        assert!(matches!(
            handler.handle_write(&WriteRequest::new(record, None)),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn batch_settles_each_write() {
        let handler = create_handler(ServerConfig::default(), vec![patient("p2", 5, "server")]);
        let request = BatchWriteRequest::new(vec![
            WriteRequest::new(patient("p1", 0, "new"), None),
            WriteRequest::new(patient("p2", 0, "stale"), Some(ts(3))),
            WriteRequest::new(patient("p3", 0, ""), None),
            WriteRequest::new(Record::new("Patient", "", Timestamp::ZERO, b"x".to_vec()), None),
        ]);

        let response = handler.handle_batch(&request).unwrap();
        assert_eq!(response.outcomes.len(), 4);
        assert!(response.outcomes[0].outcome.is_accepted());
        assert!(matches!(
            response.outcomes[1].outcome,
            WriteOutcome::Conflict { .. }
        ));
        assert_eq!(
            response.outcomes[2].outcome,
            WriteOutcome::rejected("empty record body")
        );
        assert!(matches!(
            response.outcomes[3].outcome,
            WriteOutcome::Rejected { .. }
        ));
    }

    #[test]
    fn batch_too_large() {
        let handler = create_handler(ServerConfig::default().with_max_batch_size(1), vec![]);
        let request = BatchWriteRequest::new(vec![
            WriteRequest::new(patient("p1", 0, "a"), None),
            WriteRequest::new(patient("p2", 0, "b"), None),
        ]);
        assert!(matches!(
            handler.handle_batch(&request),
            Err(ServerError::BatchTooLarge { size: 2, max: 1 })
        ));
    }
}
