//! Upload manager.
//!
//! Sends dirty records to the server and maps the server's verdicts back
//! onto the local store. A conflict gets one resolve-and-retry per pass;
//! the retry is always an individual write against the server's version.

use crate::cancel::CancelHandle;
use crate::conflict::{ConflictLedger, ConflictPolicy};
use crate::error::{SyncError, SyncResult};
use crate::store::{LocalStore, UploadItem};
use crate::transport::RemoteTransport;
use fhirsync_protocol::{
    BatchWriteRequest, Record, RecordKey, Timestamp, WriteOutcome, WriteRequest,
};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Reason recorded for records a batch response did not mention.
pub const MISSING_BATCH_OUTCOME: &str = "no outcome in batch response";

/// How dirty records are sent to the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UploadStrategy {
    /// One write request per record; failures stay isolated per record.
    #[default]
    Individual,
    /// All dirty records in one request, demultiplexed by record key.
    ///
    /// The request is never split. A server that caps batch size refuses
    /// the whole request once the device holds more dirty records than
    /// the cap (100 on the reference server), and every record then fails
    /// with a non-retryable transport error on each pass. Use
    /// `Individual` against such servers when the backlog may grow past
    /// the cap.
    SingleBatch,
}

/// Final state of one uploaded record.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    /// The server stored the record; it is clean locally.
    Accepted {
        /// Version assigned by the server.
        version: Timestamp,
    },
    /// A conflict was resolved in favour of the server's version; nothing
    /// was uploaded and the record is clean locally.
    Merged,
    /// The record stays dirty.
    Failed(SyncError),
}

/// Upload report of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReport {
    /// The record.
    pub key: RecordKey,
    /// What happened to it.
    pub outcome: UploadOutcome,
    /// Whether the conflict resolver ran on it during upload.
    pub conflicted: bool,
}

impl UploadReport {
    fn new(key: RecordKey, outcome: UploadOutcome) -> Self {
        Self {
            key,
            outcome,
            conflicted: false,
        }
    }

    fn failed(key: RecordKey, error: SyncError) -> Self {
        Self::new(key, UploadOutcome::Failed(error))
    }

    fn conflicted(mut self) -> Self {
        self.conflicted = true;
        self
    }
}

/// Pushes dirty records and settles the outcomes locally.
pub(crate) struct UploadManager<'a, T: ?Sized, S: ?Sized> {
    transport: &'a T,
    store: &'a S,
    policy: &'a ConflictPolicy,
    cancel: &'a CancelHandle,
}

impl<'a, T, S> UploadManager<'a, T, S>
where
    T: RemoteTransport + ?Sized,
    S: LocalStore + ?Sized,
{
    /// Creates an upload manager.
    pub(crate) fn new(
        transport: &'a T,
        store: &'a S,
        policy: &'a ConflictPolicy,
        cancel: &'a CancelHandle,
    ) -> Self {
        Self {
            transport,
            store,
            policy,
            cancel,
        }
    }

    /// Uploads `items` with the given strategy.
    ///
    /// Transport failures, rejections and exhausted conflicts are reported
    /// per record. Only local store failures are returned as `Err`. Items
    /// not attempted because of cancellation get no report and stay dirty.
    pub(crate) fn push(
        &self,
        items: Vec<UploadItem>,
        strategy: UploadStrategy,
        ledger: &mut ConflictLedger,
        on_item: &mut dyn FnMut(&UploadReport),
    ) -> SyncResult<Vec<UploadReport>> {
        match strategy {
            UploadStrategy::Individual => self.push_individual(items, ledger, on_item),
            UploadStrategy::SingleBatch => self.push_batch(items, ledger, on_item),
        }
    }

    fn push_individual(
        &self,
        items: Vec<UploadItem>,
        ledger: &mut ConflictLedger,
        on_item: &mut dyn FnMut(&UploadReport),
    ) -> SyncResult<Vec<UploadReport>> {
        let mut reports = Vec::with_capacity(items.len());
        for item in items {
            if self.cancel.is_cancelled() {
                debug!("upload cancelled");
                break;
            }
            let request = WriteRequest::new(item.record.clone(), item.known_version);
            let report = match self.transport.write_record(&request) {
                Ok(outcome) => self.settle(&item, outcome, ledger)?,
                Err(err) => UploadReport::failed(item.key(), err),
            };
            log_report(&report);
            on_item(&report);
            reports.push(report);
        }
        Ok(reports)
    }

    fn push_batch(
        &self,
        items: Vec<UploadItem>,
        ledger: &mut ConflictLedger,
        on_item: &mut dyn FnMut(&UploadReport),
    ) -> SyncResult<Vec<UploadReport>> {
        if items.is_empty() || self.cancel.is_cancelled() {
            return Ok(Vec::new());
        }

        let request = BatchWriteRequest::new(
            items
                .iter()
                .map(|item| WriteRequest::new(item.record.clone(), item.known_version))
                .collect(),
        );

        let mut outcomes: HashMap<RecordKey, WriteOutcome> = match self.transport.write_batch(&request)
        {
            Ok(response) => response
                .outcomes
                .into_iter()
                .map(|entry| (entry.key, entry.outcome))
                .collect(),
            Err(err) => {
                warn!(records = items.len(), error = %err, "batch upload failed");
                let reports: Vec<_> = items
                    .iter()
                    .map(|item| UploadReport::failed(item.key(), err.clone()))
                    .collect();
                for report in &reports {
                    on_item(report);
                }
                return Ok(reports);
            }
        };

        let mut reports = Vec::with_capacity(items.len());
        for item in &items {
            let outcome = outcomes
                .remove(&item.key())
                .unwrap_or_else(|| WriteOutcome::rejected(MISSING_BATCH_OUTCOME));
            let report = self.settle(item, outcome, ledger)?;
            log_report(&report);
            on_item(&report);
            reports.push(report);
        }
        if !outcomes.is_empty() {
            warn!(
                unexpected = outcomes.len(),
                "batch response carried outcomes for records that were not sent"
            );
        }
        Ok(reports)
    }

    fn settle(
        &self,
        item: &UploadItem,
        outcome: WriteOutcome,
        ledger: &mut ConflictLedger,
    ) -> SyncResult<UploadReport> {
        let key = item.key();
        Ok(match outcome {
            WriteOutcome::Accepted { version } => {
                self.settle_accepted(&item.record, version)?;
                UploadReport::new(key, UploadOutcome::Accepted { version })
            }
            WriteOutcome::Rejected { reason } => {
                UploadReport::failed(key.clone(), SyncError::RejectedWrite { key, reason })
            }
            WriteOutcome::Conflict { server } => self.resolve_and_retry(item, server, ledger)?,
        })
    }

    fn resolve_and_retry(
        &self,
        item: &UploadItem,
        server: Record,
        ledger: &mut ConflictLedger,
    ) -> SyncResult<UploadReport> {
        let key = item.key();
        if !ledger.record(&key) {
            return Ok(UploadReport::failed(
                key.clone(),
                SyncError::ConflictExhausted { key },
            ));
        }

        let policy = self.policy;
        let resolved = self
            .store
            .read_modify_write(&key, &mut |local: Option<&Record>| {
                Some(policy.resolve(local.unwrap_or(&item.record), &server))
            })?
            .ok_or_else(|| SyncError::store(format!("resolved record {key} was not stored")))?;

        if !resolved.dirty {
            debug!(
                resource_type = %key.resource_type,
                record_id = %key.id,
                "conflict resolved in favour of the server"
            );
            return Ok(UploadReport::new(key, UploadOutcome::Merged).conflicted());
        }

        let retry = WriteRequest::new(resolved, Some(server.last_modified));
        let report = match self.transport.write_record(&retry) {
            Ok(WriteOutcome::Accepted { version }) => {
                self.settle_accepted(&retry.record, version)?;
                UploadReport::new(key, UploadOutcome::Accepted { version })
            }
            Ok(WriteOutcome::Rejected { reason }) => {
                UploadReport::failed(key.clone(), SyncError::RejectedWrite { key, reason })
            }
            Ok(WriteOutcome::Conflict { .. }) => {
                UploadReport::failed(key.clone(), SyncError::ConflictExhausted { key })
            }
            Err(err) => UploadReport::failed(key, err),
        };
        Ok(report.conflicted())
    }

    fn settle_accepted(&self, uploaded: &Record, version: Timestamp) -> SyncResult<()> {
        if !self.store.settle_upload(uploaded, version)? {
            debug!(
                resource_type = %uploaded.resource_type,
                record_id = %uploaded.id,
                version = %version,
                "record edited during upload, kept dirty on the new version"
            );
        }
        Ok(())
    }
}

fn log_report(report: &UploadReport) {
    match &report.outcome {
        UploadOutcome::Accepted { version } => debug!(
            resource_type = %report.key.resource_type,
            record_id = %report.key.id,
            version = %version,
            "upload accepted"
        ),
        UploadOutcome::Merged => {}
        UploadOutcome::Failed(err) => warn!(
            resource_type = %report.key.resource_type,
            record_id = %report.key.id,
            error = %err,
            "upload failed"
        ),
    }
}
