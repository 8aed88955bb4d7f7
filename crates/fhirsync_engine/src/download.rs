//! Download manager.
//!
//! Turns "changes of a type since its watermark" into a chain of page
//! fetches and applies each page to the local store. A page is applied
//! completely before the next one is fetched; a failure on any page stops
//! the type for this pass and leaves its watermark untouched.

use crate::cancel::CancelHandle;
use crate::config::SyncConfig;
use crate::conflict::ConflictLedger;
use crate::error::{SyncError, SyncResult};
use crate::store::LocalStore;
use crate::transport::RemoteTransport;
use fhirsync_protocol::{
    FetchRequest, FetchResponse, Record, ResourceType, ScopeFilter, Timestamp,
};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Lazy sequence of change-feed pages for one resource type.
///
/// Each fetch carries the cursor returned by the previous page. The
/// sequence ends after the page without a cursor or after the first error.
/// A cursor the server already handed out in this walk is reported as a
/// decode error instead of being followed again.
pub struct Pages<'a, T: RemoteTransport + ?Sized> {
    transport: &'a T,
    request: FetchRequest,
    seen_cursors: HashSet<String>,
    finished: bool,
}

/// Starts a walk over the changes of `resource_type` after `since`.
///
/// Nothing is fetched until the first page is requested.
pub fn pull<T: RemoteTransport + ?Sized>(
    transport: &T,
    resource_type: ResourceType,
    since: Option<Timestamp>,
    page_size: u32,
    filters: Vec<ScopeFilter>,
) -> Pages<'_, T> {
    Pages {
        transport,
        request: FetchRequest::new(resource_type, since, page_size).with_filters(filters),
        seen_cursors: HashSet::new(),
        finished: false,
    }
}

impl<T: RemoteTransport + ?Sized> Pages<'_, T> {
    fn fetch(&mut self) -> SyncResult<FetchResponse> {
        let page = self.transport.fetch_changes(&self.request)?;
        page.validate(&self.request.resource_type)?;

        match &page.next_cursor {
            None => self.finished = true,
            Some(cursor) => {
                if !self.seen_cursors.insert(cursor.clone()) {
                    return Err(SyncError::Decode(format!(
                        "server repeated cursor {cursor:?} for {}",
                        self.request.resource_type
                    )));
                }
                self.request.cursor = Some(cursor.clone());
            }
        }
        Ok(page)
    }
}

impl<T: RemoteTransport + ?Sized> Iterator for Pages<'_, T> {
    type Item = SyncResult<FetchResponse>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let page = self.fetch();
        if page.is_err() {
            self.finished = true;
        }
        Some(page)
    }
}

/// Download result of one resource type in one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadOutcome {
    /// The resource type.
    pub resource_type: ResourceType,
    /// Watermark the pass started from.
    pub previous_watermark: Option<Timestamp>,
    /// Newest timestamp among the downloaded records.
    pub latest: Option<Timestamp>,
    /// Records received in applied pages.
    pub downloaded: u64,
    /// Records merged through the conflict resolver.
    pub merged: u64,
    /// Why the download stopped early, if it did.
    pub error: Option<SyncError>,
}

impl DownloadOutcome {
    fn new(resource_type: ResourceType, previous_watermark: Option<Timestamp>) -> Self {
        Self {
            resource_type,
            previous_watermark,
            latest: None,
            downloaded: 0,
            merged: 0,
            error: None,
        }
    }

    /// Returns true if every page was fetched and applied.
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    /// Returns the watermark this type has after the pass.
    pub fn watermark(&self) -> Option<Timestamp> {
        if self.is_complete() {
            self.previous_watermark.max(self.latest)
        } else {
            self.previous_watermark
        }
    }

    /// Returns the watermark to commit, if it moved forward.
    pub(crate) fn advanced_watermark(&self) -> Option<Timestamp> {
        let watermark = self.watermark()?;
        (Some(watermark) != self.previous_watermark).then_some(watermark)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Written,
    Merged,
    Skipped,
}

/// Applies downloaded pages to the local store.
pub(crate) struct DownloadManager<'a, T: ?Sized, S: ?Sized> {
    transport: &'a T,
    store: &'a S,
    config: &'a SyncConfig,
    cancel: &'a CancelHandle,
}

impl<'a, T, S> DownloadManager<'a, T, S>
where
    T: RemoteTransport + ?Sized,
    S: LocalStore + ?Sized,
{
    /// Creates a download manager.
    pub(crate) fn new(
        transport: &'a T,
        store: &'a S,
        config: &'a SyncConfig,
        cancel: &'a CancelHandle,
    ) -> Self {
        Self {
            transport,
            store,
            config,
            cancel,
        }
    }

    /// Downloads and applies every change of one type.
    ///
    /// Transport, decode and cancellation errors stop this type and are
    /// reported in the outcome. Only local store failures are returned as
    /// `Err`. `on_page` receives the record count of every applied page.
    pub(crate) fn download_type(
        &self,
        resource_type: &ResourceType,
        since: Option<Timestamp>,
        ledger: &mut ConflictLedger,
        on_page: &mut dyn FnMut(u64),
    ) -> SyncResult<DownloadOutcome> {
        let mut outcome = DownloadOutcome::new(resource_type.clone(), since);
        let mut pages = pull(
            self.transport,
            resource_type.clone(),
            since,
            self.config.page_size,
            self.config.scope_filters.clone(),
        );

        loop {
            if let Err(err) = self.cancel.check() {
                outcome.error = Some(err);
                break;
            }
            let page = match pages.next() {
                None => break,
                Some(Ok(page)) => page,
                Some(Err(err)) => {
                    warn!(resource_type = %resource_type, error = %err, "download failed");
                    outcome.error = Some(err);
                    break;
                }
            };
            if let Err(err) = self.cancel.check() {
                debug!(resource_type = %resource_type, "discarding page fetched after cancellation");
                outcome.error = Some(err);
                break;
            }

            for remote in &page.records {
                match self.apply_record(remote, ledger)? {
                    Applied::Merged => outcome.merged += 1,
                    Applied::Written | Applied::Skipped => {}
                }
                outcome.latest = outcome.latest.max(Some(remote.last_modified));
            }
            let count = page.records.len() as u64;
            outcome.downloaded += count;
            debug!(
                resource_type = %resource_type,
                records = count,
                more = page.next_cursor.is_some(),
                "page applied"
            );
            on_page(count);
        }

        Ok(outcome)
    }

    fn apply_record(&self, remote: &Record, ledger: &mut ConflictLedger) -> SyncResult<Applied> {
        let policy = &self.config.conflict_policy;
        let key = remote.key();
        let mut applied = Applied::Skipped;

        self.store
            .read_modify_write(&key, &mut |local: Option<&Record>| match local {
                None => {
                    applied = Applied::Written;
                    Some(remote.clone().into_clean(remote.last_modified))
                }
                // not newer than what the device already derives from
                Some(local) if remote.last_modified <= local.last_modified => None,
                Some(local) if !local.dirty => {
                    applied = Applied::Written;
                    Some(remote.clone().into_clean(remote.last_modified))
                }
                Some(local) => {
                    applied = Applied::Merged;
                    Some(policy.resolve(local, remote))
                }
            })?;

        if applied == Applied::Merged {
            ledger.record(&key);
            debug!(
                resource_type = %key.resource_type,
                record_id = %key.id,
                policy = policy.name(),
                "merged downloaded record into local edit"
            );
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::transport::MockTransport;
    use fhirsync_testkit::{
        dirty_patient, page_size_strategy, patient, patient_key, patient_type, record_run, ts,
    };
    use proptest::prelude::*;

    fn run(
        transport: &MockTransport,
        store: &MemoryStore,
        config: &SyncConfig,
        since: Option<Timestamp>,
    ) -> DownloadOutcome {
        let cancel = CancelHandle::new();
        let manager = DownloadManager::new(transport, store, config, &cancel);
        manager
            .download_type(
                &patient_type(),
                since,
                &mut ConflictLedger::default(),
                &mut |_| {},
            )
            .unwrap()
    }

    #[test]
    fn pull_follows_cursors() {
        let transport = MockTransport::new();
        transport.push_page(
            "Patient",
            FetchResponse::new(vec![patient("p1", 1, "a")], Some("c1".into())),
        );
        transport.push_page(
            "Patient",
            FetchResponse::new(vec![patient("p2", 2, "b")], Some("c2".into())),
        );
        transport.push_page("Patient", FetchResponse::last(vec![patient("p3", 3, "c")]));

        let pages: Vec<_> = pull(&transport, patient_type(), Some(ts(0)), 1, vec![])
            .collect::<SyncResult<_>>()
            .unwrap();
        assert_eq!(pages.len(), 3);

        let cursors: Vec<_> = transport
            .fetches()
            .into_iter()
            .map(|request| request.cursor)
            .collect();
        assert_eq!(cursors, vec![None, Some("c1".into()), Some("c2".into())]);
    }

    #[test]
    fn pull_is_lazy() {
        let transport = MockTransport::new();
        let pages = pull(&transport, patient_type(), None, 10, vec![]);
        assert!(transport.fetches().is_empty());
        drop(pages);
    }

    #[test]
    fn repeated_cursor_is_a_decode_error() {
        let transport = MockTransport::new();
        for _ in 0..3 {
            transport.push_page(
                "Patient",
                FetchResponse::new(vec![patient("p1", 1, "a")], Some("same".into())),
            );
        }

        let results: Vec<_> = pull(&transport, patient_type(), None, 1, vec![]).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(SyncError::Decode(_))));
    }

    #[test]
    fn foreign_records_fail_the_page() {
        let transport = MockTransport::new();
        transport.push_page(
            "Patient",
            FetchResponse::last(vec![fhirsync_testkit::observation("o1", 1, "x")]),
        );

        let mut pages = pull(&transport, patient_type(), None, 10, vec![]);
        assert!(matches!(pages.next(), Some(Err(SyncError::Decode(_)))));
        assert!(pages.next().is_none());
    }

    #[test]
    fn filters_travel_with_every_fetch() {
        let transport = MockTransport::new();
        let config = SyncConfig::new().with_scope_filter("_id", "p1,p2");
        run(&transport, &MemoryStore::new(), &config, None);

        assert_eq!(
            transport.fetches()[0].filters,
            vec![ScopeFilter::new("_id", "p1,p2")]
        );
    }

    #[test]
    fn clean_and_missing_records_are_written_as_is() {
        let transport = MockTransport::new();
        transport.push_page(
            "Patient",
            FetchResponse::last(vec![patient("p1", 5, "new"), patient("p2", 6, "updated")]),
        );
        let store = MemoryStore::new();
        store.insert(patient("p2", 2, "old"));

        let outcome = run(&transport, &store, &SyncConfig::new(), None);
        assert_eq!(outcome.downloaded, 2);
        assert_eq!(outcome.merged, 0);
        assert_eq!(outcome.watermark(), Some(ts(6)));
        assert_eq!(store.record(&patient_key("p1")).unwrap().body, b"new");
        assert_eq!(store.record(&patient_key("p2")).unwrap().body, b"updated");
    }

    #[test]
    fn stale_remote_versions_are_skipped() {
        let transport = MockTransport::new();
        transport.push_page("Patient", FetchResponse::last(vec![patient("p1", 3, "stale")]));
        let store = MemoryStore::new();
        store.insert(patient("p1", 8, "fresh"));

        let outcome = run(&transport, &store, &SyncConfig::new(), None);
        assert_eq!(outcome.downloaded, 1);
        assert_eq!(store.record(&patient_key("p1")).unwrap().body, b"fresh");
    }

    #[test]
    fn stale_versions_leave_dirty_records_unresolved() {
        let transport = MockTransport::new();
        transport.push_page("Patient", FetchResponse::last(vec![patient("p1", 8, "same")]));
        let store = MemoryStore::new();
        store.insert(dirty_patient("p1", 8, "pending", 9));

        let outcome = run(&transport, &store, &SyncConfig::new(), None);

        assert_eq!(outcome.merged, 0);
        let record = store.record(&patient_key("p1")).unwrap();
        assert_eq!(record.body, b"pending");
        assert!(record.dirty);
        assert_eq!(record.last_modified, ts(8));
    }

    #[test]
    fn dirty_records_go_through_the_resolver() {
        let transport = MockTransport::new();
        transport.push_page("Patient", FetchResponse::last(vec![patient("p1", 7, "B2")]));
        let store = MemoryStore::new();
        store.insert(dirty_patient("p1", 1, "B1", 5));

        let cancel = CancelHandle::new();
        let config = SyncConfig::new();
        let manager = DownloadManager::new(&transport, &store, &config, &cancel);
        let mut ledger = ConflictLedger::default();
        let outcome = manager
            .download_type(&patient_type(), None, &mut ledger, &mut |_| {})
            .unwrap();

        assert_eq!(outcome.merged, 1);
        assert!(ledger.contains(&patient_key("p1")));
        let merged = store.record(&patient_key("p1")).unwrap();
        assert_eq!(merged.body, b"B1");
        assert_eq!(merged.last_modified, ts(7));
        assert!(merged.dirty);
    }

    #[test]
    fn remote_wins_clears_dirty_during_download() {
        let transport = MockTransport::new();
        transport.push_page("Patient", FetchResponse::last(vec![patient("p1", 7, "B2")]));
        let store = MemoryStore::new();
        store.insert(dirty_patient("p1", 1, "B1", 5));

        let config = SyncConfig::new().with_conflict_policy(crate::ConflictPolicy::RemoteWins);
        run(&transport, &store, &config, None);

        let merged = store.record(&patient_key("p1")).unwrap();
        assert_eq!(merged.body, b"B2");
        assert!(!merged.dirty);
    }

    #[test]
    fn failure_on_a_later_page_keeps_the_previous_watermark() {
        let transport = MockTransport::new();
        transport.push_page(
            "Patient",
            FetchResponse::new(vec![patient("p1", 11, "a")], Some("c1".into())),
        );
        transport.push_fetch_error("Patient", SyncError::transport_retryable("timeout"));
        let store = MemoryStore::new();

        let outcome = run(&transport, &store, &SyncConfig::new(), Some(ts(10)));
        assert!(!outcome.is_complete());
        assert_eq!(outcome.latest, Some(ts(11)));
        assert_eq!(outcome.watermark(), Some(ts(10)));
        assert_eq!(outcome.advanced_watermark(), None);
        // the first page stays applied; re-applying it next pass is harmless
        assert!(store.record(&patient_key("p1")).is_some());
    }

    #[test]
    fn cancellation_discards_the_fetched_page() {
        let transport = MockTransport::new();
        transport.push_page("Patient", FetchResponse::last(vec![patient("p1", 4, "a")]));
        let cancel = CancelHandle::new();
        let hook_cancel = cancel.clone();
        transport.on_fetch(move |_| hook_cancel.cancel());

        let store = MemoryStore::new();
        let config = SyncConfig::new();
        let manager = DownloadManager::new(&transport, &store, &config, &cancel);
        let outcome = manager
            .download_type(
                &patient_type(),
                None,
                &mut ConflictLedger::default(),
                &mut |_| {},
            )
            .unwrap();

        assert_eq!(outcome.error, Some(SyncError::Cancelled));
        assert_eq!(outcome.downloaded, 0);
        assert!(store.is_empty());
    }

    #[test]
    fn store_failure_is_returned() {
        let transport = MockTransport::new();
        transport.push_page("Patient", FetchResponse::last(vec![patient("p1", 4, "a")]));
        let store = MemoryStore::new();
        store.set_offline(true);

        let cancel = CancelHandle::new();
        let config = SyncConfig::new();
        let manager = DownloadManager::new(&transport, &store, &config, &cancel);
        let result = manager.download_type(
            &patient_type(),
            None,
            &mut ConflictLedger::default(),
            &mut |_| {},
        );
        assert!(matches!(result, Err(SyncError::Store(_))));
    }

    proptest! {
        #[test]
        fn watermark_is_max_over_all_pages(
            count in 1usize..30,
            page_size in page_size_strategy(),
        ) {
            let records = record_run("Patient", count, 100);
            let transport = MockTransport::new();
            let chunks: Vec<_> = records.chunks(page_size as usize).collect();
            for (i, chunk) in chunks.iter().enumerate() {
                let cursor = (i + 1 < chunks.len()).then(|| format!("c{i}"));
                transport.push_page("Patient", FetchResponse::new(chunk.to_vec(), cursor));
            }

            let store = MemoryStore::new();
            let outcome = run(&transport, &store, &SyncConfig::new(), None);

            prop_assert!(outcome.is_complete());
            prop_assert_eq!(outcome.downloaded, count as u64);
            prop_assert_eq!(outcome.watermark(), Some(ts(100 + count as u64 - 1)));
            prop_assert_eq!(store.len(), count);
            prop_assert_eq!(transport.fetches().len(), chunks.len());
        }
    }
}
