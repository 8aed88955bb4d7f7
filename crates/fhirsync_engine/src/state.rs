//! Sync engine state machine.

use crate::cancel::CancelHandle;
use crate::config::SyncConfig;
use crate::conflict::ConflictLedger;
use crate::download::{DownloadManager, DownloadOutcome};
use crate::error::{SyncError, SyncResult};
use crate::lease::{LeaseBackend, LeaseGuard, MemoryLease};
use crate::progress::{SyncObserver, SyncPhase, SyncProgress};
use crate::store::{LocalStore, UploadItem};
use crate::token_store::{MemoryTokenStore, TokenStore};
use crate::transport::RemoteTransport;
use crate::upload::{UploadManager, UploadOutcome, UploadReport};
use fhirsync_protocol::{CountRequest, RecordKey};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Engine is idle, not syncing.
    Idle,
    /// Engine is acquiring the sync lease.
    AcquiringLease,
    /// Engine is pulling changes from the server.
    Downloading,
    /// Engine is pushing local edits to the server.
    Uploading,
    /// Engine is releasing the sync lease.
    ReleasingLease,
    /// The last pass failed.
    Failed,
}

impl SyncState {
    /// Returns true if a pass is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::AcquiringLease
                | SyncState::Downloading
                | SyncState::Uploading
                | SyncState::ReleasingLease
        )
    }

    /// Returns true if the engine can start a new pass.
    pub fn can_start_sync(&self) -> bool {
        !self.is_active()
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Total number of passes that ran to the end.
    pub passes_completed: u64,
    /// Total number of passes that returned an error.
    pub passes_aborted: u64,
    /// Total number of records downloaded.
    pub records_downloaded: u64,
    /// Total number of records uploaded.
    pub records_uploaded: u64,
    /// Total number of conflicts resolved.
    pub conflicts_resolved: u64,
    /// Last time a pass ran to the end.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// A record that could not be synced in a pass. It stays dirty.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFailure {
    /// The record.
    pub key: RecordKey,
    /// Why it failed.
    pub error: SyncError,
}

/// Result of a sync pass.
#[derive(Debug, Clone, Default)]
pub struct SyncCycleResult {
    /// Records downloaded and applied.
    pub downloaded: u64,
    /// Records that went through conflict resolution.
    pub merged: u64,
    /// Records accepted by the server.
    pub uploaded: u64,
    /// Records that failed to upload.
    pub failed: u64,
    /// Per-record failures.
    pub failures: Vec<RecordFailure>,
    /// Per-type download outcomes, in configuration order.
    pub downloads: Vec<DownloadOutcome>,
    /// The first failure of the pass, if any.
    pub first_failure: Option<SyncError>,
    /// Whether the pass was cancelled.
    pub cancelled: bool,
    /// Duration of the pass.
    pub duration: Duration,
}

impl SyncCycleResult {
    /// Returns true if the pass ran to the end without any failure.
    pub fn is_success(&self) -> bool {
        self.first_failure.is_none() && !self.cancelled
    }

    /// Returns the download outcome of a resource type.
    pub fn download(&self, resource_type: &str) -> Option<&DownloadOutcome> {
        self.downloads
            .iter()
            .find(|d| d.resource_type.as_str() == resource_type)
    }

    fn note_failure(&mut self, error: &SyncError) {
        if self.first_failure.is_none() {
            self.first_failure = Some(error.clone());
        }
    }

    fn record_download(&mut self, outcome: DownloadOutcome) {
        self.downloaded += outcome.downloaded;
        self.merged += outcome.merged;
        match &outcome.error {
            Some(SyncError::Cancelled) => self.cancelled = true,
            Some(err) => self.note_failure(err),
            None => {}
        }
        self.downloads.push(outcome);
    }

    fn record_upload(&mut self, report: UploadReport) {
        if report.conflicted {
            self.merged += 1;
        }
        match report.outcome {
            UploadOutcome::Accepted { .. } => self.uploaded += 1,
            UploadOutcome::Merged => {}
            UploadOutcome::Failed(error) => {
                self.failed += 1;
                self.note_failure(&error);
                self.failures.push(RecordFailure {
                    key: report.key,
                    error,
                });
            }
        }
    }
}

/// Puts the engine back into a resting state when a pass ends, including
/// by unwinding.
struct ActivePass<'a> {
    state: &'a RwLock<SyncState>,
    finished: bool,
}

impl ActivePass<'_> {
    fn finish(mut self, state: SyncState) {
        *self.state.write() = state;
        self.finished = true;
    }
}

impl Drop for ActivePass<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *self.state.write() = SyncState::Failed;
        }
    }
}

/// The sync engine runs sync passes between a local store and a server.
///
/// A pass acquires the lease, downloads the changes of every configured
/// type, uploads dirty records, commits the advanced watermarks and
/// releases the lease.
pub struct SyncEngine<T: RemoteTransport, S: LocalStore> {
    config: SyncConfig,
    transport: Arc<T>,
    store: Arc<S>,
    token_store: Arc<dyn TokenStore>,
    lease: Arc<dyn LeaseBackend>,
    observer: Option<Arc<dyn SyncObserver>>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    cancel: CancelHandle,
}

impl<T: RemoteTransport, S: LocalStore> SyncEngine<T, S> {
    /// Creates a new sync engine with in-memory watermarks and lease.
    pub fn new(config: SyncConfig, transport: T, store: S) -> Self {
        Self {
            config,
            transport: Arc::new(transport),
            store: Arc::new(store),
            token_store: Arc::new(MemoryTokenStore::new()),
            lease: Arc::new(MemoryLease::new()),
            observer: None,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancel: CancelHandle::new(),
        }
    }

    /// Uses the given token store for watermarks.
    pub fn with_token_store(mut self, token_store: Arc<dyn TokenStore>) -> Self {
        self.token_store = token_store;
        self
    }

    /// Uses the given lease backend.
    pub fn with_lease(mut self, lease: Arc<dyn LeaseBackend>) -> Self {
        self.lease = lease;
        self
    }

    /// Reports progress to the given observer.
    pub fn with_observer(mut self, observer: impl SyncObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Gets the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Gets the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Gets the local store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Gets the token store.
    pub fn token_store(&self) -> &dyn TokenStore {
        self.token_store.as_ref()
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns a handle that cancels the running pass.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancels the running pass, if any.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn set_state(&self, state: SyncState) {
        debug!(?state, "sync state");
        *self.state.write() = state;
    }

    fn notify(&self, progress: &SyncProgress) {
        if let Some(observer) = &self.observer {
            observer.on_progress(progress);
        }
    }

    /// Runs one sync pass.
    ///
    /// Per-record and per-type failures are collected into the result.
    /// Returns `Err` only if the lease is unavailable or the local store,
    /// token store or lease backend fails; the lease is released on every
    /// path. A cancelled pass returns `Ok` with `cancelled` set.
    pub fn run_sync(&self) -> SyncResult<SyncCycleResult> {
        let start = Instant::now();
        let pass = self.begin_pass()?;
        self.cancel.reset();
        self.notify(&SyncProgress::Started);

        let holder = format!("{}-{}", self.config.device_name, Uuid::new_v4());
        let mut lease = match LeaseGuard::acquire(self.lease.clone(), &holder, self.config.lease_ttl) {
            Ok(lease) => lease,
            Err(err) => {
                warn!(error = %err, "could not acquire sync lease");
                let resting = if matches!(err, SyncError::LeaseUnavailable { .. }) {
                    SyncState::Idle
                } else {
                    SyncState::Failed
                };
                pass.finish(resting);
                self.abort(&err);
                return Err(err);
            }
        };
        info!(holder = %holder, "sync pass started");

        let mut result = SyncCycleResult::default();
        let outcome = self.run_phases(&mut result, &mut lease);

        self.set_state(SyncState::ReleasingLease);
        if let Err(err) = lease.release() {
            warn!(error = %err, "failed to release sync lease");
        }
        result.duration = start.elapsed();

        if let Err(err) = outcome {
            error!(error = %err, "sync pass aborted");
            pass.finish(SyncState::Failed);
            self.abort(&err);
            return Err(err);
        }

        if result.cancelled && result.first_failure.is_none() {
            result.first_failure = Some(SyncError::Cancelled);
        }
        let resting = if result.first_failure.is_some() && !result.cancelled {
            SyncState::Failed
        } else {
            SyncState::Idle
        };
        pass.finish(resting);
        self.complete(&result);

        info!(
            downloaded = result.downloaded,
            merged = result.merged,
            uploaded = result.uploaded,
            failed = result.failed,
            cancelled = result.cancelled,
            duration_ms = result.duration.as_millis() as u64,
            "sync pass finished"
        );
        match &result.first_failure {
            None => self.notify(&SyncProgress::Succeeded),
            Some(err) => self.notify(&SyncProgress::Failed(err.clone())),
        }
        Ok(result)
    }

    /// Moves from a resting state to `AcquiringLease`, or reports the pass
    /// that is already running.
    fn begin_pass(&self) -> SyncResult<ActivePass<'_>> {
        let mut state = self.state.write();
        if state.is_active() {
            let running = self.lease.current().ok().flatten();
            return Err(SyncError::LeaseUnavailable {
                holder: running
                    .as_ref()
                    .map(|lease| lease.holder.clone())
                    .unwrap_or_else(|| self.config.device_name.clone()),
                expires_at_ms: running.map(|lease| lease.expires_at_ms).unwrap_or_default(),
            });
        }
        *state = SyncState::AcquiringLease;
        Ok(ActivePass {
            state: &self.state,
            finished: false,
        })
    }

    /// Runs the phases of a pass. The lease is renewed before every
    /// resource type, before the upload and before watermarks are
    /// committed; a lease lost to another holder aborts the pass.
    fn run_phases(&self, result: &mut SyncCycleResult, lease: &mut LeaseGuard) -> SyncResult<()> {
        let mut ledger = ConflictLedger::default();

        self.set_state(SyncState::Downloading);
        self.download_all(result, &mut ledger, lease)?;

        if self.cancel.is_cancelled() {
            result.cancelled = true;
        } else {
            lease.renew()?;
            self.set_state(SyncState::Uploading);
            self.upload_all(result, &mut ledger)?;
            if self.cancel.is_cancelled() {
                result.cancelled = true;
            }
        }

        lease.renew()?;
        self.commit_watermarks(result)
    }

    fn download_all(
        &self,
        result: &mut SyncCycleResult,
        ledger: &mut ConflictLedger,
        lease: &mut LeaseGuard,
    ) -> SyncResult<()> {
        let downloads = DownloadManager::new(
            self.transport.as_ref(),
            self.store.as_ref(),
            &self.config,
            &self.cancel,
        );
        let total = self.download_total()?;
        let mut completed = 0u64;

        for resource_type in &self.config.resource_types {
            if self.cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            lease.renew()?;
            let since = self.token_store.get_watermark(resource_type)?;
            debug!(resource_type = %resource_type, since = ?since, "downloading");

            let outcome = downloads.download_type(resource_type, since, ledger, &mut |count| {
                completed += count;
                self.notify(&SyncProgress::InProgress {
                    phase: SyncPhase::Downloading,
                    completed,
                    total,
                });
            })?;
            result.record_download(outcome);
        }
        Ok(())
    }

    /// Sums the change counts of all types, `None` if any is unknown.
    fn download_total(&self) -> SyncResult<Option<u64>> {
        let mut total = 0u64;
        for resource_type in &self.config.resource_types {
            let since = self.token_store.get_watermark(resource_type)?;
            let request = CountRequest::new(resource_type.clone(), since)
                .with_filters(self.config.scope_filters.clone());
            match self.transport.count_changes(&request) {
                Ok(Some(count)) => total += count,
                Ok(None) => return Ok(None),
                Err(err) => {
                    debug!(resource_type = %resource_type, error = %err, "change count unavailable");
                    return Ok(None);
                }
            }
        }
        Ok(Some(total))
    }

    fn upload_all(
        &self,
        result: &mut SyncCycleResult,
        ledger: &mut ConflictLedger,
    ) -> SyncResult<()> {
        let mut items: Vec<UploadItem> = Vec::new();
        for resource_type in &self.config.resource_types {
            items.extend(self.store.list_dirty(resource_type)?);
        }
        if items.is_empty() {
            return Ok(());
        }

        let total = Some(items.len() as u64);
        let mut completed = 0u64;
        let uploads = UploadManager::new(
            self.transport.as_ref(),
            self.store.as_ref(),
            &self.config.conflict_policy,
            &self.cancel,
        );
        let reports = uploads.push(items, self.config.upload_strategy, ledger, &mut |_| {
            completed += 1;
            self.notify(&SyncProgress::InProgress {
                phase: SyncPhase::Uploading,
                completed,
                total,
            });
        })?;

        for report in reports {
            result.record_upload(report);
        }
        Ok(())
    }

    fn commit_watermarks(&self, result: &SyncCycleResult) -> SyncResult<()> {
        for outcome in &result.downloads {
            if let Some(watermark) = outcome.advanced_watermark() {
                self.token_store
                    .set_watermark(&outcome.resource_type, watermark)?;
                info!(
                    resource_type = %outcome.resource_type,
                    watermark = %watermark,
                    "watermark advanced"
                );
            }
        }
        Ok(())
    }

    fn complete(&self, result: &SyncCycleResult) {
        let mut stats = self.stats.write();
        stats.passes_completed += 1;
        stats.records_downloaded += result.downloaded;
        stats.records_uploaded += result.uploaded;
        stats.conflicts_resolved += result.merged;
        stats.last_sync_time = Some(Instant::now());
        stats.last_error = result.first_failure.as_ref().map(ToString::to_string);
    }

    fn abort(&self, error: &SyncError) {
        {
            let mut stats = self.stats.write();
            stats.passes_aborted += 1;
            stats.last_error = Some(error.to_string());
        }
        self.notify(&SyncProgress::Failed(error.clone()));
    }
}
