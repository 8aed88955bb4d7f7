//! # fhirsync Engine
//!
//! Offline-first synchronization of a device-local clinical record store
//! with a remote server.
//!
//! This crate provides:
//! - Sync state machine (idle → acquiring lease → downloading → uploading → releasing lease)
//! - Watermark-based incremental downloads over a paged change feed
//! - Pluggable conflict resolution
//! - Individual or single-batch uploads with optimistic concurrency
//! - A non-blocking, expiring sync lease
//! - HTTP transport abstraction
//!
//! ## Architecture
//!
//! The engine implements a **download-then-upload** model:
//! 1. Pull every change since the last watermark, type by type
//! 2. Merge changes into dirty local records through the conflict resolver
//! 3. Push the remaining dirty records to the server
//! 4. Commit the watermarks of every fully applied type
//!
//! ## Key Invariants
//!
//! - A watermark never moves backwards and never covers unapplied data
//! - At most one pass runs per store
//! - A record is resolved at most once per pass
//! - Failures are isolated per record and per resource type
//! - Every local write is a complete replace of one record

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod config;
mod conflict;
mod download;
mod error;
mod http;
mod lease;
mod progress;
mod state;
mod store;
mod token_store;
mod transport;
mod upload;

pub use cancel::CancelHandle;
pub use config::{SyncConfig, DEFAULT_RESOURCE_TYPES};
pub use conflict::{ConflictPolicy, ResolveFn};
pub use download::{pull, DownloadOutcome, Pages};
pub use error::{SyncError, SyncResult};
pub use http::{HttpClient, HttpError, HttpTransport, LoopbackClient, LoopbackServer};
pub use lease::{
    Clock, FileLease, LeaseBackend, LeaseGuard, LeaseInfo, ManualClock, MemoryLease, SystemClock,
};
pub use progress::{SyncObserver, SyncPhase, SyncProgress};
pub use state::{RecordFailure, SyncCycleResult, SyncEngine, SyncState, SyncStats};
pub use store::{LocalStore, MemoryStore, MergeFn, UploadItem};
pub use token_store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use transport::{MockTransport, RemoteTransport};
pub use upload::{UploadOutcome, UploadReport, UploadStrategy, MISSING_BATCH_OUTCOME};
