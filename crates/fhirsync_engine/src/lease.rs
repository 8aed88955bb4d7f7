//! Sync lease.
//!
//! At most one sync pass may run against a store at a time. A pass holds a
//! lease for its whole duration; the lease carries an expiry so a crashed
//! pass cannot block sync forever. An expired lease is reclaimable by the
//! next pass.
//!
//! Two backends are provided:
//! - [`MemoryLease`]: scoped to one process, for a store owned by one engine
//! - [`FileLease`]: scoped to a state directory, shared between processes
//!
//! ```text
//! <state_dir>/
//! ├─ LEASE         # CBOR-encoded LeaseInfo of the current holder
//! ├─ LEASE.tmp     # Written first, then renamed over LEASE
//! └─ LEASE.lock    # Advisory lock around LEASE read-modify-write
//! ```

use crate::error::{SyncError, SyncResult};
use crate::token_store::{sync_directory, with_file_lock};
use fhirsync_protocol::{from_cbor, to_cbor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const LEASE_FILE: &str = "LEASE";
const LEASE_TEMP: &str = "LEASE.tmp";
const LEASE_LOCK: &str = "LEASE.lock";

/// Source of the current time in Unix milliseconds.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now_ms(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock at the given time.
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sets the clock.
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A granted lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    /// Who holds the lease.
    pub holder: String,
    /// When the lease was granted, in Unix milliseconds.
    pub acquired_at_ms: u64,
    /// When the lease expires, in Unix milliseconds.
    pub expires_at_ms: u64,
}

impl LeaseInfo {
    fn granted(holder: &str, now_ms: u64, ttl: Duration) -> Self {
        Self {
            holder: holder.to_string(),
            acquired_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(ttl.as_millis() as u64),
        }
    }

    /// Returns true if the lease has expired at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    fn unavailable(&self) -> SyncError {
        SyncError::LeaseUnavailable {
            holder: self.holder.clone(),
            expires_at_ms: self.expires_at_ms,
        }
    }
}

/// Storage for the sync lease.
pub trait LeaseBackend: Send + Sync {
    /// Grants the lease to `holder` unless someone else holds a live lease.
    ///
    /// Never blocks; fails with [`SyncError::LeaseUnavailable`] instead.
    fn try_acquire(&self, holder: &str, ttl: Duration) -> SyncResult<LeaseInfo>;

    /// Releases the lease if `holder` still holds it.
    ///
    /// Returns false if the lease had already been reclaimed by someone else.
    fn release(&self, holder: &str) -> SyncResult<bool>;

    /// Returns the current lease, expired or not.
    fn current(&self) -> SyncResult<Option<LeaseInfo>>;

    /// Removes the lease whoever holds it. For operators recovering from a
    /// stuck device.
    fn break_lease(&self) -> SyncResult<Option<LeaseInfo>>;
}

fn grant(
    current: Option<&LeaseInfo>,
    holder: &str,
    now_ms: u64,
    ttl: Duration,
) -> SyncResult<LeaseInfo> {
    if let Some(lease) = current {
        if lease.holder != holder && !lease.is_expired(now_ms) {
            return Err(lease.unavailable());
        }
        if lease.holder != holder {
            info!(
                stale_holder = %lease.holder,
                expired_at_ms = lease.expires_at_ms,
                "reclaiming expired sync lease"
            );
        }
    }
    Ok(LeaseInfo::granted(holder, now_ms, ttl))
}

/// In-process lease.
pub struct MemoryLease {
    lease: Mutex<Option<LeaseInfo>>,
    clock: Arc<dyn Clock>,
}

impl MemoryLease {
    /// Creates a free lease using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a free lease using the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            lease: Mutex::new(None),
            clock,
        }
    }
}

impl Default for MemoryLease {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseBackend for MemoryLease {
    fn try_acquire(&self, holder: &str, ttl: Duration) -> SyncResult<LeaseInfo> {
        let mut lease = self.lease.lock();
        let granted = grant(lease.as_ref(), holder, self.clock.now_ms(), ttl)?;
        *lease = Some(granted.clone());
        Ok(granted)
    }

    fn release(&self, holder: &str) -> SyncResult<bool> {
        let mut lease = self.lease.lock();
        match lease.as_ref() {
            Some(current) if current.holder == holder => {
                *lease = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn current(&self) -> SyncResult<Option<LeaseInfo>> {
        Ok(self.lease.lock().clone())
    }

    fn break_lease(&self) -> SyncResult<Option<LeaseInfo>> {
        Ok(self.lease.lock().take())
    }
}

/// Lease stored in a state directory.
///
/// Every operation takes an exclusive advisory lock on `LEASE.lock` for the
/// duration of its read-modify-write of `LEASE`, so two processes never
/// both see the lease as free. The advisory lock is held for microseconds;
/// the lease itself is held for a whole pass and survives a crash only
/// until it expires.
pub struct FileLease {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FileLease {
    /// Opens the lease in `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> SyncResult<Self> {
        Self::open_with_clock(dir, Arc::new(SystemClock))
    }

    /// Opens the lease with a custom clock.
    pub fn open_with_clock(dir: impl AsRef<Path>, clock: Arc<dyn Clock>) -> SyncResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(lease_err)?;
        Ok(Self { dir, clock })
    }

    /// Returns the state directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn with_lock<R>(&self, op: impl FnOnce() -> SyncResult<R>) -> SyncResult<R> {
        with_file_lock(&self.dir.join(LEASE_LOCK), lease_err, op)
    }

    fn read(&self) -> SyncResult<Option<LeaseInfo>> {
        let path = self.dir.join(LEASE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path).map_err(lease_err)?;
        if data.is_empty() {
            return Ok(None);
        }
        match from_cbor(&data) {
            Ok(lease) => Ok(Some(lease)),
            Err(err) => {
                // a torn lease is treated as free; its holder will fail to release
                warn!(error = %err, "ignoring unreadable lease file");
                Ok(None)
            }
        }
    }

    fn write(&self, lease: &LeaseInfo) -> SyncResult<()> {
        let data = to_cbor(lease).map_err(|e| SyncError::Lease(e.to_string()))?;
        let temp_path = self.dir.join(LEASE_TEMP);

        let mut file = File::create(&temp_path).map_err(lease_err)?;
        file.write_all(&data).map_err(lease_err)?;
        file.sync_all().map_err(lease_err)?;
        drop(file);

        fs::rename(&temp_path, self.dir.join(LEASE_FILE)).map_err(lease_err)?;
        sync_directory(&self.dir).map_err(lease_err)
    }

    fn remove(&self) -> SyncResult<()> {
        fs::remove_file(self.dir.join(LEASE_FILE)).map_err(lease_err)?;
        sync_directory(&self.dir).map_err(lease_err)
    }
}

impl LeaseBackend for FileLease {
    fn try_acquire(&self, holder: &str, ttl: Duration) -> SyncResult<LeaseInfo> {
        self.with_lock(|| {
            let granted = grant(self.read()?.as_ref(), holder, self.clock.now_ms(), ttl)?;
            self.write(&granted)?;
            Ok(granted)
        })
    }

    fn release(&self, holder: &str) -> SyncResult<bool> {
        self.with_lock(|| match self.read()? {
            Some(current) if current.holder == holder => {
                self.remove()?;
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    fn current(&self) -> SyncResult<Option<LeaseInfo>> {
        self.with_lock(|| self.read())
    }

    fn break_lease(&self) -> SyncResult<Option<LeaseInfo>> {
        self.with_lock(|| {
            let current = self.read()?;
            if self.dir.join(LEASE_FILE).exists() {
                self.remove()?;
            }
            Ok(current)
        })
    }
}

fn lease_err(err: std::io::Error) -> SyncError {
    SyncError::Lease(err.to_string())
}

/// A held lease, released when dropped.
pub struct LeaseGuard {
    backend: Arc<dyn LeaseBackend>,
    info: LeaseInfo,
    ttl: Duration,
    released: bool,
}

impl LeaseGuard {
    /// Acquires the lease from `backend`.
    pub fn acquire(
        backend: Arc<dyn LeaseBackend>,
        holder: &str,
        ttl: Duration,
    ) -> SyncResult<Self> {
        let info = backend.try_acquire(holder, ttl)?;
        debug!(holder = %info.holder, expires_at_ms = info.expires_at_ms, "sync lease acquired");
        Ok(Self {
            backend,
            info,
            ttl,
            released: false,
        })
    }

    /// Returns the granted lease.
    pub fn info(&self) -> &LeaseInfo {
        &self.info
    }

    /// Extends the lease by its time-to-live from now.
    ///
    /// Fails with [`SyncError::LeaseUnavailable`] if another holder has
    /// reclaimed the lease after it expired.
    pub fn renew(&mut self) -> SyncResult<()> {
        let current = self.backend.current()?;
        if let Some(lease) = current.filter(|lease| lease.holder != self.info.holder) {
            return Err(lease.unavailable());
        }
        self.info = self.backend.try_acquire(&self.info.holder, self.ttl)?;
        debug!(
            holder = %self.info.holder,
            expires_at_ms = self.info.expires_at_ms,
            "sync lease renewed"
        );
        Ok(())
    }

    /// Releases the lease, reporting backend failures.
    pub fn release(mut self) -> SyncResult<()> {
        self.released = true;
        self.release_inner()
    }

    fn release_inner(&self) -> SyncResult<()> {
        if !self.backend.release(&self.info.holder)? {
            warn!(holder = %self.info.holder, "sync lease was reclaimed before release");
        } else {
            debug!(holder = %self.info.holder, "sync lease released");
        }
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.release_inner() {
            warn!(holder = %self.info.holder, error = %err, "failed to release sync lease");
        }
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("info", &self.info)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn memory_lease_excludes_second_holder() {
        let lease = MemoryLease::with_clock(Arc::new(ManualClock::new(1_000)));

        let granted = lease.try_acquire("a", TTL).unwrap();
        assert_eq!(granted.expires_at_ms, 61_000);

        let err = lease.try_acquire("b", TTL).unwrap_err();
        assert_eq!(
            err,
            SyncError::LeaseUnavailable {
                holder: "a".into(),
                expires_at_ms: 61_000
            }
        );

        assert!(lease.release("a").unwrap());
        assert!(lease.try_acquire("b", TTL).is_ok());
    }

    #[test]
    fn expired_lease_is_reclaimable() {
        let clock = Arc::new(ManualClock::new(0));
        let lease = MemoryLease::with_clock(clock.clone());
        lease.try_acquire("crashed", TTL).unwrap();

        clock.advance(Duration::from_secs(59));
        assert!(lease.try_acquire("next", TTL).is_err());

        clock.advance(Duration::from_secs(1));
        let granted = lease.try_acquire("next", TTL).unwrap();
        assert_eq!(granted.holder, "next");

        // the crashed holder cannot release someone else's lease
        assert!(!lease.release("crashed").unwrap());
        assert_eq!(lease.current().unwrap().unwrap().holder, "next");
    }

    #[test]
    fn guard_releases_on_drop() {
        let backend: Arc<dyn LeaseBackend> = Arc::new(MemoryLease::new());
        {
            let guard = LeaseGuard::acquire(backend.clone(), "a", TTL).unwrap();
            assert_eq!(guard.info().holder, "a");
            assert!(backend.current().unwrap().is_some());
        }
        assert!(backend.current().unwrap().is_none());
    }

    #[test]
    fn guard_explicit_release() {
        let backend: Arc<dyn LeaseBackend> = Arc::new(MemoryLease::new());
        let guard = LeaseGuard::acquire(backend.clone(), "a", TTL).unwrap();
        guard.release().unwrap();
        assert!(backend.current().unwrap().is_none());
    }

    #[test]
    fn file_lease_is_shared_between_instances() {
        let temp = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let first = FileLease::open_with_clock(temp.path(), clock.clone()).unwrap();
        let second = FileLease::open_with_clock(temp.path(), clock.clone()).unwrap();

        first.try_acquire("device-a", TTL).unwrap();
        assert!(matches!(
            second.try_acquire("device-b", TTL),
            Err(SyncError::LeaseUnavailable { .. })
        ));

        clock.advance(TTL);
        assert_eq!(
            second.try_acquire("device-b", TTL).unwrap().holder,
            "device-b"
        );
        assert!(!first.release("device-a").unwrap());
        assert!(second.release("device-b").unwrap());
        assert!(first.current().unwrap().is_none());
    }

    #[test]
    fn file_lease_survives_reopen() {
        let temp = tempdir().unwrap();
        {
            let lease = FileLease::open(temp.path()).unwrap();
            lease.try_acquire("device-a", TTL).unwrap();
        }
        let lease = FileLease::open(temp.path()).unwrap();
        assert_eq!(lease.current().unwrap().unwrap().holder, "device-a");
        assert!(!temp.path().join(LEASE_TEMP).exists());
    }

    #[test]
    fn break_lease_removes_any_holder() {
        let temp = tempdir().unwrap();
        let lease = FileLease::open(temp.path()).unwrap();
        lease.try_acquire("stuck", TTL).unwrap();

        let broken = lease.break_lease().unwrap();
        assert_eq!(broken.unwrap().holder, "stuck");
        assert!(lease.current().unwrap().is_none());
        assert!(lease.break_lease().unwrap().is_none());
    }

    #[test]
    fn guard_renewal_extends_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let backend: Arc<dyn LeaseBackend> = Arc::new(MemoryLease::with_clock(clock.clone()));
        let mut guard = LeaseGuard::acquire(backend.clone(), "a", TTL).unwrap();

        clock.advance(Duration::from_secs(45));
        guard.renew().unwrap();

        assert_eq!(guard.info().expires_at_ms, 105_000);
        assert_eq!(backend.current().unwrap().unwrap().expires_at_ms, 105_000);
    }

    #[test]
    fn reclaimed_lease_cannot_be_renewed() {
        let clock = Arc::new(ManualClock::new(0));
        let backend: Arc<dyn LeaseBackend> = Arc::new(MemoryLease::with_clock(clock.clone()));
        let mut guard = LeaseGuard::acquire(backend.clone(), "slow", TTL).unwrap();

        clock.advance(TTL);
        backend.try_acquire("next", TTL).unwrap();

        assert_eq!(
            guard.renew().unwrap_err(),
            SyncError::LeaseUnavailable {
                holder: "next".into(),
                expires_at_ms: 120_000
            }
        );
        drop(guard);
        assert_eq!(backend.current().unwrap().unwrap().holder, "next");
    }

    #[test]
    fn same_holder_may_renew() {
        let clock = Arc::new(ManualClock::new(0));
        let lease = MemoryLease::with_clock(clock.clone());
        lease.try_acquire("a", TTL).unwrap();
        clock.advance(Duration::from_secs(10));

        let renewed = lease.try_acquire("a", TTL).unwrap();
        assert_eq!(renewed.expires_at_ms, 70_000);
    }
}
