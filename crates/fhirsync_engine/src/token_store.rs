//! Sync token store.
//!
//! Durable per-type watermarks. A watermark is the timestamp of the most
//! recent downloaded record that has been fully applied locally; the next
//! pass asks the server only for records changed after it.
//!
//! ```text
//! <state_dir>/
//! ├─ WATERMARKS       # CBOR map resource type -> timestamp
//! ├─ WATERMARKS.tmp   # Written first, then renamed over WATERMARKS
//! └─ WATERMARKS.lock  # Advisory lock around every WATERMARKS access
//! ```

use crate::error::{SyncError, SyncResult};
use fhirsync_protocol::{from_cbor, to_cbor, ResourceType, Timestamp};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const WATERMARKS_FILE: &str = "WATERMARKS";
const WATERMARKS_TEMP: &str = "WATERMARKS.tmp";
const WATERMARKS_LOCK: &str = "WATERMARKS.lock";

/// Durable storage for per-type watermarks.
pub trait TokenStore: Send + Sync {
    /// Returns the watermark of a type, `None` if it was never synced.
    fn get_watermark(&self, resource_type: &ResourceType) -> SyncResult<Option<Timestamp>>;

    /// Advances the watermark of a type.
    ///
    /// A value older than the stored one is ignored; watermarks never move
    /// backwards.
    fn set_watermark(&self, resource_type: &ResourceType, watermark: Timestamp) -> SyncResult<()>;

    /// Lists all stored watermarks.
    fn watermarks(&self) -> SyncResult<BTreeMap<ResourceType, Timestamp>>;

    /// Forgets the watermark of a type, forcing a full download next pass.
    ///
    /// Returns true if a watermark was stored.
    fn reset(&self, resource_type: &ResourceType) -> SyncResult<bool>;
}

fn advance(
    marks: &mut BTreeMap<ResourceType, Timestamp>,
    resource_type: &ResourceType,
    watermark: Timestamp,
) -> bool {
    match marks.get(resource_type) {
        Some(current) if *current >= watermark => false,
        _ => {
            marks.insert(resource_type.clone(), watermark);
            true
        }
    }
}

/// In-memory token store. Watermarks are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    marks: Mutex<BTreeMap<ResourceType, Timestamp>>,
}

impl MemoryTokenStore {
    /// Creates an empty token store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get_watermark(&self, resource_type: &ResourceType) -> SyncResult<Option<Timestamp>> {
        Ok(self.marks.lock().get(resource_type).copied())
    }

    fn set_watermark(&self, resource_type: &ResourceType, watermark: Timestamp) -> SyncResult<()> {
        advance(&mut self.marks.lock(), resource_type, watermark);
        Ok(())
    }

    fn watermarks(&self) -> SyncResult<BTreeMap<ResourceType, Timestamp>> {
        Ok(self.marks.lock().clone())
    }

    fn reset(&self, resource_type: &ResourceType) -> SyncResult<bool> {
        Ok(self.marks.lock().remove(resource_type).is_some())
    }
}

/// File-backed token store.
///
/// All watermarks live in one small CBOR file that is rewritten atomically
/// on every change. Every call reads the file under an exclusive advisory
/// lock on `WATERMARKS.lock`, so instances in other processes (an engine
/// and an operator's CLI, say) never overwrite each other's changes.
#[derive(Debug)]
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    /// Opens the token store in `dir`, creating the directory if needed.
    ///
    /// Fails if an existing watermark file cannot be decoded.
    pub fn open(dir: impl AsRef<Path>) -> SyncResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(token_err)?;

        let store = Self { dir };
        store.with_lock(|| store.load())?;
        Ok(store)
    }

    /// Returns the state directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn with_lock<R>(&self, op: impl FnOnce() -> SyncResult<R>) -> SyncResult<R> {
        with_file_lock(&self.dir.join(WATERMARKS_LOCK), token_err, op)
    }

    fn load(&self) -> SyncResult<BTreeMap<ResourceType, Timestamp>> {
        let path = self.dir.join(WATERMARKS_FILE);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let data = fs::read(&path).map_err(token_err)?;
        if data.is_empty() {
            return Ok(BTreeMap::new());
        }
        from_cbor(&data)
            .map_err(|e| SyncError::TokenStore(format!("corrupt {}: {e}", path.display())))
    }

    /// Writes the watermarks atomically:
    /// 1. Write to a temporary file
    /// 2. Sync it to disk
    /// 3. Rename it over the live file
    /// 4. Fsync the directory so the rename is durable
    fn save(&self, marks: &BTreeMap<ResourceType, Timestamp>) -> SyncResult<()> {
        let data = to_cbor(marks).map_err(|e| SyncError::TokenStore(e.to_string()))?;
        let temp_path = self.dir.join(WATERMARKS_TEMP);

        let mut file = File::create(&temp_path).map_err(token_err)?;
        file.write_all(&data).map_err(token_err)?;
        file.sync_all().map_err(token_err)?;
        drop(file);

        fs::rename(&temp_path, self.dir.join(WATERMARKS_FILE)).map_err(token_err)?;
        sync_directory(&self.dir).map_err(token_err)?;
        Ok(())
    }
}

impl TokenStore for FileTokenStore {
    fn get_watermark(&self, resource_type: &ResourceType) -> SyncResult<Option<Timestamp>> {
        self.with_lock(|| Ok(self.load()?.get(resource_type).copied()))
    }

    fn set_watermark(&self, resource_type: &ResourceType, watermark: Timestamp) -> SyncResult<()> {
        self.with_lock(|| {
            let mut marks = self.load()?;
            if !advance(&mut marks, resource_type, watermark) {
                return Ok(());
            }
            self.save(&marks)?;
            debug!(resource_type = %resource_type, watermark = %watermark, "watermark persisted");
            Ok(())
        })
    }

    fn watermarks(&self) -> SyncResult<BTreeMap<ResourceType, Timestamp>> {
        self.with_lock(|| self.load())
    }

    fn reset(&self, resource_type: &ResourceType) -> SyncResult<bool> {
        self.with_lock(|| {
            let mut marks = self.load()?;
            if marks.remove(resource_type).is_none() {
                return Ok(false);
            }
            self.save(&marks)?;
            Ok(true)
        })
    }
}

fn token_err(err: std::io::Error) -> SyncError {
    SyncError::TokenStore(err.to_string())
}

/// Runs `op` while holding an exclusive advisory lock on `lock_path`.
pub(crate) fn with_file_lock<R>(
    lock_path: &Path,
    on_io: fn(std::io::Error) -> SyncError,
    op: impl FnOnce() -> SyncResult<R>,
) -> SyncResult<R> {
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(on_io)?;
    lock_file.lock_exclusive().map_err(on_io)?;
    let result = op();
    if let Err(err) = FileExt::unlock(&lock_file) {
        warn!(path = %lock_path.display(), error = %err, "failed to release file lock");
    }
    result
}

/// Fsyncs a directory so renames inside it survive a crash.
///
/// NTFS journals metadata, so there is nothing to do on Windows.
#[cfg(unix)]
pub(crate) fn sync_directory(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_directory(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
