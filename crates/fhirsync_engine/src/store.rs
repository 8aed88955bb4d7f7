//! Local store adapter.
//!
//! The local store owns the records. The engine reads and writes them only
//! through [`LocalStore`], one record at a time, and never keeps a record
//! around across a network call.

use crate::error::{SyncError, SyncResult};
use fhirsync_protocol::{Record, RecordKey, ResourceType, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// A dirty record queued for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadItem {
    /// The record with its local content.
    pub record: Record,
    /// Server version the local edit is based on; `None` if the record was
    /// created on this device and never reached the server.
    pub known_version: Option<Timestamp>,
}

impl UploadItem {
    /// Builds an upload item from a dirty record.
    pub fn from_record(record: Record) -> Self {
        let known_version = (record.last_modified != Timestamp::ZERO).then_some(record.last_modified);
        Self {
            record,
            known_version,
        }
    }

    /// Returns the record key.
    pub fn key(&self) -> RecordKey {
        self.record.key()
    }
}

/// Callback for [`LocalStore::read_modify_write`].
///
/// Receives the current record, if any, and returns the record to store,
/// or `None` to leave the store untouched.
pub type MergeFn<'a> = dyn FnMut(Option<&Record>) -> Option<Record> + 'a;

/// The engine's view of the device-local record store.
///
/// Every call is scoped to one record (or one type for `list_dirty`) and
/// assumed to be local and fast. Errors returned here are treated as the
/// store being unreachable and abort the current pass.
pub trait LocalStore: Send + Sync {
    /// Reads a record.
    fn get(&self, key: &RecordKey) -> SyncResult<Option<Record>>;

    /// Replaces a record, including its dirty flag.
    fn put(&self, record: Record) -> SyncResult<()>;

    /// Clears the dirty flag and records the server version just accepted.
    ///
    /// Unconditional; the engine settles its own uploads through
    /// [`LocalStore::settle_upload`].
    fn mark_clean(&self, key: &RecordKey, version: Timestamp) -> SyncResult<()>;

    /// Lists the dirty records of a type.
    fn list_dirty(&self, resource_type: &ResourceType) -> SyncResult<Vec<UploadItem>>;

    /// Returns true if the record exists and is dirty.
    fn is_dirty(&self, key: &RecordKey) -> SyncResult<bool>;

    /// Settles a write the server accepted at `version`.
    ///
    /// If the stored record still holds the uploaded content it becomes
    /// clean at `version`. If it was edited while the write was in flight,
    /// only its baseline moves to `version` and it stays dirty. Returns true
    /// if the record was cleaned.
    fn settle_upload(&self, uploaded: &Record, version: Timestamp) -> SyncResult<bool> {
        let mut cleaned = false;
        self.read_modify_write(&uploaded.key(), &mut |current: Option<&Record>| {
            let current = current?;
            if current.body == uploaded.body && current.edited_at == uploaded.edited_at {
                cleaned = true;
                Some(current.clone().into_clean(version))
            } else {
                Some(Record {
                    last_modified: version,
                    ..current.clone()
                })
            }
        })?;
        Ok(cleaned)
    }

    /// Atomically reads a record, merges, and writes the result back.
    ///
    /// Returns the record that was written, if any. The default
    /// implementation is only as atomic as `get` followed by `put`; stores
    /// shared with other writers should override it.
    fn read_modify_write(
        &self,
        key: &RecordKey,
        merge: &mut MergeFn<'_>,
    ) -> SyncResult<Option<Record>> {
        let current = self.get(key)?;
        match merge(current.as_ref()) {
            Some(record) => {
                self.put(record.clone())?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

impl<S: LocalStore + ?Sized> LocalStore for std::sync::Arc<S> {
    fn get(&self, key: &RecordKey) -> SyncResult<Option<Record>> {
        (**self).get(key)
    }

    fn put(&self, record: Record) -> SyncResult<()> {
        (**self).put(record)
    }

    fn mark_clean(&self, key: &RecordKey, version: Timestamp) -> SyncResult<()> {
        (**self).mark_clean(key, version)
    }

    fn list_dirty(&self, resource_type: &ResourceType) -> SyncResult<Vec<UploadItem>> {
        (**self).list_dirty(resource_type)
    }

    fn is_dirty(&self, key: &RecordKey) -> SyncResult<bool> {
        (**self).is_dirty(key)
    }

    fn settle_upload(&self, uploaded: &Record, version: Timestamp) -> SyncResult<bool> {
        (**self).settle_upload(uploaded, version)
    }

    fn read_modify_write(
        &self,
        key: &RecordKey,
        merge: &mut MergeFn<'_>,
    ) -> SyncResult<Option<Record>> {
        (**self).read_modify_write(key, merge)
    }
}

/// An in-memory local store.
///
/// Besides the [`LocalStore`] contract it offers the write paths the rest of
/// the application uses outside of sync.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<RecordKey, Record>>,
    offline: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts records as-is, e.g. to seed a store.
    pub fn insert(&self, record: Record) {
        self.records.write().insert(record.key(), record);
    }

    /// Records a local edit made by the application.
    ///
    /// Existing records keep their server version as the upload baseline;
    /// new records start without one.
    pub fn write_local(
        &self,
        resource_type: impl Into<ResourceType>,
        id: impl Into<String>,
        body: impl Into<Vec<u8>>,
        edited_at: Timestamp,
    ) -> Record {
        let key = RecordKey::new(resource_type, id);
        let mut records = self.records.write();
        let edited = match records.get(&key) {
            Some(existing) => existing.with_local_edit(body, edited_at),
            None => Record::new(
                key.resource_type.clone(),
                key.id.clone(),
                Timestamp::ZERO,
                Vec::new(),
            )
            .with_local_edit(body, edited_at),
        };
        records.insert(key, edited.clone());
        edited
    }

    /// Returns a copy of a record.
    pub fn record(&self, key: &RecordKey) -> Option<Record> {
        self.records.read().get(key).cloned()
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Returns the number of dirty records across all types.
    pub fn dirty_count(&self) -> usize {
        self.records.read().values().filter(|r| r.dirty).count()
    }

    /// Simulates the store becoming unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> SyncResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(SyncError::store("local store unavailable"))
        } else {
            Ok(())
        }
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &RecordKey) -> SyncResult<Option<Record>> {
        self.check_online()?;
        Ok(self.records.read().get(key).cloned())
    }

    fn put(&self, record: Record) -> SyncResult<()> {
        self.check_online()?;
        self.records.write().insert(record.key(), record);
        Ok(())
    }

    fn mark_clean(&self, key: &RecordKey, version: Timestamp) -> SyncResult<()> {
        self.check_online()?;
        let mut records = self.records.write();
        let record = records
            .get_mut(key)
            .ok_or_else(|| SyncError::store(format!("no local record {key}")))?;
        record.dirty = false;
        record.edited_at = None;
        record.last_modified = version;
        Ok(())
    }

    fn list_dirty(&self, resource_type: &ResourceType) -> SyncResult<Vec<UploadItem>> {
        self.check_online()?;
        let mut items: Vec<UploadItem> = self
            .records
            .read()
            .values()
            .filter(|r| r.dirty && &r.resource_type == resource_type)
            .cloned()
            .map(UploadItem::from_record)
            .collect();
        items.sort_by(|a, b| a.record.id.cmp(&b.record.id));
        Ok(items)
    }

    fn is_dirty(&self, key: &RecordKey) -> SyncResult<bool> {
        self.check_online()?;
        Ok(self.records.read().get(key).is_some_and(|r| r.dirty))
    }

    fn read_modify_write(
        &self,
        key: &RecordKey,
        merge: &mut MergeFn<'_>,
    ) -> SyncResult<Option<Record>> {
        self.check_online()?;
        let mut records = self.records.write();
        match merge(records.get(key)) {
            Some(record) => {
                records.insert(key.clone(), record.clone());
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhirsync_testkit::{patient, patient_key, patient_type, ts};

    #[test]
    fn write_local_marks_dirty_and_keeps_baseline() {
        let store = MemoryStore::new();
        store.insert(patient("p1", 10, "server"));

        store.write_local("Patient", "p1", b"edited".to_vec(), ts(12));

        assert!(store.is_dirty(&patient_key("p1")).unwrap());
        let items = store.list_dirty(&patient_type()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].known_version, Some(ts(10)));
        assert_eq!(items[0].record.body, b"edited");
    }

    #[test]
    fn new_local_record_has_no_known_version() {
        let store = MemoryStore::new();
        store.write_local("Patient", "new", b"hello".to_vec(), ts(3));

        let items = store.list_dirty(&patient_type()).unwrap();
        assert_eq!(items[0].known_version, None);
    }

    #[test]
    fn mark_clean_adopts_server_version() {
        let store = MemoryStore::new();
        store.write_local("Patient", "p1", b"x".to_vec(), ts(3));

        store.mark_clean(&patient_key("p1"), ts(20)).unwrap();

        let record = store.record(&patient_key("p1")).unwrap();
        assert!(!record.dirty);
        assert_eq!(record.last_modified, ts(20));
        assert_eq!(record.edited_at, None);
        assert!(store.list_dirty(&patient_type()).unwrap().is_empty());
    }

    #[test]
    fn mark_clean_of_missing_record_fails() {
        let store = MemoryStore::new();
        assert!(store.mark_clean(&patient_key("ghost"), ts(1)).is_err());
    }

    #[test]
    fn list_dirty_filters_by_type() {
        let store = MemoryStore::new();
        store.write_local("Patient", "p1", b"x".to_vec(), ts(1));
        store.write_local("Observation", "o1", b"y".to_vec(), ts(1));
        store.insert(patient("p2", 4, "clean"));

        let items = store.list_dirty(&patient_type()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key(), patient_key("p1"));
        assert_eq!(store.dirty_count(), 2);
    }

    #[test]
    fn read_modify_write_can_skip() {
        let store = MemoryStore::new();
        store.insert(patient("p1", 4, "keep"));

        let written = store
            .read_modify_write(&patient_key("p1"), &mut |_| None)
            .unwrap();
        assert!(written.is_none());
        assert_eq!(store.record(&patient_key("p1")).unwrap().body, b"keep");

        let written = store
            .read_modify_write(&patient_key("p1"), &mut |current| {
                current.map(|r| Record {
                    body: b"changed".to_vec(),
                    ..r.clone()
                })
            })
            .unwrap();
        assert_eq!(written.unwrap().body, b"changed");
    }

    #[test]
    fn settle_upload_cleans_unchanged_record() {
        let store = MemoryStore::new();
        let uploaded = store.write_local("Patient", "p1", b"B1".to_vec(), ts(4));

        assert!(store.settle_upload(&uploaded, ts(9)).unwrap());

        let record = store.record(&patient_key("p1")).unwrap();
        assert!(!record.dirty);
        assert_eq!(record.last_modified, ts(9));
        assert_eq!(record.body, b"B1");
    }

    #[test]
    fn settle_upload_keeps_edit_made_in_flight() {
        let store = MemoryStore::new();
        store.insert(patient("p1", 3, "server"));
        let uploaded = store.write_local("Patient", "p1", b"B1".to_vec(), ts(4));
        store.write_local("Patient", "p1", b"B2".to_vec(), ts(6));

        assert!(!store.settle_upload(&uploaded, ts(9)).unwrap());

        let record = store.record(&patient_key("p1")).unwrap();
        assert!(record.dirty);
        assert_eq!(record.body, b"B2");
        assert_eq!(record.last_modified, ts(9));
        assert_eq!(record.edited_at, Some(ts(6)));
        let items = store.list_dirty(&patient_type()).unwrap();
        assert_eq!(items[0].known_version, Some(ts(9)));
    }

    #[test]
    fn settle_upload_of_missing_record_is_a_no_op() {
        let store = MemoryStore::new();
        assert!(!store.settle_upload(&patient("gone", 1, "x"), ts(2)).unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn offline_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_offline(true);

        assert!(matches!(
            store.get(&patient_key("p1")),
            Err(SyncError::Store(_))
        ));
        assert!(store.list_dirty(&patient_type()).is_err());
    }
}
