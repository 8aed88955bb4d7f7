//! Server-side record store.

use crate::error::{ServerError, ServerResult};
use fhirsync_protocol::{Record, RecordKey, ResourceType, Timestamp, WriteOutcome};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};

/// Position in the change feed of one resource type.
///
/// The feed is ordered by `(last_modified, id)`; a cursor names the last
/// record of the previous page. Cursors are opaque to clients and travel
/// as `"{last_modified}:{id}"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor {
    /// Version of the last record handed out.
    pub last_modified: Timestamp,
    /// Id of the last record handed out.
    pub id: String,
}

impl Cursor {
    /// Returns the cursor pointing just past `record`.
    pub fn after(record: &Record) -> Self {
        Self {
            last_modified: record.last_modified,
            id: record.id.clone(),
        }
    }

    /// Encodes the cursor for the wire.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.last_modified.as_millis(), self.id)
    }

    /// Parses a cursor produced by [`Cursor::encode`].
    pub fn parse(raw: &str) -> ServerResult<Self> {
        let (millis, id) = raw
            .split_once(':')
            .ok_or_else(|| ServerError::InvalidCursor(raw.to_string()))?;
        let millis = millis
            .parse::<u64>()
            .map_err(|_| ServerError::InvalidCursor(raw.to_string()))?;
        if id.is_empty() {
            return Err(ServerError::InvalidCursor(raw.to_string()));
        }
        Ok(Self {
            last_modified: Timestamp::from_millis(millis),
            id: id.to_string(),
        })
    }

    fn precedes(&self, record: &Record) -> bool {
        (self.last_modified, self.id.as_str()) < (record.last_modified, record.id.as_str())
    }
}

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<RecordKey, Record>,
    clock: u64,
}

impl Inner {
    fn tick(&mut self) -> Timestamp {
        self.clock += 1;
        Timestamp::from_millis(self.clock)
    }
}

/// Current version of every record the server holds.
///
/// Versions come from one monotonic clock, so a write always gets a
/// version newer than anything stored before it.
#[derive(Debug, Default)]
pub struct RecordStore {
    inner: RwLock<Inner>,
}

impl RecordStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a record with the version it carries.
    ///
    /// Used to seed the server; the clock is advanced past the version so
    /// later writes stay newer.
    pub fn insert(&self, record: Record) {
        let mut inner = self.inner.write();
        inner.clock = inner.clock.max(record.last_modified.as_millis());
        let version = record.last_modified;
        let record = record.into_clean(version);
        inner.records.insert(record.key(), record);
    }

    /// Replaces a record's body as a server-side edit and returns its new version.
    pub fn update(&self, key: &RecordKey, body: impl Into<Vec<u8>>) -> Option<Timestamp> {
        let mut inner = self.inner.write();
        if !inner.records.contains_key(key) {
            return None;
        }
        let version = inner.tick();
        let record = inner.records.get_mut(key)?;
        record.body = body.into();
        record.last_modified = version;
        Some(version)
    }

    /// Returns the current version of a record.
    pub fn get(&self, key: &RecordKey) -> Option<Record> {
        self.inner.read().records.get(key).cloned()
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Returns true if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the most recently assigned version.
    pub fn clock(&self) -> Timestamp {
        Timestamp::from_millis(self.inner.read().clock)
    }

    /// Returns up to `limit` changes after `since` and `cursor`, plus whether
    /// more remain.
    ///
    /// `ids` restricts the feed to the given record ids.
    pub fn changes(
        &self,
        resource_type: &ResourceType,
        since: Option<Timestamp>,
        cursor: Option<&Cursor>,
        limit: usize,
        ids: Option<&HashSet<String>>,
    ) -> (Vec<Record>, bool) {
        let mut matching = self.matching(resource_type, since, ids);
        matching.sort_by(|a, b| {
            (a.last_modified, a.id.as_str()).cmp(&(b.last_modified, b.id.as_str()))
        });

        let mut remaining = matching
            .into_iter()
            .filter(|record| cursor.map_or(true, |cursor| cursor.precedes(record)));
        let page: Vec<Record> = remaining.by_ref().take(limit).collect();
        let more = remaining.next().is_some();
        (page, more)
    }

    /// Counts the changes of a type after `since`.
    pub fn count(
        &self,
        resource_type: &ResourceType,
        since: Option<Timestamp>,
        ids: Option<&HashSet<String>>,
    ) -> u64 {
        self.matching(resource_type, since, ids).len() as u64
    }

    /// Stores a record if the client saw the current version.
    ///
    /// A record the server already holds is only replaced when
    /// `known_version` names its current version; otherwise the server copy
    /// comes back as a conflict. A record the server does not hold is
    /// always accepted.
    pub fn write(&self, record: &Record, known_version: Option<Timestamp>) -> WriteOutcome {
        let mut inner = self.inner.write();
        let key = record.key();
        if let Some(current) = inner.records.get(&key) {
            if known_version != Some(current.last_modified) {
                return WriteOutcome::Conflict {
                    server: current.clone(),
                };
            }
        }
        let version = inner.tick();
        inner
            .records
            .insert(key, record.clone().into_clean(version));
        WriteOutcome::Accepted { version }
    }

    fn matching(
        &self,
        resource_type: &ResourceType,
        since: Option<Timestamp>,
        ids: Option<&HashSet<String>>,
    ) -> Vec<Record> {
        self.inner
            .read()
            .records
            .values()
            .filter(|record| &record.resource_type == resource_type)
            .filter(|record| since.map_or(true, |since| record.last_modified > since))
            .filter(|record| ids.map_or(true, |ids| ids.contains(&record.id)))
            .cloned()
            .collect()
    }
}
