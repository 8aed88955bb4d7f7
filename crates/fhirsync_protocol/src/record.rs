//! Clinical records as seen by the sync engine.
//!
//! The engine treats record content as opaque. It only cares about the
//! identity of a record (`RecordKey`), the server-assigned version
//! (`Timestamp`) and whether the device holds unsynced local edits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A kind of clinical resource (`Patient`, `Observation`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceType(String);

impl ResourceType {
    /// Creates a resource type tag.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the type name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A server-assigned modification timestamp in milliseconds.
///
/// Timestamps are monotonic per record and only ever used as a total
/// order for "what changed since X". They are not wall-clock guarantees
/// across resource types.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The zero timestamp, older than anything the server assigns.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Creates a timestamp from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp in milliseconds.
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a record: its type plus an id unique within that type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// Resource type.
    pub resource_type: ResourceType,
    /// Record id within the type.
    pub id: String,
}

impl RecordKey {
    /// Creates a record key.
    pub fn new(resource_type: impl Into<ResourceType>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

/// A clinical record.
///
/// On the device, `last_modified` is the last server version the record is
/// known to derive from. Local edits leave it untouched and set `dirty`
/// plus `edited_at` instead, so the next upload can be checked against the
/// server with optimistic concurrency.
///
/// `dirty` and `edited_at` are device-local and never go over the wire;
/// records decoded from the server are always clean.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Resource type.
    pub resource_type: ResourceType,
    /// Record id, unique within its type.
    pub id: String,
    /// Server-assigned version.
    pub last_modified: Timestamp,
    /// Opaque record content.
    pub body: Vec<u8>,
    /// Whether the device holds edits the server has not accepted yet.
    #[serde(skip)]
    pub dirty: bool,
    /// When the pending local edit was made.
    #[serde(skip)]
    pub edited_at: Option<Timestamp>,
}

impl Record {
    /// Creates a clean record as the server would send it.
    pub fn new(
        resource_type: impl Into<ResourceType>,
        id: impl Into<String>,
        last_modified: Timestamp,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            last_modified,
            body: body.into(),
            dirty: false,
            edited_at: None,
        }
    }

    /// Returns the record's key.
    pub fn key(&self) -> RecordKey {
        RecordKey {
            resource_type: self.resource_type.clone(),
            id: self.id.clone(),
        }
    }

    /// Returns true if this record has the given key.
    pub fn has_key(&self, key: &RecordKey) -> bool {
        self.resource_type == key.resource_type && self.id == key.id
    }

    /// Returns a copy carrying a local edit of the body.
    ///
    /// The server version is kept as the baseline for the next upload.
    pub fn with_local_edit(&self, body: impl Into<Vec<u8>>, edited_at: Timestamp) -> Self {
        Self {
            body: body.into(),
            dirty: true,
            edited_at: Some(edited_at),
            ..self.clone()
        }
    }

    /// Returns a clean copy at the given server version.
    pub fn into_clean(self, version: Timestamp) -> Self {
        Self {
            last_modified: version,
            dirty: false,
            edited_at: None,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{from_cbor, to_cbor};

    #[test]
    fn key_display_uses_type_slash_id() {
        let key = RecordKey::new("Patient", "p1");
        assert_eq!(key.to_string(), "Patient/p1");
    }

    #[test]
    fn local_edit_keeps_baseline() {
        let record = Record::new("Patient", "p1", Timestamp::from_millis(10), b"v0".to_vec());
        let edited = record.with_local_edit(b"v1".to_vec(), Timestamp::from_millis(15));

        assert!(edited.dirty);
        assert_eq!(edited.last_modified, Timestamp::from_millis(10));
        assert_eq!(edited.edited_at, Some(Timestamp::from_millis(15)));
        assert_eq!(edited.body, b"v1");
    }

    #[test]
    fn into_clean_adopts_version() {
        let record = Record::new("Patient", "p1", Timestamp::from_millis(10), b"v0".to_vec())
            .with_local_edit(b"v1".to_vec(), Timestamp::from_millis(15))
            .into_clean(Timestamp::from_millis(20));

        assert!(!record.dirty);
        assert_eq!(record.edited_at, None);
        assert_eq!(record.last_modified, Timestamp::from_millis(20));
        assert_eq!(record.body, b"v1");
    }

    #[test]
    fn local_state_does_not_travel() {
        let record = Record::new("Observation", "o1", Timestamp::from_millis(3), b"x".to_vec())
            .with_local_edit(b"y".to_vec(), Timestamp::from_millis(4));

        let decoded: Record = from_cbor(&to_cbor(&record).unwrap()).unwrap();
        assert!(!decoded.dirty);
        assert_eq!(decoded.edited_at, None);
        assert_eq!(decoded.body, b"y");
        assert_eq!(decoded.key(), record.key());
    }

    #[test]
    fn timestamps_order_numerically() {
        assert!(Timestamp::from_millis(9) < Timestamp::from_millis(10));
        assert_eq!(Timestamp::ZERO, Timestamp::default());
    }
}
