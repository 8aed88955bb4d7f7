//! Protocol messages for sync.

use crate::codec::{from_cbor, to_cbor, WireMessage};
use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{Record, RecordKey, ResourceType, Timestamp};
use serde::{Deserialize, Serialize};

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Change feed request.
    FetchRequest(FetchRequest),
    /// Change feed page.
    FetchResponse(FetchResponse),
    /// Single record write.
    WriteRequest(WriteRequest),
    /// Outcome of a single record write.
    WriteResponse(WriteOutcome),
    /// Batch write.
    BatchWriteRequest(BatchWriteRequest),
    /// Per-record outcomes of a batch write.
    BatchWriteResponse(BatchWriteResponse),
    /// Change count request.
    CountRequest(CountRequest),
    /// Change count.
    CountResponse(CountResponse),
}

impl SyncMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::FetchRequest(_) => 1,
            SyncMessage::FetchResponse(_) => 2,
            SyncMessage::WriteRequest(_) => 3,
            SyncMessage::WriteResponse(_) => 4,
            SyncMessage::BatchWriteRequest(_) => 5,
            SyncMessage::BatchWriteResponse(_) => 6,
            SyncMessage::CountRequest(_) => 7,
            SyncMessage::CountResponse(_) => 8,
        }
    }

    /// Encodes as a type code byte followed by the CBOR body.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut bytes = vec![self.type_code()];
        let body = match self {
            SyncMessage::FetchRequest(m) => to_cbor(m)?,
            SyncMessage::FetchResponse(m) => to_cbor(m)?,
            SyncMessage::WriteRequest(m) => to_cbor(m)?,
            SyncMessage::WriteResponse(m) => to_cbor(m)?,
            SyncMessage::BatchWriteRequest(m) => to_cbor(m)?,
            SyncMessage::BatchWriteResponse(m) => to_cbor(m)?,
            SyncMessage::CountRequest(m) => to_cbor(m)?,
            SyncMessage::CountResponse(m) => to_cbor(m)?,
        };
        bytes.extend(body);
        Ok(bytes)
    }

    /// Decodes a message produced by [`SyncMessage::encode`].
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let (&code, body) = bytes
            .split_first()
            .ok_or_else(|| ProtocolError::Decode("empty message".into()))?;

        Ok(match code {
            1 => SyncMessage::FetchRequest(from_cbor(body)?),
            2 => SyncMessage::FetchResponse(from_cbor(body)?),
            3 => SyncMessage::WriteRequest(from_cbor(body)?),
            4 => SyncMessage::WriteResponse(from_cbor(body)?),
            5 => SyncMessage::BatchWriteRequest(from_cbor(body)?),
            6 => SyncMessage::BatchWriteResponse(from_cbor(body)?),
            7 => SyncMessage::CountRequest(from_cbor(body)?),
            8 => SyncMessage::CountResponse(from_cbor(body)?),
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

/// An extra search parameter narrowing what the server returns.
///
/// Used to scope downloads, e.g. to the patient list a user is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeFilter {
    /// Parameter name.
    pub name: String,
    /// Parameter value.
    pub value: String,
}

impl ScopeFilter {
    /// Creates a filter.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Request for one page of changes of a resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Resource type to fetch.
    pub resource_type: ResourceType,
    /// Only records modified strictly after this timestamp.
    pub since: Option<Timestamp>,
    /// Continuation cursor from the previous page.
    pub cursor: Option<String>,
    /// Maximum records per page.
    pub limit: u32,
    /// Additional scope filters.
    #[serde(default)]
    pub filters: Vec<ScopeFilter>,
}

impl FetchRequest {
    /// Creates a request for the first page.
    pub fn new(resource_type: ResourceType, since: Option<Timestamp>, limit: u32) -> Self {
        Self {
            resource_type,
            since,
            cursor: None,
            limit,
            filters: Vec::new(),
        }
    }

    /// Sets the continuation cursor.
    pub fn with_cursor(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    /// Sets the scope filters.
    pub fn with_filters(mut self, filters: Vec<ScopeFilter>) -> Self {
        self.filters = filters;
        self
    }
}

impl WireMessage for FetchRequest {}

/// One page of the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// Records in this page.
    pub records: Vec<Record>,
    /// Cursor for the next page; `None` when the feed is exhausted.
    pub next_cursor: Option<String>,
}

impl FetchResponse {
    /// Creates a page.
    pub fn new(records: Vec<Record>, next_cursor: Option<String>) -> Self {
        Self {
            records,
            next_cursor,
        }
    }

    /// Creates the final page.
    pub fn last(records: Vec<Record>) -> Self {
        Self::new(records, None)
    }

    /// Checks that every record has the requested type.
    pub fn validate(&self, resource_type: &ResourceType) -> ProtocolResult<()> {
        if let Some(stray) = self
            .records
            .iter()
            .find(|r| &r.resource_type != resource_type)
        {
            return Err(ProtocolError::invalid(format!(
                "page for {} contains {}",
                resource_type,
                stray.key()
            )));
        }
        if let Some(empty) = self.records.iter().find(|r| r.id.is_empty()) {
            return Err(ProtocolError::invalid(format!(
                "record of type {} has an empty id",
                empty.resource_type
            )));
        }
        Ok(())
    }
}

impl WireMessage for FetchResponse {}

/// Write of one record, guarded by the version the client last saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Record content to store.
    pub record: Record,
    /// Server version the local edit is based on; `None` for a new record.
    pub known_version: Option<Timestamp>,
}

impl WriteRequest {
    /// Creates a write request.
    pub fn new(record: Record, known_version: Option<Timestamp>) -> Self {
        Self {
            record,
            known_version,
        }
    }
}

impl WireMessage for WriteRequest {}

/// Server verdict on a single write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOutcome {
    /// Stored; the record now has this version.
    Accepted {
        /// New server version.
        version: Timestamp,
    },
    /// Refused for domain reasons.
    Rejected {
        /// Why the server refused the write.
        reason: String,
    },
    /// The record changed on the server since `known_version`.
    Conflict {
        /// The server's current record.
        server: Record,
    },
}

impl WriteOutcome {
    /// Creates a rejection.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// Returns true if the write was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, WriteOutcome::Accepted { .. })
    }
}

impl WireMessage for WriteOutcome {}

/// Several writes sent as one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchWriteRequest {
    /// Individual writes.
    pub writes: Vec<WriteRequest>,
}

impl BatchWriteRequest {
    /// Creates a batch.
    pub fn new(writes: Vec<WriteRequest>) -> Self {
        Self { writes }
    }
}

impl WireMessage for BatchWriteRequest {}

/// Outcome for one record of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntryOutcome {
    /// Which record this outcome belongs to.
    pub key: RecordKey,
    /// The verdict.
    pub outcome: WriteOutcome,
}

/// Per-record outcomes of a batch write.
///
/// Entries are matched to requests by key, not by position; the server may
/// reorder or omit entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchWriteResponse {
    /// Outcomes.
    pub outcomes: Vec<BatchEntryOutcome>,
}

impl BatchWriteResponse {
    /// Creates a response.
    pub fn new(outcomes: Vec<BatchEntryOutcome>) -> Self {
        Self { outcomes }
    }
}

impl WireMessage for BatchWriteResponse {}

/// Asks how many records of a type changed since a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountRequest {
    /// Resource type.
    pub resource_type: ResourceType,
    /// Only count records modified strictly after this timestamp.
    pub since: Option<Timestamp>,
    /// Additional scope filters.
    #[serde(default)]
    pub filters: Vec<ScopeFilter>,
}

impl CountRequest {
    /// Creates a count request.
    pub fn new(resource_type: ResourceType, since: Option<Timestamp>) -> Self {
        Self {
            resource_type,
            since,
            filters: Vec::new(),
        }
    }

    /// Sets the scope filters.
    pub fn with_filters(mut self, filters: Vec<ScopeFilter>) -> Self {
        self.filters = filters;
        self
    }
}

impl WireMessage for CountRequest {}

/// Number of changed records, if the server can tell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountResponse {
    /// Total number of matching records.
    pub total: Option<u64>,
}

impl WireMessage for CountResponse {}
