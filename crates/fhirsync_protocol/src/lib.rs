//! # fhirsync Protocol
//!
//! Record model and sync protocol messages for fhirsync.
//!
//! This crate provides:
//! - `Record`, `RecordKey`, `ResourceType` and `Timestamp`
//! - Change-feed messages (`FetchRequest` / `FetchResponse`)
//! - Write messages with optimistic concurrency (`WriteRequest` / `WriteOutcome`)
//! - Batch writes with per-record outcomes
//! - CBOR encoding/decoding
//! - The HTTP endpoint paths of the sync API
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
pub mod endpoints;
mod error;
mod messages;
mod record;

pub use codec::{from_cbor, to_cbor, WireMessage};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    BatchEntryOutcome, BatchWriteRequest, BatchWriteResponse, CountRequest, CountResponse,
    FetchRequest, FetchResponse, ScopeFilter, SyncMessage, WriteOutcome, WriteRequest,
};
pub use record::{Record, RecordKey, ResourceType, Timestamp};
