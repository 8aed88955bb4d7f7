//! HTTP paths of the sync API.
//!
//! Every endpoint takes a CBOR-encoded request body via POST and answers
//! with a CBOR-encoded response body.

/// Change feed: `FetchRequest` -> `FetchResponse`.
pub const CHANGES: &str = "/sync/changes";

/// Single write: `WriteRequest` -> `WriteOutcome`.
pub const WRITE: &str = "/sync/write";

/// Batch write: `BatchWriteRequest` -> `BatchWriteResponse`.
pub const BATCH: &str = "/sync/batch";

/// Change count: `CountRequest` -> `CountResponse`.
pub const COUNT: &str = "/sync/count";

/// Common prefix of all endpoints.
pub const PREFIX: &str = "/sync/";
