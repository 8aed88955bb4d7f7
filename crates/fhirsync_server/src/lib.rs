//! # fhirsync Server
//!
//! Reference in-memory sync server for fhirsync.
//!
//! This crate provides:
//! - A paged change feed per resource type, ordered by (last modified, id)
//! - Single and batch writes with optimistic concurrency
//! - Change counts for progress reporting
//! - A path-based dispatcher for the `/sync/*` endpoints
//!
//! # Architecture
//!
//! The server keeps the current version of every record in memory and
//! assigns versions from a monotonic clock. A write is accepted only if the
//! client names the version it last saw; otherwise the server answers with
//! its own copy and lets the client resolve the conflict.
//!
//! ```rust,ignore
//! use fhirsync_protocol::endpoints;
//! use fhirsync_server::{ServerConfig, SyncServer};
//!
//! let server = SyncServer::new(ServerConfig::default());
//! let response = server.handle_post(endpoints::CHANGES, &request_bytes)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;
mod store;

pub use config::{ServerConfig, ValidateFn};
pub use error::{ServerError, ServerResult};
pub use handler::{RequestHandler, ID_FILTER};
pub use server::SyncServer;
pub use store::{Cursor, RecordStore};
