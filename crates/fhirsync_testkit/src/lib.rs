//! # fhirsync Testkit
//!
//! Test utilities for fhirsync.
//!
//! This crate provides:
//! - Record fixtures named after the clinical resources they stand in for
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fhirsync_testkit::prelude::*;
//!
//! let local = patient("p1", 10, "B1").with_local_edit(b"B1'".to_vec(), ts(12));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
