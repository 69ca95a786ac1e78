//! EBD Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging and artifact utilities for the EBD
//! aggregation workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`EbdError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup shared by every binary
//! - **Publishing**: write-to-partial-then-rename discipline for stage outputs
//! - **Checksums**: SHA-256 digests of finished artifacts
//! - **Formatting**: durations, byte sizes and memory-limit parsing
//!
//! # Example
//!
//! ```no_run
//! use ebd_common::publish::{is_materialized, PartialFile};
//!
//! fn write_report(path: &std::path::Path) -> ebd_common::Result<()> {
//!     if is_materialized(path) {
//!         return Ok(());
//!     }
//!     let partial = PartialFile::create(path)?;
//!     std::fs::write(partial.path(), b"done")?;
//!     partial.publish()?;
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod format;
pub mod logging;
pub mod publish;

// Re-export commonly used types
pub use error::{EbdError, Result};
