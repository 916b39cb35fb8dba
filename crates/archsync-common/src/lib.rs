//! Archsync Common Library
//!
//! Shared utilities and error handling for the archsync workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Checksums**: streaming SHA-256 / MD5 digests for integrity verification
//! - **Logging**: centralized `tracing` subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use archsync_common::checksum::{compute_file_checksum, verify_file_checksum};
//!
//! fn check(path: &str, expected: &str) -> archsync_common::Result<()> {
//!     let actual = compute_file_checksum(path)?;
//!     println!("sha256: {}", actual);
//!     verify_file_checksum(path, expected)
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
