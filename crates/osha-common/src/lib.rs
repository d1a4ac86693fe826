//! OSHA ETL Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities and error handling for the OSHA ETL workspace.
//!
//! # Overview
//!
//! - **Error Handling**: Common error type and result alias
//! - **Checksums**: SHA-256 digests of source files and byte buffers
//! - **Logging**: Centralized `tracing` subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use osha_common::checksum::sha256_file;
//!
//! fn fingerprint(path: &str) -> osha_common::Result<()> {
//!     let digest = sha256_file(path)?;
//!     tracing::info!(%digest, "Source file fingerprint");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
