//! DAP Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging and checksum utilities for the drug
//! approval pipeline workspace.
//!
//! - **Error Handling**: [`DapError`] and the [`Result`] alias
//! - **Logging**: [`logging::init_logging`] configures `tracing` output
//! - **Checksums**: SHA-256 digests for fetched artifacts
//!
//! # Example
//!
//! ```no_run
//! use dap_common::checksum::sha256_file;
//!
//! fn describe(path: &str) -> dap_common::Result<()> {
//!     let digest = sha256_file(path)?;
//!     tracing::info!(path, sha256 = %digest, "Fetched artifact");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{DapError, Result};
