//! Error types shared across DAP crates

use thiserror::Error;

/// Result type alias for shared DAP utilities
pub type Result<T> = std::result::Result<T, DapError>;

/// Errors raised by the shared utilities
#[derive(Error, Debug)]
pub enum DapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
