//! Error taxonomy for the ingestion engine
//!
//! Every failure the engine can surface maps onto an [`ErrorKind`], whose
//! numeric [`ErrorKind::code`] is both the `return_code` stored on error
//! events and the process exit code of the `dap-ingest` binary.

use dap_common::DapError;
use reqwest::StatusCode;
use thiserror::Error;

/// Errors raised by the ingestion engine
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Configuration not found: {0}")]
    ConfigNotFound(String),

    #[error("Malformed configuration: {0}")]
    ConfigMalformed(String),

    #[error("Transient upstream failure: {0}")]
    Transient(String),

    #[error("Permanent upstream failure: {0}")]
    Permanent(String),

    #[error("Upstream layout changed: {0}")]
    UpstreamLayoutChanged(String),

    #[error("Unsafe archive member: {0}")]
    UnsafeArchiveMember(String),

    #[error("Integrity mismatch: {0}")]
    IntegrityMismatch(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("cancelled")]
    Cancelled,

    #[error("Source '{0}' already exists")]
    Conflict(String),

    #[error("Source '{0}' not found")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] DapError),
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Logical failure classes and their numeric codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ConfigNotFound,
    ConfigMalformed,
    Transient,
    Permanent,
    UpstreamLayoutChanged,
    UnsafeArchiveMember,
    IntegrityMismatch,
    ParseError,
    Cancelled,
    StoreError,
}

impl ErrorKind {
    /// Code recorded on events and returned as the exit status
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::ConfigNotFound => 10,
            ErrorKind::ConfigMalformed => 11,
            ErrorKind::Transient => 20,
            ErrorKind::Permanent => 21,
            ErrorKind::UpstreamLayoutChanged => 30,
            ErrorKind::UnsafeArchiveMember => 31,
            ErrorKind::IntegrityMismatch => 32,
            ErrorKind::ParseError => 40,
            ErrorKind::Cancelled => 50,
            ErrorKind::StoreError => 60,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConfigNotFound => "ConfigNotFound",
            ErrorKind::ConfigMalformed => "ConfigMalformed",
            ErrorKind::Transient => "Transient",
            ErrorKind::Permanent => "Permanent",
            ErrorKind::UpstreamLayoutChanged => "UpstreamLayoutChanged",
            ErrorKind::UnsafeArchiveMember => "UnsafeArchiveMember",
            ErrorKind::IntegrityMismatch => "IntegrityMismatch",
            ErrorKind::ParseError => "ParseError",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::StoreError => "StoreError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::ConfigNotFound(_) => ErrorKind::ConfigNotFound,
            IngestError::ConfigMalformed(_) => ErrorKind::ConfigMalformed,
            IngestError::Transient(_) => ErrorKind::Transient,
            IngestError::Permanent(_) | IngestError::Io(_) | IngestError::Common(_) => {
                ErrorKind::Permanent
            },
            IngestError::UpstreamLayoutChanged(_) => ErrorKind::UpstreamLayoutChanged,
            IngestError::UnsafeArchiveMember(_) => ErrorKind::UnsafeArchiveMember,
            IngestError::IntegrityMismatch(_) => ErrorKind::IntegrityMismatch,
            IngestError::ParseError(_) => ErrorKind::ParseError,
            IngestError::Cancelled => ErrorKind::Cancelled,
            IngestError::Conflict(_)
            | IngestError::NotFound(_)
            | IngestError::Store(_)
            | IngestError::Migration(_) => ErrorKind::StoreError,
        }
    }

    /// Process exit code for a failure that ends the command
    pub fn exit_code(&self) -> i32 {
        self.kind().code()
    }

    /// Whether the fetcher may absorb this failure by retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::Transient(_) | IngestError::IntegrityMismatch(_))
    }

    /// Classify a non-success HTTP status
    ///
    /// 5xx, 408 and 429 are transient; every other status is permanent.
    pub fn from_status(status: StatusCode, url: &str) -> Self {
        let message = format!("HTTP {} from {}", status.as_u16(), url);
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            IngestError::Transient(message)
        } else {
            IngestError::Permanent(message)
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        if let Some(status) = err.status() {
            return IngestError::from_status(status, &url);
        }
        if err.is_timeout() {
            IngestError::Transient(format!("timed out: {}", err))
        } else if err.is_body() || err.is_decode() {
            IngestError::IntegrityMismatch(format!("body of {} interrupted: {}", url, err))
        } else {
            // Connection and DNS failures land here.
            IngestError::Permanent(err.to_string())
        }
    }
}
