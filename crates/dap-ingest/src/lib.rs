//! DAP Ingest Library
//!
//! Keeps local copies of public drug and clinical-trial datasets current.
//!
//! # Overview
//!
//! Each configured source goes through a small pipeline:
//!
//! - **Visit**: probe the publisher's landing page or index document for
//!   download URIs and a last-updated date
//! - **Decide**: compare that date and the source's lifecycle with the last
//!   extraction and skip sources that are still fresh
//! - **Fetch**: download every URI with retry and unpack archives safely
//! - **Stage**: convert the fetched files into one CSV per table under
//!   `staging/<source>/`
//!
//! Source state and an append-only event log live in a SQLite metadata
//! repository. Every phase writes its event and descriptor changes in one
//! transaction.

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod archive;
pub mod clock;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod freshness;
pub mod http;
pub mod models;
pub mod repository;
pub mod stager;
pub mod visitor;

// Re-export commonly used types
pub use config::Profile;
pub use coordinator::{Coordinator, RunReport, SourceState};
pub use error::{ErrorKind, IngestError, Result};
pub use repository::MetadataRepository;

use clap::{Parser, Subcommand};

/// DAP ingest - refresh, download and stage public datasets
#[derive(Parser, Debug)]
#[command(name = "dap-ingest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration profile to load from the config directory
    #[arg(short, long, env = "DAP_PROFILE", default_value = config::DEFAULT_PROFILE, global = true)]
    pub profile: String,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Visit, fetch and stage sources that are due
    Run {
        /// Restrict the run to these sources (repeatable)
        #[arg(short, long = "source")]
        sources: Vec<String>,
    },

    /// Create descriptors for profile sources missing from the repository
    Seed,

    /// List every descriptor in the repository
    Sources,

    /// List sources whose cached state says they are due
    Due,

    /// Show the event log of one source
    Events {
        /// Source name
        source: String,

        /// Only events starting at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<chrono::DateTime<chrono::Utc>>,
    },
}

/// Open the repository configured by a profile
pub async fn open_repository(profile: &Profile) -> Result<MetadataRepository> {
    let config = repository::RepositoryConfig::new(&profile.paths.repository);
    MetadataRepository::open(&config).await
}
