//! Stager
//!
//! Converts fetched members into uniform CSV tables under
//! `staging/<source>/<table>.csv`. The strategy follows the source's
//! `link_type`:
//!
//! | link_type          | strategy                    |
//! |--------------------|-----------------------------|
//! | `pg_dump`          | relational dump (`COPY`)    |
//! | `baseurl`/`direct` | tab-delimited bundle        |
//! | `index_json`       | JSON partitions             |
//!
//! All outputs of one stage become visible together or not at all.

mod delimited;
pub mod output;
pub mod partitions;
pub mod relational;

use crate::config::DatabaseCredentials;
use crate::error::{IngestError, Result};
use crate::models::{LinkType, SourceDescriptor};
use output::StagedOutputs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStrategy {
    Relational,
    Delimited,
    JsonPartitions,
}

impl StageStrategy {
    pub fn for_link_type(link_type: LinkType) -> Self {
        match link_type {
            LinkType::PgDump => StageStrategy::Relational,
            LinkType::BaseUrl | LinkType::Direct => StageStrategy::Delimited,
            LinkType::IndexJson => StageStrategy::JsonPartitions,
        }
    }
}

/// Rows written and rows dropped while staging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowTally {
    pub rows: u64,
    pub skipped: u64,
}

impl RowTally {
    pub fn add(&mut self, other: RowTally) {
        self.rows += other.rows;
        self.skipped += other.skipped;
    }

    /// Fails when the skipped share is strictly above `max_ratio`
    pub fn check(&self, max_ratio: f64) -> Result<()> {
        let seen = self.rows + self.skipped;
        if seen == 0 || self.skipped == 0 {
            return Ok(());
        }
        let ratio = self.skipped as f64 / seen as f64;
        if ratio > max_ratio {
            return Err(IngestError::ParseError(format!(
                "skipped {} of {} rows ({:.2}% > {:.2}%)",
                self.skipped,
                seen,
                ratio * 100.0,
                max_ratio * 100.0
            )));
        }
        Ok(())
    }
}

pub struct StageContext<'a> {
    pub descriptor: &'a SourceDescriptor,
    /// `extract/<source>`, holding one numbered directory per URI
    pub extract_dir: &'a Path,
    /// `staging/<source>`
    pub staging_dir: &'a Path,
    pub max_skipped_ratio: f64,
    pub database: Option<&'a DatabaseCredentials>,
    pub cancel: &'a CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub strategy: StageStrategy,
    pub outputs: Vec<PathBuf>,
    pub tally: RowTally,
}

impl StageReport {
    /// Short form stored as the stage event's return value
    pub fn summary(&self) -> String {
        match self.strategy {
            StageStrategy::Relational => format!("tables={}", self.outputs.len()),
            _ => format!(
                "tables={} rows={} skipped={}",
                self.outputs.len(),
                self.tally.rows,
                self.tally.skipped
            ),
        }
    }
}

/// Stage a fetched source; on any failure no new canonical file appears
pub async fn stage(ctx: &StageContext<'_>) -> Result<StageReport> {
    let strategy = StageStrategy::for_link_type(ctx.descriptor.link_type);
    let mut outputs = StagedOutputs::create(ctx.staging_dir)?;

    let tally = match strategy {
        StageStrategy::Relational => relational::stage(ctx, &mut outputs).await?,
        StageStrategy::Delimited => delimited::stage(ctx, &mut outputs).await?,
        StageStrategy::JsonPartitions => partitions::stage(ctx, &mut outputs).await?,
    };
    tally.check(ctx.max_skipped_ratio)?;

    if ctx.cancel.is_cancelled() {
        return Err(IngestError::Cancelled);
    }
    let published = outputs.publish()?;

    info!(
        source = %ctx.descriptor.name,
        ?strategy,
        tables = published.len(),
        rows = tally.rows,
        skipped = tally.skipped,
        "Stage complete"
    );

    Ok(StageReport { strategy, outputs: published, tally })
}

pub(crate) fn csv_error(path: &Path, err: csv::Error) -> IngestError {
    match err.into_kind() {
        csv::ErrorKind::Io(io) => IngestError::Io(io),
        other => IngestError::ParseError(format!("{}: {:?}", path.display(), other)),
    }
}

pub(crate) fn join_error(err: tokio::task::JoinError) -> IngestError {
    IngestError::Io(std::io::Error::other(err))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_selection() {
        assert_eq!(StageStrategy::for_link_type(LinkType::PgDump), StageStrategy::Relational);
        assert_eq!(StageStrategy::for_link_type(LinkType::Direct), StageStrategy::Delimited);
        assert_eq!(StageStrategy::for_link_type(LinkType::BaseUrl), StageStrategy::Delimited);
        assert_eq!(
            StageStrategy::for_link_type(LinkType::IndexJson),
            StageStrategy::JsonPartitions
        );
    }

    #[test]
    fn test_skip_threshold_is_strict() {
        assert!(RowTally { rows: 99, skipped: 1 }.check(0.01).is_ok());
        assert!(RowTally { rows: 98, skipped: 2 }.check(0.01).is_err());
        assert!(RowTally { rows: 0, skipped: 0 }.check(0.0).is_ok());
        assert!(RowTally { rows: 0, skipped: 1 }.check(0.5).is_err());
    }
}
