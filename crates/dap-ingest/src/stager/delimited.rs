//! Tab-delimited bundle strategy
//!
//! Every `.txt` / `.tsv` file of the fetched bundle becomes one staged table
//! named after the file's basename. Rows whose field count differs from the
//! header are dropped and counted.

use super::{csv_error, join_error, RowTally, StageContext};
use super::output::StagedOutputs;
use crate::error::{IngestError, Result};
use crate::fetcher::list_files;
use csv::{ByteRecord, ReaderBuilder, WriterBuilder};
use std::path::Path;
use tracing::{debug, info};

const EXTENSIONS: [&str; 2] = ["txt", "tsv"];

pub(super) async fn stage(ctx: &StageContext<'_>, outputs: &mut StagedOutputs) -> Result<RowTally> {
    let inputs: Vec<_> = list_files(ctx.extract_dir)?
        .into_iter()
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();

    let mut total = RowTally::default();
    for input in inputs {
        if ctx.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let table = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let part = outputs.part_for(&table)?;

        let source = input.clone();
        let tally = tokio::task::spawn_blocking(move || convert(&source, &part))
            .await
            .map_err(join_error)??;

        info!(
            source = %ctx.descriptor.name,
            table = %table,
            rows = tally.rows,
            skipped = tally.skipped,
            "Staged delimited file"
        );
        total.add(tally);
    }

    Ok(total)
}

/// Convert one tab-separated file into a CSV part file
pub(super) fn convert(input: &Path, part: &Path) -> Result<RowTally> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .quoting(false)
        .from_path(input)
        .map_err(|e| csv_error(input, e))?;
    let mut writer = WriterBuilder::new().from_path(part).map_err(|e| csv_error(part, e))?;

    let headers = reader.byte_headers().map_err(|e| csv_error(input, e))?.clone();
    let mut tally = RowTally::default();
    if headers.is_empty() {
        writer.flush()?;
        return Ok(tally);
    }
    writer.write_byte_record(&headers).map_err(|e| csv_error(part, e))?;

    let mut record = ByteRecord::new();
    loop {
        match reader.read_byte_record(&mut record) {
            Ok(true) if record.len() == headers.len() => {
                writer.write_byte_record(&record).map_err(|e| csv_error(part, e))?;
                tally.rows += 1;
            },
            Ok(true) => {
                debug!(
                    file = %input.display(),
                    line = record.position().map(|p| p.line()).unwrap_or(0),
                    fields = record.len(),
                    expected = headers.len(),
                    "Skipping row with mismatched field count"
                );
                tally.skipped += 1;
            },
            Ok(false) => break,
            Err(e) if e.is_io_error() => return Err(csv_error(input, e)),
            Err(_) => tally.skipped += 1,
        }
    }

    writer.flush()?;
    Ok(tally)
}
