//! JSON partition strategy
//!
//! Each fetched URI directory (`000`, `001`, ...) holds one partition whose
//! document carries an ordered `results` array of records. Partitions are
//! visited lazily, one at a time, and each becomes `partition_<nnn>.csv`.
//!
//! Columns are the union of flattened keys in first-seen order. Nested
//! objects are flattened one level into `parent.child`; anything deeper, and
//! every array, is kept as compact JSON text. `null` is an empty field.

use super::output::StagedOutputs;
use super::{csv_error, join_error, RowTally, StageContext};
use crate::error::{IngestError, Result};
use crate::fetcher::list_files;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::info;

/// One partition on disk
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub ordinal: usize,
    pub path: PathBuf,
}

impl Partition {
    pub fn table_name(&self) -> String {
        format!("partition_{:03}", self.ordinal)
    }
}

/// Lazy, single-pass sequence of partitions under an extract directory
pub struct Partitions {
    dirs: std::vec::IntoIter<(usize, PathBuf)>,
}

impl Partitions {
    pub fn open(extract_dir: &Path) -> Result<Self> {
        let mut dirs = Vec::new();
        if extract_dir.is_dir() {
            for entry in std::fs::read_dir(extract_dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                if let Some(ordinal) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                    dirs.push((ordinal, entry.path()));
                }
            }
        }
        dirs.sort();
        Ok(Self { dirs: dirs.into_iter() })
    }
}

impl Iterator for Partitions {
    type Item = Result<Partition>;

    fn next(&mut self) -> Option<Self::Item> {
        let (ordinal, dir) = self.dirs.next()?;
        Some(partition_file(&dir).map(|path| Partition { ordinal, path }))
    }
}

fn partition_file(dir: &Path) -> Result<PathBuf> {
    let files = list_files(dir)?;
    files
        .iter()
        .find(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")))
        .or_else(|| files.first())
        .cloned()
        .ok_or_else(|| IngestError::ParseError(format!("partition {} is empty", dir.display())))
}

pub(super) async fn stage(ctx: &StageContext<'_>, outputs: &mut StagedOutputs) -> Result<RowTally> {
    let mut total = RowTally::default();

    for partition in Partitions::open(ctx.extract_dir)? {
        if ctx.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        let partition = partition?;
        let table = partition.table_name();
        let part = outputs.part_for(&table)?;

        let input = partition.path.clone();
        let tally = tokio::task::spawn_blocking(move || convert(&input, &part))
            .await
            .map_err(join_error)??;

        info!(
            source = %ctx.descriptor.name,
            partition = partition.ordinal,
            rows = tally.rows,
            skipped = tally.skipped,
            "Staged JSON partition"
        );
        total.add(tally);
    }

    Ok(total)
}

/// Flatten one partition document into a CSV part file
pub(super) fn convert(input: &Path, part: &Path) -> Result<RowTally> {
    let reader = BufReader::new(File::open(input)?);
    let document: Value = serde_json::from_reader(reader)
        .map_err(|e| IngestError::ParseError(format!("{}: {}", input.display(), e)))?;
    let records = document.get("results").and_then(Value::as_array).ok_or_else(|| {
        IngestError::ParseError(format!("{}: no results array", input.display()))
    })?;

    let mut tally = RowTally::default();
    let mut columns: Vec<String> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for record in records {
        let Some(object) = record.as_object() else { continue };
        for (column, _) in flatten(object) {
            if !index.contains_key(&column) {
                index.insert(column.clone(), columns.len());
                columns.push(column);
            }
        }
    }

    let mut writer = csv::Writer::from_path(part).map_err(|e| csv_error(part, e))?;
    if !columns.is_empty() {
        writer.write_record(&columns).map_err(|e| csv_error(part, e))?;
    }

    for record in records {
        let Some(object) = record.as_object() else {
            tally.skipped += 1;
            continue;
        };
        let mut row = vec![String::new(); columns.len()];
        for (column, value) in flatten(object) {
            if let Some(&i) = index.get(&column) {
                row[i] = value;
            }
        }
        writer.write_record(&row).map_err(|e| csv_error(part, e))?;
        tally.rows += 1;
    }

    writer.flush()?;
    Ok(tally)
}

fn flatten(object: &Map<String, Value>) -> Vec<(String, String)> {
    let mut fields = Vec::with_capacity(object.len());
    for (key, value) in object {
        match value {
            Value::Object(inner) => {
                for (child, nested) in inner {
                    fields.push((format!("{}.{}", key, child), cell(nested)));
                }
            },
            other => fields.push((key.clone(), cell(other))),
        }
    }
    fields
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}
