//! Write-then-rename discipline for staged tables

use crate::error::{IngestError, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const STAGED_EXTENSION: &str = "csv";
const PART_SUFFIX: &str = "part";

/// Set of `<table>.csv.part` files that become visible together
///
/// Nothing appears under a canonical name until [`publish`](Self::publish)
/// succeeds. Dropping the set without publishing removes every part file.
#[derive(Debug)]
pub struct StagedOutputs {
    dir: PathBuf,
    pending: Vec<(PathBuf, PathBuf)>,
}

impl StagedOutputs {
    /// Prepare `dir`, clearing part files left by an interrupted run
    pub fn create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if is_part(&path) {
                debug!(path = %path.display(), "Removing leftover part file");
                std::fs::remove_file(&path)?;
            }
        }
        Ok(Self { dir: dir.to_path_buf(), pending: Vec::new() })
    }

    /// Reserve the part file for `table`
    pub fn part_for(&mut self, table: &str) -> Result<PathBuf> {
        let table = sanitize_table(table);
        if table.is_empty() {
            return Err(IngestError::ParseError("empty table name".into()));
        }

        let canonical = self.dir.join(format!("{}.{}", table, STAGED_EXTENSION));
        if self.pending.iter().any(|(_, c)| c == &canonical) {
            return Err(IngestError::ParseError(format!(
                "two inputs map to staged table '{}'",
                table
            )));
        }

        let part = self.dir.join(format!("{}.{}.{}", table, STAGED_EXTENSION, PART_SUFFIX));
        self.pending.push((part.clone(), canonical));
        Ok(part)
    }

    /// Rename every part into place and drop staged tables not produced again
    pub fn publish(mut self) -> Result<Vec<PathBuf>> {
        let pending = std::mem::take(&mut self.pending);

        let mut published = Vec::with_capacity(pending.len());
        for (part, canonical) in &pending {
            if let Err(e) = std::fs::rename(part, canonical) {
                for (leftover, _) in &pending {
                    let _ = std::fs::remove_file(leftover);
                }
                return Err(e.into());
            }
            published.push(canonical.clone());
        }

        let keep: HashSet<&PathBuf> = published.iter().collect();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let staged = path.extension().is_some_and(|ext| ext == STAGED_EXTENSION);
            if staged && !keep.contains(&path) {
                debug!(path = %path.display(), "Removing stale staged table");
                std::fs::remove_file(&path)?;
            }
        }

        published.sort();
        Ok(published)
    }
}

impl Drop for StagedOutputs {
    fn drop(&mut self) {
        for (part, _) in self.pending.drain(..) {
            match std::fs::remove_file(&part) {
                Ok(()) => {},
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => warn!(path = %part.display(), error = %e, "Failed to remove part file"),
            }
        }
    }
}

fn is_part(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == PART_SUFFIX)
}

fn sanitize_table(table: &str) -> String {
    table
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect()
}
