//! ZIP container expansion with member path validation

use crate::error::{IngestError, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

const ZIP_CONTENT_TYPES: [&str; 3] =
    ["application/zip", "application/x-zip-compressed", "application/x-zip"];

/// Whether a download should be expanded as a ZIP container
pub fn is_zip(uri: &str, content_type: Option<&str>) -> bool {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    if path.to_ascii_lowercase().ends_with(".zip") {
        return true;
    }
    content_type
        .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .is_some_and(|ct| ZIP_CONTENT_TYPES.contains(&ct.as_str()))
}

/// Relative path a member may be written to
///
/// Absolute paths, drive prefixes and `..` components are refused.
pub fn member_path(name: &str) -> Result<PathBuf> {
    let unsafe_member = || IngestError::UnsafeArchiveMember(name.to_string());

    // Archives built on Windows may use backslashes as separators.
    let normalized = name.replace('\\', "/");
    if normalized.is_empty() || normalized.starts_with('/') || normalized.contains(':') {
        return Err(unsafe_member());
    }

    let mut path = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {},
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_member());
            },
        }
    }
    Ok(path)
}

fn integrity(archive: &Path, err: ZipError) -> IngestError {
    IngestError::IntegrityMismatch(format!("{}: {}", archive.display(), err))
}

/// Expand `archive` into `target`, returning the files written
///
/// Every member name is validated before anything is written, so a rejected
/// archive leaves `target` untouched.
pub fn extract_zip(archive: &Path, target: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file).map_err(|e| integrity(archive, e))?;

    let mut members = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let entry = zip.by_index_raw(i).map_err(|e| integrity(archive, e))?;
        members.push((member_path(entry.name())?, entry.is_dir()));
    }

    let mut written = Vec::new();
    for (i, (relative, is_dir)) in members.into_iter().enumerate() {
        let destination = target.join(&relative);
        if is_dir {
            fs::create_dir_all(&destination)?;
            continue;
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut entry = zip.by_index(i).map_err(|e| integrity(archive, e))?;
        let mut out = File::create(&destination)?;
        io::copy(&mut entry, &mut out).map_err(|e| {
            IngestError::IntegrityMismatch(format!(
                "{} in {}: {}",
                relative.display(),
                archive.display(),
                e
            ))
        })?;

        debug!(member = %relative.display(), "Extracted archive member");
        written.push(destination);
    }

    Ok(written)
}
