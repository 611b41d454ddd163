//! Fetcher
//!
//! Streams a URI into a `*.part` file inside the target directory, checks the
//! received size against `Content-Length`, renames the file into place and
//! expands ZIP containers. Transient failures and integrity mismatches are
//! retried with bounded exponential backoff; anything else surfaces at once.

use crate::archive;
use crate::error::{IngestError, Result};
use crate::http::{self, RetryPolicy};
use dap_common::checksum;
use futures::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FALLBACK_FILE_NAME: &str = "download";

/// Result of materializing one URI
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedUri {
    pub uri: String,
    pub dir: PathBuf,
    /// Files present under `dir` after expansion, sorted
    pub files: Vec<PathBuf>,
    /// Bytes received over the wire
    pub bytes: u64,
    pub retries: u32,
}

pub struct Fetcher<'a> {
    client: &'a Client,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<'a> Fetcher<'a> {
    pub fn new(client: &'a Client, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { client, policy, cancel }
    }

    /// Download `uri` into `target_dir`, which is emptied first
    pub async fn fetch(&self, uri: &str, target_dir: &Path) -> Result<FetchedUri> {
        let mut retries = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            reset_dir(target_dir).await?;

            match self.fetch_once(uri, target_dir).await {
                Ok(bytes) => {
                    let files = list_files(target_dir)?;
                    info!(uri, files = files.len(), bytes, retries, "Fetched");
                    return Ok(FetchedUri {
                        uri: uri.to_string(),
                        dir: target_dir.to_path_buf(),
                        files,
                        bytes,
                        retries,
                    });
                },
                Err(err) if err.is_retryable() && retries + 1 < self.policy.max_attempts => {
                    retries += 1;
                    let delay = self.policy.delay(retries);
                    warn!(
                        uri,
                        error = %err,
                        attempt = retries,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch failed, retrying"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
                        _ = tokio::time::sleep(delay) => {},
                    }
                },
                Err(IngestError::IntegrityMismatch(msg)) => {
                    let _ = tokio::fs::remove_dir_all(target_dir).await;
                    return Err(IngestError::Permanent(format!(
                        "integrity check still failing after {} attempts: {}",
                        retries + 1,
                        msg
                    )));
                },
                Err(err) => {
                    let _ = tokio::fs::remove_dir_all(target_dir).await;
                    return Err(err);
                },
            }
        }
    }

    async fn fetch_once(&self, uri: &str, target_dir: &Path) -> Result<u64> {
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(IngestError::Cancelled),
            response = http::get(self.client, uri) => response?,
        };
        let expected = response.content_length();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let name = file_name(uri);
        let final_path = target_dir.join(&name);
        let part_path = target_dir.join(format!("{}.part", name));

        let mut file = tokio::fs::File::create(&part_path).await?;
        let mut received: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if self.cancel.is_cancelled() {
                drop(file);
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(IngestError::Cancelled);
            }
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = expected {
            if expected != received {
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(IngestError::IntegrityMismatch(format!(
                    "{}: expected {} bytes, received {}",
                    uri, expected, received
                )));
            }
        }

        tokio::fs::rename(&part_path, &final_path).await?;

        let digest_path = final_path.clone();
        let digest = tokio::task::spawn_blocking(move || checksum::sha256_file(&digest_path))
            .await
            .map_err(|e| IngestError::Io(std::io::Error::other(e)))??;
        debug!(uri, path = %final_path.display(), sha256 = %digest, "Download complete");

        if archive::is_zip(uri, content_type.as_deref()) {
            let archive_path = final_path.clone();
            let dir = target_dir.to_path_buf();
            let members =
                tokio::task::spawn_blocking(move || archive::extract_zip(&archive_path, &dir))
                    .await
                    .map_err(|e| IngestError::Io(std::io::Error::other(e)))??;
            tokio::fs::remove_file(&final_path).await?;
            debug!(uri, members = members.len(), "Archive expanded");
        }

        Ok(received)
    }
}

/// Last path segment of the URI, or a fixed fallback
pub fn file_name(uri: &str) -> String {
    url::Url::parse(uri)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|segment| !segment.is_empty() && segment != "..")
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

/// Remove `dir` with its contents and recreate it empty
pub(crate) async fn reset_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {},
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}

/// Regular files under `dir`, recursively, in path order
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}
