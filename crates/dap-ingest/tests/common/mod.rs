//! Shared fixtures for dap-ingest integration tests
//!
//! Every test gets its own temp tree holding the profile, the SQLite
//! repository, and the extract and staging directories. Upstreams are
//! `wiremock` servers; time is a [`FixedClock`].

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use chrono::{DateTime, TimeZone, Utc};
use dap_ingest::clock::FixedClock;
use dap_ingest::http::RetryPolicy;
use dap_ingest::models::{DescriptorUpdate, Event, EventKind};
use dap_ingest::{Coordinator, MetadataRepository, Profile};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

pub const PROFILE_NAME: &str = "test";

/// Profile, repository and scratch directories of one test
pub struct TestEnv {
    pub root: TempDir,
    pub profile: Profile,
    pub repo: MetadataRepository,
}

impl TestEnv {
    /// Write a profile made of `sections` and open its repository
    pub async fn new(sections: &str) -> Self {
        let root = TempDir::new().unwrap();
        let config_dir = root.path().join("config");
        std::fs::create_dir_all(&config_dir).unwrap();

        let contents = format!(
            r#"
[paths]
staging = "{staging}"
extract = "{extract}"
repository = "{repository}"

[http]
retry_max_attempts = 5

{sections}
"#,
            staging = root.path().join("staging").display(),
            extract = root.path().join("extract").display(),
            repository = root.path().join("data").join("metadata.db").display(),
        );
        std::fs::write(config_dir.join(format!("{}.toml", PROFILE_NAME)), contents).unwrap();

        let profile = Profile::load_from(&config_dir, PROFILE_NAME).unwrap();
        let repo = dap_ingest::open_repository(&profile).await.unwrap();
        Self { root, profile, repo }
    }

    pub fn coordinator(&self, now: DateTime<Utc>) -> Coordinator {
        Coordinator::new(self.profile.clone(), self.repo.clone())
            .with_clock(Arc::new(FixedClock(now)))
            .with_retry_policy(RetryPolicy::immediate(5))
    }

    /// Seed descriptors, then apply `update` to `source`
    pub async fn prepare(&self, now: DateTime<Utc>, source: &str, update: DescriptorUpdate) {
        self.coordinator(now).seed().await.unwrap();
        self.repo.update_descriptor(source, &update).await.unwrap();
    }

    pub async fn events(&self, source: &str) -> Vec<Event> {
        self.repo.events_for(source, None).await.unwrap()
    }

    pub async fn kinds(&self, source: &str) -> Vec<EventKind> {
        self.events(source).await.into_iter().map(|e| e.kind).collect()
    }

    pub fn staging_dir(&self, source: &str) -> PathBuf {
        self.profile.paths.staging_dir(source)
    }

    pub fn extract_dir(&self, source: &str) -> PathBuf {
        self.profile.paths.extract_dir(source)
    }

    /// File names under `staging/<source>`, sorted
    pub fn staged(&self, source: &str) -> Vec<String> {
        file_names(&self.staging_dir(source))
    }
}

pub fn file_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else { return Vec::new() };
    let mut names: Vec<String> = entries
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

/// In-memory ZIP with the given members
pub fn zip_bytes(members: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in members {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn studies_section(name: &str, server: &str, lifecycle_days: i64) -> String {
    format!(
        r#"
[source.{name}]
title = "AACT daily static copy"
webpage = "{server}/pipe_files"
link = "{server}"
link_type = "baseurl"
lifecycle_days = {lifecycle_days}
"#
    )
}

pub fn approvals_section(name: &str, server: &str, lifecycle_days: i64) -> String {
    format!(
        r#"
[source.{name}]
title = "Drugs@FDA"
webpage = "{server}/drugsfda"
link = "{server}"
link_type = "direct"
lifecycle_days = {lifecycle_days}
"#
    )
}

pub fn labels_section(name: &str, server: &str, lifecycle_days: i64) -> String {
    format!(
        r#"
[source.{name}]
title = "openFDA drug labels"
link = "{server}/download.json"
link_type = "index_json"
lifecycle_days = {lifecycle_days}
"#
    )
}

/// Snapshot page whose first daily row links `href` dated `date`
pub fn studies_page(href: &str, date: &str) -> String {
    format!(
        r#"<html><body>
<h2>Daily Static Copies</h2>
<table>
  <tr><th>File</th><th>Date</th><th>Size</th></tr>
  <tr><td><a href="{href}">{href}</a></td><td>{date}</td><td>2 GB</td></tr>
</table>
<h2>Monthly Archive</h2>
<table>
  <tr><td><a href="/static/202312_monthly.zip">monthly</a></td><td>12/01/2023</td></tr>
</table>
</body></html>"#
    )
}

pub fn approvals_page(href: &str) -> String {
    format!(
        r#"<html><body>
<h1>Drugs@FDA Data Files</h1>
<p><a data-entity-substitution="media_download" href="{href}">Drugs@FDA Download File (ZIP)</a></p>
</body></html>"#
    )
}

/// Delimited bundle with two tables
pub fn studies_bundle() -> Vec<u8> {
    zip_bytes(&[
        ("studies.txt", "nct_id\tbrief_title\tphase\nNCT001\tAspirin trial\tPhase 3\nNCT002\tStatin trial\tPhase 2\n"),
        ("sponsors.txt", "nct_id\tname\nNCT001\tAcme Pharma\n"),
    ])
}

/// One label partition holding `count` records
pub fn label_partition(ordinal: usize, count: usize) -> Vec<u8> {
    let records: Vec<String> = (0..count)
        .map(|i| {
            format!(
                r#"{{"id": "label-{ordinal}-{i}", "openfda": {{"route": "ORAL"}}, "purpose": "Pain relief"}}"#
            )
        })
        .collect();
    let document = format!(r#"{{"meta": {{}}, "results": [{}]}}"#, records.join(","));
    let name = format!("drug-label-{:04}.json", ordinal + 1);
    zip_bytes(&[(name.as_str(), document.as_str())])
}

/// Index document listing `files`, each published on `published`
pub fn label_index(files: &[String], published: &str) -> serde_json::Value {
    let partitions: Vec<serde_json::Value> = files
        .iter()
        .map(|file| serde_json::json!({"file": file, "published": published, "size_mb": "1.2"}))
        .collect();
    serde_json::json!({
        "results": {
            "drug": {
                "label": {
                    "export_date": "2024-01-10",
                    "total_records": 3,
                    "partitions": partitions
                }
            }
        }
    })
}
