//! Profile resolution
//!
//! A profile is a single file `<config_dir>/<profile>.{toml,ini,yaml,json}`
//! read through the `config` crate. Keys can be overridden from the
//! environment with the `DAP__` prefix and `__` as the path separator, e.g.
//! `DAP__SOURCE__LABELS__LIFECYCLE_DAYS=14`.
//!
//! ```toml
//! [paths]
//! staging = "./staging"
//!
//! [database.ctgov]
//! dbname = "aact"
//! host = "localhost"
//! port = 5432
//! user = "dap"
//! password = "secret"
//!
//! [source.labels]
//! link = "https://api.fda.gov/download.json"
//! link_type = "index_json"
//! lifecycle_days = 7
//! ```

use crate::error::{IngestError, Result};
use crate::http::RetryPolicy;
use crate::models::{LinkType, SourceDescriptor};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::postgres::PgConnectOptions;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the directory that holds profile files
pub const CONFIG_DIR_ENV: &str = "DAP_CONFIG_DIR";
pub const DEFAULT_CONFIG_DIR: &str = "./config";
pub const DEFAULT_PROFILE: &str = "default";

const ENV_PREFIX: &str = "DAP";
const PROFILE_EXTENSIONS: [&str; 5] = ["toml", "ini", "yaml", "yml", "json"];

/// Resolved profile
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub paths: PathsConfig,
    pub databases: BTreeMap<String, DatabaseCredentials>,
    /// Sources ordered by name
    pub sources: Vec<SourceConfig>,
    pub http: HttpConfig,
    pub stage: StageConfig,
}

/// Filesystem roots
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub staging: PathBuf,
    pub extract: PathBuf,
    /// SQLite file backing the metadata repository
    pub repository: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            staging: PathBuf::from("./staging"),
            extract: PathBuf::from("./extract"),
            repository: PathBuf::from("./data/metadata.db"),
        }
    }
}

impl PathsConfig {
    pub fn staging_dir(&self, source: &str) -> PathBuf {
        self.staging.join(source)
    }

    pub fn extract_dir(&self, source: &str) -> PathBuf {
        self.extract.join(source)
    }
}

/// Credentials for one database role
#[derive(Clone, PartialEq)]
pub struct DatabaseCredentials {
    pub dbname: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("dbname", &self.dbname)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

impl DatabaseCredentials {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.dbname)
    }
}

/// Descriptor section of a profile
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub creator: Option<String>,
    pub maintainer: Option<String>,
    pub webpage: Option<String>,
    pub link: String,
    pub link_type: LinkType,
    pub media_type: Option<String>,
    pub frequency_days: Option<i64>,
    pub lifecycle_days: i64,
    pub coverage: Option<String>,
    pub schema: Option<String>,
    pub database: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
}

impl SourceConfig {
    /// Fresh descriptor as created by seeding
    pub fn descriptor(&self, now: DateTime<Utc>) -> SourceDescriptor {
        SourceDescriptor {
            name: self.name.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            creator: self.creator.clone(),
            maintainer: self.maintainer.clone(),
            webpage: self.webpage.clone(),
            link: self.link.clone(),
            link_type: self.link_type,
            media_type: self.media_type.clone(),
            frequency_days: self.frequency_days,
            lifecycle_days: self.lifecycle_days,
            coverage: self.coverage.clone(),
            schema: self.schema.clone(),
            database: self.database.clone(),
            connect_timeout_secs: self.connect_timeout_secs,
            read_timeout_secs: self.read_timeout_secs,
            uris: Vec::new(),
            source_updated: None,
            last_extracted: None,
            last_staged: None,
            last_updated: None,
            has_changed: false,
            created: now,
            updated: now,
            version: 1,
        }
    }
}

/// HTTP client and retry tuning
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    pub retry_initial_ms: u64,
    pub retry_factor: u32,
    pub retry_cap_ms: u64,
    pub retry_max_attempts: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("dap-ingest/{}", env!("CARGO_PKG_VERSION")),
            retry_initial_ms: 1_000,
            retry_factor: 2,
            retry_cap_ms: 30_000,
            retry_max_attempts: 5,
        }
    }
}

impl HttpConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(self.retry_initial_ms),
            factor: self.retry_factor,
            cap: Duration::from_millis(self.retry_cap_ms),
            max_attempts: self.retry_max_attempts,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.retry_max_attempts == 0 {
            return Err(IngestError::ConfigMalformed(
                "http.retry_max_attempts must be greater than 0".into(),
            ));
        }
        if self.retry_factor == 0 {
            return Err(IngestError::ConfigMalformed(
                "http.retry_factor must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Staging thresholds
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Largest tolerated share of skipped rows before a stage fails
    pub max_skipped_ratio: f64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self { max_skipped_ratio: 0.01 }
    }
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    #[serde(default)]
    paths: PathsConfig,
    #[serde(default)]
    database: HashMap<String, RawDatabase>,
    #[serde(default)]
    source: HashMap<String, RawSource>,
    #[serde(default)]
    http: HttpConfig,
    #[serde(default)]
    stage: StageConfig,
}

#[derive(Debug, Deserialize)]
struct RawDatabase {
    dbname: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    title: Option<String>,
    description: Option<String>,
    creator: Option<String>,
    maintainer: Option<String>,
    webpage: Option<String>,
    link: Option<String>,
    link_type: Option<String>,
    media_type: Option<String>,
    frequency_days: Option<i64>,
    lifecycle_days: Option<i64>,
    coverage: Option<String>,
    schema: Option<String>,
    database: Option<String>,
    connect_timeout_secs: Option<u64>,
    read_timeout_secs: Option<u64>,
}

fn required<T>(value: Option<T>, key: impl FnOnce() -> String) -> Result<T> {
    value.ok_or_else(|| IngestError::ConfigMalformed(format!("missing required option '{}'", key())))
}

impl Profile {
    /// Resolve a profile from `$DAP_CONFIG_DIR` (or `./config`)
    pub fn load(name: &str) -> Result<Self> {
        let dir = std::env::var(CONFIG_DIR_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_DIR.to_string());
        Self::load_from(Path::new(&dir), name)
    }

    /// Resolve a profile from an explicit directory
    pub fn load_from(dir: &Path, name: &str) -> Result<Self> {
        let file = Self::find_file(dir, name)?;
        tracing::debug!(profile = name, file = %file.display(), "Loading profile");

        let settings = config::Config::builder()
            .add_source(config::File::from(file.as_path()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| {
                IngestError::ConfigMalformed(format!("failed to read {}: {}", file.display(), e))
            })?;

        let raw: RawProfile = settings.try_deserialize().map_err(|e| {
            IngestError::ConfigMalformed(format!("invalid profile '{}': {}", name, e))
        })?;

        Self::from_raw(name, raw)
    }

    fn find_file(dir: &Path, name: &str) -> Result<PathBuf> {
        PROFILE_EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{}.{}", name, ext)))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                IngestError::ConfigNotFound(format!(
                    "profile '{}' not found in {}",
                    name,
                    dir.display()
                ))
            })
    }

    fn from_raw(name: &str, raw: RawProfile) -> Result<Self> {
        raw.http.validate()?;
        if !(0.0..=1.0).contains(&raw.stage.max_skipped_ratio) {
            return Err(IngestError::ConfigMalformed(
                "stage.max_skipped_ratio must be between 0 and 1".into(),
            ));
        }

        let mut databases = BTreeMap::new();
        for (role, db) in raw.database {
            let key = |field: &str| format!("database.{}.{}", role, field);
            let credentials = DatabaseCredentials {
                dbname: required(db.dbname, || key("dbname"))?,
                host: required(db.host, || key("host"))?,
                port: required(db.port, || key("port"))?,
                user: required(db.user, || key("user"))?,
                password: required(db.password, || key("password"))?,
            };
            databases.insert(role, credentials);
        }

        if raw.source.is_empty() {
            return Err(IngestError::ConfigNotFound(format!(
                "profile '{}' declares no [source.<name>] sections",
                name
            )));
        }

        let mut sources = Vec::with_capacity(raw.source.len());
        for (source_name, src) in raw.source {
            sources.push(Self::source_from_raw(source_name, src, &databases)?);
        }
        sources.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Self {
            name: name.to_string(),
            paths: raw.paths,
            databases,
            sources,
            http: raw.http,
            stage: raw.stage,
        })
    }

    fn source_from_raw(
        name: String,
        raw: RawSource,
        databases: &BTreeMap<String, DatabaseCredentials>,
    ) -> Result<SourceConfig> {
        let key = |field: &str| format!("source.{}.{}", name, field);

        let link = required(raw.link, || key("link"))?;
        let link_type: LinkType = required(raw.link_type, || key("link_type"))?
            .parse()
            .map_err(|e| IngestError::ConfigMalformed(format!("{}: {}", key("link_type"), e)))?;
        let lifecycle_days = required(raw.lifecycle_days, || key("lifecycle_days"))?;
        if lifecycle_days < 0 {
            return Err(IngestError::ConfigMalformed(format!(
                "{} must not be negative",
                key("lifecycle_days")
            )));
        }
        if chrono::Duration::try_days(lifecycle_days).is_none() {
            return Err(IngestError::ConfigMalformed(format!(
                "{} is out of range: {}",
                key("lifecycle_days"),
                lifecycle_days
            )));
        }

        let webpage = match link_type {
            LinkType::BaseUrl | LinkType::Direct | LinkType::PgDump => {
                Some(required(raw.webpage, || key("webpage"))?)
            },
            LinkType::IndexJson => raw.webpage,
        };

        let (schema, database) = if link_type == LinkType::PgDump {
            let schema = required(raw.schema, || key("schema"))?;
            let role = required(raw.database, || key("database"))?;
            if !databases.contains_key(&role) {
                return Err(IngestError::ConfigNotFound(format!(
                    "section [database.{}] referenced by source '{}'",
                    role, name
                )));
            }
            (Some(schema), Some(role))
        } else {
            (raw.schema, raw.database)
        };

        Ok(SourceConfig {
            name,
            title: raw.title,
            description: raw.description,
            creator: raw.creator,
            maintainer: raw.maintainer,
            webpage,
            link,
            link_type,
            media_type: raw.media_type,
            frequency_days: raw.frequency_days,
            lifecycle_days,
            coverage: raw.coverage,
            schema,
            database,
            connect_timeout_secs: raw.connect_timeout_secs,
            read_timeout_secs: raw.read_timeout_secs,
        })
    }

    pub fn source(&self, name: &str) -> Result<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| IngestError::ConfigNotFound(format!("section [source.{}]", name)))
    }

    pub fn database(&self, role: &str) -> Result<&DatabaseCredentials> {
        self.databases
            .get(role)
            .ok_or_else(|| IngestError::ConfigNotFound(format!("section [database.{}]", role)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serial_test::serial;
    use tempfile::TempDir;

    const PROFILE: &str = r#"
[paths]
staging = "/tmp/dap/staging"

[database.ctgov]
dbname = "aact"
host = "localhost"
port = 5432
user = "dap"
password = "secret"

[source.studies]
title = "Clinical trials"
webpage = "https://aact.example.org/snapshots"
link = "https://aact.example.org"
link_type = "baseurl"
lifecycle_days = 7

[source.ctgov_dump]
webpage = "https://aact.example.org/snapshots"
link = "https://aact.example.org"
link_type = "pg_dump"
lifecycle_days = 30
schema = "ctgov"
database = "ctgov"

[source.labels]
link = "https://api.example.org/download.json"
link_type = "index_json"
lifecycle_days = 14
read_timeout_secs = 120
"#;

    fn write_profile(name: &str, contents: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(format!("{}.toml", name)), contents).unwrap();
        dir
    }

    #[test]
    #[serial]
    fn test_load_profile() {
        let dir = write_profile("default", PROFILE);
        let profile = Profile::load_from(dir.path(), "default").unwrap();

        let names: Vec<_> = profile.sources.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["ctgov_dump", "labels", "studies"]);
        assert_eq!(profile.paths.staging, PathBuf::from("/tmp/dap/staging"));
        assert_eq!(profile.paths.extract, PathBuf::from("./extract"));
        assert_eq!(profile.database("ctgov").unwrap().port, 5432);
        assert_eq!(profile.http.retry_max_attempts, 5);
        assert!((profile.stage.max_skipped_ratio - 0.01).abs() < f64::EPSILON);

        let labels = profile.source("labels").unwrap();
        assert_eq!(labels.link_type, LinkType::IndexJson);
        assert_eq!(labels.read_timeout_secs, Some(120));
        assert!(labels.webpage.is_none());
    }

    #[test]
    #[serial]
    fn test_missing_profile_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = Profile::load_from(dir.path(), "nightly").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigNotFound);
    }

    #[test]
    #[serial]
    fn test_missing_required_option_is_malformed() {
        let dir = write_profile(
            "default",
            r#"
[source.labels]
link_type = "index_json"
lifecycle_days = 7
"#,
        );
        let err = Profile::load_from(dir.path(), "default").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigMalformed);
        assert!(err.to_string().contains("source.labels.link"));
    }

    #[test]
    #[serial]
    fn test_out_of_range_lifecycle_is_malformed() {
        let dir = write_profile(
            "default",
            r#"
[source.labels]
link = "https://api.example.org/download.json"
link_type = "index_json"
lifecycle_days = 1000000000000000
"#,
        );
        let err = Profile::load_from(dir.path(), "default").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigMalformed);
        assert!(err.to_string().contains("source.labels.lifecycle_days"));
    }

    #[test]
    #[serial]
    fn test_unknown_database_role_is_not_found() {
        let dir = write_profile(
            "default",
            r#"
[source.dump]
webpage = "https://aact.example.org/snapshots"
link = "https://aact.example.org"
link_type = "pg_dump"
lifecycle_days = 30
schema = "ctgov"
database = "missing"
"#,
        );
        let err = Profile::load_from(dir.path(), "default").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigNotFound);
    }

    #[test]
    #[serial]
    fn test_incomplete_credentials_are_malformed() {
        let dir = write_profile(
            "default",
            r#"
[database.ctgov]
dbname = "aact"
host = "localhost"
user = "dap"
password = "secret"

[source.labels]
link = "https://api.example.org/download.json"
link_type = "index_json"
lifecycle_days = 7
"#,
        );
        let err = Profile::load_from(dir.path(), "default").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigMalformed);
        assert!(err.to_string().contains("database.ctgov.port"));
    }

    #[test]
    #[serial]
    fn test_unknown_source_section() {
        let dir = write_profile("default", PROFILE);
        let profile = Profile::load_from(dir.path(), "default").unwrap();
        let err = profile.source("approvals").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigNotFound);
    }

    #[test]
    #[serial]
    fn test_environment_overrides_profile() {
        let dir = write_profile("default", PROFILE);
        std::env::set_var("DAP__SOURCE__LABELS__LIFECYCLE_DAYS", "3");
        let result = Profile::load_from(dir.path(), "default");
        std::env::remove_var("DAP__SOURCE__LABELS__LIFECYCLE_DAYS");

        let profile = result.unwrap();
        assert_eq!(profile.source("labels").unwrap().lifecycle_days, 3);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = DatabaseCredentials {
            dbname: "aact".into(),
            host: "localhost".into(),
            port: 5432,
            user: "dap".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{:?}", credentials).contains("hunter2"));
    }
}
