//! Domain types shared by the repository, visitors and coordinator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How a source's `link` is interpreted
///
/// The link type selects both the visitor and the staging strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkType {
    /// Landing page listing daily archives; `link` is the base URI for hrefs
    #[serde(rename = "baseurl")]
    BaseUrl,
    /// Landing page with a single download anchor
    #[serde(rename = "direct")]
    Direct,
    /// `link` is a machine-readable JSON index of partitions
    #[serde(rename = "index_json")]
    IndexJson,
    /// Relational dump restored into a database by an external tool
    #[serde(rename = "pg_dump")]
    PgDump,
}

impl LinkType {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkType::BaseUrl => "baseurl",
            LinkType::Direct => "direct",
            LinkType::IndexJson => "index_json",
            LinkType::PgDump => "pg_dump",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown link type '{0}' (expected baseurl, direct, index_json or pg_dump)")]
pub struct UnknownLinkType(pub String);

impl FromStr for LinkType {
    type Err = UnknownLinkType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "baseurl" => Ok(LinkType::BaseUrl),
            "direct" => Ok(LinkType::Direct),
            "index_json" => Ok(LinkType::IndexJson),
            "pg_dump" => Ok(LinkType::PgDump),
            _ => Err(UnknownLinkType(s.to_string())),
        }
    }
}

/// One upstream data source and its acquisition bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
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
    /// Schema holding the restored dump (relational sources)
    pub schema: Option<String>,
    /// Credentials role used to reach the restored dump (relational sources)
    pub database: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub uris: Vec<String>,
    pub source_updated: Option<DateTime<Utc>>,
    pub last_extracted: Option<DateTime<Utc>>,
    pub last_staged: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub has_changed: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub version: i64,
}

/// Partial update applied by `MetadataRepository::update_descriptor`
///
/// `None` leaves the stored value untouched. Timestamps cannot be reset to
/// null through an update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DescriptorUpdate {
    pub webpage: Option<String>,
    pub link: Option<String>,
    pub lifecycle_days: Option<i64>,
    pub uris: Option<Vec<String>>,
    pub source_updated: Option<DateTime<Utc>>,
    pub last_extracted: Option<DateTime<Utc>>,
    pub last_staged: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub has_changed: Option<bool>,
}

impl DescriptorUpdate {
    pub fn is_empty(&self) -> bool {
        self == &DescriptorUpdate::default()
    }

    /// Apply to an in-memory descriptor, mirroring what the store does
    pub fn apply_to(&self, descriptor: &mut SourceDescriptor) {
        if let Some(webpage) = &self.webpage {
            descriptor.webpage = Some(webpage.clone());
        }
        if let Some(link) = &self.link {
            descriptor.link = link.clone();
        }
        if let Some(days) = self.lifecycle_days {
            descriptor.lifecycle_days = days;
        }
        if let Some(uris) = &self.uris {
            descriptor.uris = uris.clone();
        }
        if self.source_updated.is_some() {
            descriptor.source_updated = self.source_updated;
        }
        if self.last_extracted.is_some() {
            descriptor.last_extracted = self.last_extracted;
        }
        if self.last_staged.is_some() {
            descriptor.last_staged = self.last_staged;
        }
        if self.last_updated.is_some() {
            descriptor.last_updated = self.last_updated;
        }
        if let Some(changed) = self.has_changed {
            descriptor.has_changed = changed;
        }
    }
}

/// Kind of provenance event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Visit,
    Fetch,
    Stage,
    Skip,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Visit => "visit",
            EventKind::Fetch => "fetch",
            EventKind::Stage => "stage",
            EventKind::Skip => "skip",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown event kind '{0}'")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "visit" => Ok(EventKind::Visit),
            "fetch" => Ok(EventKind::Fetch),
            "stage" => Ok(EventKind::Stage),
            "skip" => Ok(EventKind::Skip),
            "error" => Ok(EventKind::Error),
            _ => Err(UnknownEventKind(s.to_string())),
        }
    }
}

/// A stored provenance event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub source_name: String,
    pub kind: EventKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub return_code: i32,
    pub return_value: String,
    pub artifact_uri: Option<String>,
}

/// An event that has not been appended yet
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub source_name: String,
    pub kind: EventKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub return_code: i32,
    pub return_value: String,
    pub artifact_uri: Option<String>,
}
