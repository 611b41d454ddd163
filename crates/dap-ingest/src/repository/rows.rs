//! Row shapes as stored in SQLite

use crate::models::{Event, EventKind, LinkType, SourceDescriptor};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;

pub(super) const SOURCE_COLUMNS: &str = "name, title, description, creator, maintainer, webpage, \
     link, link_type, media_type, frequency_days, lifecycle_days, coverage, schema_name, \
     database_role, connect_timeout_secs, read_timeout_secs, uris, source_updated, \
     last_extracted, last_staged, last_updated, has_changed, created, updated, version";

pub(super) const EVENT_COLUMNS: &str =
    r#"id, source_name, kind, start, "end", return_code, return_value, artifact_uri"#;

#[derive(Debug, FromRow)]
pub(super) struct SourceRow {
    name: String,
    title: Option<String>,
    description: Option<String>,
    creator: Option<String>,
    maintainer: Option<String>,
    webpage: Option<String>,
    link: String,
    link_type: String,
    media_type: Option<String>,
    frequency_days: Option<i64>,
    lifecycle_days: i64,
    coverage: Option<String>,
    schema_name: Option<String>,
    database_role: Option<String>,
    connect_timeout_secs: Option<i64>,
    read_timeout_secs: Option<i64>,
    uris: Json<Vec<String>>,
    source_updated: Option<DateTime<Utc>>,
    last_extracted: Option<DateTime<Utc>>,
    last_staged: Option<DateTime<Utc>>,
    last_updated: Option<DateTime<Utc>>,
    has_changed: bool,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
    version: i64,
}

impl TryFrom<SourceRow> for SourceDescriptor {
    type Error = sqlx::Error;

    fn try_from(row: SourceRow) -> Result<Self, Self::Error> {
        let link_type: LinkType =
            row.link_type.parse().map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(SourceDescriptor {
            name: row.name,
            title: row.title,
            description: row.description,
            creator: row.creator,
            maintainer: row.maintainer,
            webpage: row.webpage,
            link: row.link,
            link_type,
            media_type: row.media_type,
            frequency_days: row.frequency_days,
            lifecycle_days: row.lifecycle_days,
            coverage: row.coverage,
            schema: row.schema_name,
            database: row.database_role,
            connect_timeout_secs: row.connect_timeout_secs.map(|v| v.max(0) as u64),
            read_timeout_secs: row.read_timeout_secs.map(|v| v.max(0) as u64),
            uris: row.uris.0,
            source_updated: row.source_updated,
            last_extracted: row.last_extracted,
            last_staged: row.last_staged,
            last_updated: row.last_updated,
            has_changed: row.has_changed,
            created: row.created,
            updated: row.updated,
            version: row.version,
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct EventRow {
    id: i64,
    source_name: String,
    kind: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    return_code: i32,
    return_value: String,
    artifact_uri: Option<String>,
}

impl TryFrom<EventRow> for Event {
    type Error = sqlx::Error;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let kind: EventKind = row.kind.parse().map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(Event {
            id: row.id,
            source_name: row.source_name,
            kind,
            start: row.start,
            end: row.end,
            return_code: row.return_code,
            return_value: row.return_value,
            artifact_uri: row.artifact_uri,
        })
    }
}
