//! Metadata repository
//!
//! Durable home of source descriptors and the append-only event log, backed
//! by a SQLite file. The repository owns its connection pool; callers either
//! use the one-shot methods on [`MetadataRepository`] or open a
//! [`RepositoryTx`] to group several writes.
//!
//! A single writer is assumed: concurrent coordinators against the same file
//! are not supported.
//!
//! ```no_run
//! use dap_ingest::repository::{MetadataRepository, RepositoryConfig};
//!
//! # async fn example() -> dap_ingest::Result<()> {
//! let repo = MetadataRepository::open(&RepositoryConfig::new("./data/metadata.db")).await?;
//! let mut tx = repo.begin().await?;
//! let studies = tx.get_descriptor("studies").await?;
//! tx.commit().await?;
//! # let _ = studies;
//! # Ok(())
//! # }
//! ```

mod rows;

use crate::error::{IngestError, Result};
use crate::models::{DescriptorUpdate, Event, NewEvent, SourceDescriptor};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rows::{EventRow, SourceRow, EVENT_COLUMNS, SOURCE_COLUMNS};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, Transaction};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub busy_timeout_secs: u64,
}

impl RepositoryConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_connections: 4,
            min_connections: 1,
            acquire_timeout_secs: 30,
            busy_timeout_secs: 5,
        }
    }
}

/// Handle to the metadata store
#[derive(Debug, Clone)]
pub struct MetadataRepository {
    pool: SqlitePool,
}

impl MetadataRepository {
    /// Open (creating if needed) the database file and apply migrations
    pub async fn open(config: &RepositoryConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect_with(options)
            .await?;

        MIGRATOR.run(&pool).await?;

        info!(
            path = %config.path.display(),
            max_connections = config.max_connections,
            "Metadata repository opened"
        );

        Ok(Self { pool })
    }

    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(&RepositoryConfig::new(path.as_ref())).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Start a transaction; it rolls back unless [`RepositoryTx::commit`] is called
    pub async fn begin(&self) -> Result<RepositoryTx> {
        Ok(RepositoryTx { tx: self.pool.begin().await? })
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t mut RepositoryTx) -> BoxFuture<'t, Result<T>> + Send,
        T: Send,
    {
        let mut tx = self.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            },
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            },
        }
    }

    pub async fn create_descriptor(&self, descriptor: &SourceDescriptor) -> Result<SourceDescriptor> {
        let mut tx = self.begin().await?;
        let created = tx.create_descriptor(descriptor).await?;
        tx.commit().await?;
        Ok(created)
    }

    pub async fn get_descriptor(&self, name: &str) -> Result<SourceDescriptor> {
        self.find_descriptor(name)
            .await?
            .ok_or_else(|| IngestError::NotFound(name.to_string()))
    }

    pub async fn find_descriptor(&self, name: &str) -> Result<Option<SourceDescriptor>> {
        let mut conn = self.pool.acquire().await?;
        fetch_descriptor(&mut conn, name).await
    }

    pub async fn update_descriptor(
        &self,
        name: &str,
        update: &DescriptorUpdate,
    ) -> Result<SourceDescriptor> {
        let mut tx = self.begin().await?;
        let updated = tx.update_descriptor(name, update).await?;
        tx.commit().await?;
        Ok(updated)
    }

    pub async fn append_event(&self, event: &NewEvent) -> Result<Event> {
        let mut tx = self.begin().await?;
        let stored = tx.append_event(event).await?;
        tx.commit().await?;
        Ok(stored)
    }

    /// All descriptors, ordered by name
    pub async fn list_sources(&self) -> Result<Vec<SourceDescriptor>> {
        let rows: Vec<SourceRow> =
            sqlx::query_as(&format!("SELECT {} FROM sources ORDER BY name", SOURCE_COLUMNS))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|row| SourceDescriptor::try_from(row).map_err(IngestError::from))
            .collect()
    }

    /// Sources the store considers due at `now`
    ///
    /// Advisory only: mirrors [`crate::freshness::is_due`] in SQL so callers
    /// can list candidates cheaply. The coordinator re-checks every source
    /// with the policy itself.
    pub async fn get_due_sources(&self, now: DateTime<Utc>) -> Result<Vec<SourceDescriptor>> {
        let sql = format!(
            "SELECT {} FROM sources \
             WHERE last_extracted IS NULL \
                OR (julianday(?1) - julianday(last_extracted) >= lifecycle_days \
                    AND (has_changed \
                         OR (source_updated IS NOT NULL \
                             AND julianday(source_updated) > julianday(last_extracted)))) \
             ORDER BY name",
            SOURCE_COLUMNS
        );
        let rows: Vec<SourceRow> = sqlx::query_as(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| SourceDescriptor::try_from(row).map_err(IngestError::from))
            .collect()
    }

    /// Events of one source in start order, optionally from `since` onwards
    pub async fn events_for(
        &self,
        source: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM events WHERE source_name = ",
            EVENT_COLUMNS
        ));
        query.push_bind(source.to_string());
        if let Some(since) = since {
            query.push(" AND julianday(start) >= julianday(").push_bind(since).push(")");
        }
        query.push(" ORDER BY julianday(start), id");

        let rows: Vec<EventRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| Event::try_from(row).map_err(IngestError::from))
            .collect()
    }
}

/// Transactional context over the metadata store
///
/// Dropping the guard without calling [`commit`](Self::commit) rolls back
/// every write made through it.
pub struct RepositoryTx {
    tx: Transaction<'static, Sqlite>,
}

impl RepositoryTx {
    fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    /// Insert a descriptor; fails with `Conflict` when the name is taken
    pub async fn create_descriptor(
        &mut self,
        descriptor: &SourceDescriptor,
    ) -> Result<SourceDescriptor> {
        let result = sqlx::query(&format!(
            "INSERT INTO sources ({}) VALUES \
             (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            SOURCE_COLUMNS
        ))
        .bind(&descriptor.name)
        .bind(&descriptor.title)
        .bind(&descriptor.description)
        .bind(&descriptor.creator)
        .bind(&descriptor.maintainer)
        .bind(&descriptor.webpage)
        .bind(&descriptor.link)
        .bind(descriptor.link_type.as_str())
        .bind(&descriptor.media_type)
        .bind(descriptor.frequency_days)
        .bind(descriptor.lifecycle_days)
        .bind(&descriptor.coverage)
        .bind(&descriptor.schema)
        .bind(&descriptor.database)
        .bind(descriptor.connect_timeout_secs.map(|v| v as i64))
        .bind(descriptor.read_timeout_secs.map(|v| v as i64))
        .bind(Json(&descriptor.uris))
        .bind(descriptor.source_updated)
        .bind(descriptor.last_extracted)
        .bind(descriptor.last_staged)
        .bind(descriptor.last_updated)
        .bind(descriptor.has_changed)
        .bind(descriptor.created)
        .bind(descriptor.updated)
        .bind(descriptor.version)
        .execute(self.conn())
        .await;

        match result {
            Ok(_) => {},
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Err(IngestError::Conflict(descriptor.name.clone()));
            },
            Err(err) => return Err(err.into()),
        }

        debug!(source = %descriptor.name, link_type = %descriptor.link_type, "Descriptor created");
        self.get_descriptor(&descriptor.name).await
    }

    pub async fn get_descriptor(&mut self, name: &str) -> Result<SourceDescriptor> {
        self.find_descriptor(name)
            .await?
            .ok_or_else(|| IngestError::NotFound(name.to_string()))
    }

    pub async fn find_descriptor(&mut self, name: &str) -> Result<Option<SourceDescriptor>> {
        fetch_descriptor(self.conn(), name).await
    }

    /// Apply the present fields, bump `version` and stamp `updated`
    pub async fn update_descriptor(
        &mut self,
        name: &str,
        update: &DescriptorUpdate,
    ) -> Result<SourceDescriptor> {
        let mut query =
            QueryBuilder::<Sqlite>::new("UPDATE sources SET version = version + 1, updated = ");
        query.push_bind(Utc::now());

        if let Some(webpage) = &update.webpage {
            query.push(", webpage = ").push_bind(webpage.clone());
        }
        if let Some(link) = &update.link {
            query.push(", link = ").push_bind(link.clone());
        }
        if let Some(days) = update.lifecycle_days {
            query.push(", lifecycle_days = ").push_bind(days);
        }
        if let Some(uris) = &update.uris {
            query.push(", uris = ").push_bind(Json(uris.clone()));
        }
        if let Some(ts) = update.source_updated {
            query.push(", source_updated = ").push_bind(ts);
        }
        if let Some(ts) = update.last_extracted {
            query.push(", last_extracted = ").push_bind(ts);
        }
        if let Some(ts) = update.last_staged {
            query.push(", last_staged = ").push_bind(ts);
        }
        if let Some(ts) = update.last_updated {
            query.push(", last_updated = ").push_bind(ts);
        }
        if let Some(changed) = update.has_changed {
            query.push(", has_changed = ").push_bind(changed);
        }
        query.push(" WHERE name = ").push_bind(name.to_string());

        let result = query.build().execute(self.conn()).await?;
        if result.rows_affected() == 0 {
            return Err(IngestError::NotFound(name.to_string()));
        }

        self.get_descriptor(name).await
    }

    /// Append an event; the surrogate id never collides
    pub async fn append_event(&mut self, event: &NewEvent) -> Result<Event> {
        let result = sqlx::query(
            r#"INSERT INTO events (source_name, kind, start, "end", return_code, return_value, artifact_uri)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&event.source_name)
        .bind(event.kind.as_str())
        .bind(event.start)
        .bind(event.end)
        .bind(event.return_code)
        .bind(&event.return_value)
        .bind(&event.artifact_uri)
        .execute(self.conn())
        .await?;

        Ok(Event {
            id: result.last_insert_rowid(),
            source_name: event.source_name.clone(),
            kind: event.kind,
            start: event.start,
            end: event.end,
            return_code: event.return_code,
            return_value: event.return_value.clone(),
            artifact_uri: event.artifact_uri.clone(),
        })
    }
}

async fn fetch_descriptor(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<Option<SourceDescriptor>> {
    let row: Option<SourceRow> =
        sqlx::query_as(&format!("SELECT {} FROM sources WHERE name = ?", SOURCE_COLUMNS))
            .bind(name)
            .fetch_optional(conn)
            .await?;
    row.map(SourceDescriptor::try_from).transpose().map_err(IngestError::from)
}
