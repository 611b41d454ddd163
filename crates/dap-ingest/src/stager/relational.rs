//! Relational dump strategy
//!
//! The fetched dump is restored into PostgreSQL by an external tool. This
//! strategy enumerates the declared schema's base tables and streams each one
//! out with `COPY ... TO STDOUT` in CSV form. Row order is whatever the
//! server returns.

use super::output::StagedOutputs;
use super::{RowTally, StageContext};
use crate::error::{IngestError, Result};
use futures::StreamExt;
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Rails bookkeeping table shipped with the dump
pub const INTERNAL_TABLES: [&str; 1] = ["ar_internal_metadata"];

fn unreachable_dump(err: sqlx::Error) -> IngestError {
    IngestError::Permanent(format!("restored dump unavailable: {}", err))
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub async fn list_tables(conn: &mut PgConnection, schema: &str) -> Result<Vec<String>> {
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT table_name::text FROM information_schema.tables \
         WHERE table_schema = $1 AND table_type = 'BASE TABLE' \
         ORDER BY table_name",
    )
    .bind(schema)
    .fetch_all(&mut *conn)
    .await
    .map_err(unreachable_dump)?;

    Ok(tables
        .into_iter()
        .filter(|table| !INTERNAL_TABLES.contains(&table.as_str()))
        .collect())
}

pub(super) async fn stage(ctx: &StageContext<'_>, outputs: &mut StagedOutputs) -> Result<RowTally> {
    let name = &ctx.descriptor.name;
    let credentials = ctx.database.ok_or_else(|| {
        IngestError::ConfigMalformed(format!("source '{}' has no database credentials", name))
    })?;
    let schema = ctx.descriptor.schema.as_deref().ok_or_else(|| {
        IngestError::ConfigMalformed(format!("source '{}' has no schema", name))
    })?;

    let mut conn = PgConnection::connect_with(&credentials.connect_options())
        .await
        .map_err(unreachable_dump)?;

    let tables = list_tables(&mut conn, schema).await?;
    info!(source = %name, schema, tables = tables.len(), "Staging relational dump");

    for table in &tables {
        if ctx.cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let part = outputs.part_for(table)?;
        let statement = format!(
            "COPY (SELECT * FROM {}.{}) TO STDOUT WITH (FORMAT csv, HEADER true)",
            quote_ident(schema),
            quote_ident(table)
        );

        let mut file = tokio::fs::File::create(&part).await?;
        let mut written: u64 = 0;
        {
            let mut stream = conn.copy_out_raw(&statement).await.map_err(unreachable_dump)?;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(unreachable_dump)?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
        }
        file.flush().await?;
        debug!(source = %name, table = %table, bytes = written, "Copied table");
    }

    conn.close().await.map_err(unreachable_dump)?;

    // Row counts are not tracked for server-side COPY output.
    Ok(RowTally::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("studies"), "\"studies\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
