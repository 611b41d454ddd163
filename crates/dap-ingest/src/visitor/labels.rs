// Labels: machine-readable JSON index of label partitions

use super::{midnight_utc, Probe, VisitContext};
use crate::error::{IngestError, Result};
use crate::http;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tracing::debug;

const LABEL_PATH: [&str; 3] = ["results", "drug", "label"];

pub(super) async fn probe(ctx: &VisitContext<'_>) -> Result<Probe> {
    let url = ctx.descriptor.link.as_str();
    debug!(source = %ctx.descriptor.name, url, "Fetching partition index");

    let client = ctx.client;
    let (last_modified, bytes) = ctx
        .retrying(url, || async move {
            let response = http::get(client, url).await?;
            let last_modified = http::last_modified(&response);
            Ok::<_, IngestError>((last_modified, response.bytes().await?))
        })
        .await?;
    let document: Value = serde_json::from_slice(&bytes)
        .map_err(|e| IngestError::ParseError(format!("index {} is not JSON: {}", url, e)))?;

    Ok(Probe::Index { document, last_modified })
}

fn label_section(document: &Value) -> Result<&Value> {
    LABEL_PATH
        .iter()
        .try_fold(document, |node, key| node.get(key))
        .ok_or_else(|| {
            IngestError::UpstreamLayoutChanged("index has no results.drug.label section".into())
        })
}

fn partitions(document: &Value) -> Result<&Vec<Value>> {
    label_section(document)?
        .get("partitions")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            IngestError::UpstreamLayoutChanged("results.drug.label.partitions is not a list".into())
        })
}

pub(super) fn select_uris(document: &Value) -> Result<Vec<String>> {
    partitions(document)?
        .iter()
        .enumerate()
        .map(|(i, partition)| {
            partition
                .get("file")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    IngestError::UpstreamLayoutChanged(format!("partition {} has no file", i))
                })
        })
        .collect()
}

/// Newest partition publication date, else the index export date, else the
/// index's `Last-Modified`, else the visit time.
pub(super) fn derive_source_updated(
    ctx: &VisitContext<'_>,
    document: &Value,
    last_modified: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let newest_partition = partitions(document)
        .ok()
        .into_iter()
        .flatten()
        .filter_map(|p| p.get("published").and_then(Value::as_str))
        .filter_map(parse_date)
        .max();

    let export_date = label_section(document)
        .ok()
        .and_then(|label| label.get("export_date"))
        .and_then(Value::as_str)
        .and_then(parse_date);

    newest_partition
        .or(export_date)
        .or(last_modified)
        .unwrap_or_else(|| ctx.clock.now())
}

fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok().map(midnight_utc))
}
