// Approvals: landing page with a single bundle download anchor

use super::{midnight_utc, resolve, selector, VisitContext};
use crate::error::{IngestError, Result};
use crate::http;
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use scraper::Html;
use tracing::debug;

const DOWNLOAD_ANCHOR: &str = r#"a[data-entity-substitution="media_download"][href]"#;
const LAST_UPDATED_PATTERN: &str =
    r"Data Last Updated:\s*([A-Za-z]+\.?\s+\d{1,2},\s*\d{4}|\d{1,2}/\d{1,2}/\d{4})";

pub(super) fn select_uris(ctx: &VisitContext<'_>, body: &str) -> Result<Vec<String>> {
    let document = Html::parse_document(body);
    let anchor_sel = selector(DOWNLOAD_ANCHOR)?;

    let hrefs: Vec<&str> =
        document.select(&anchor_sel).filter_map(|a| a.value().attr("href")).collect();

    match hrefs.as_slice() {
        [href] => Ok(vec![resolve(&ctx.descriptor.link, href)?]),
        [] => Err(IngestError::UpstreamLayoutChanged("no media_download anchor".into())),
        many => Err(IngestError::UpstreamLayoutChanged(format!(
            "{} media_download anchors, expected one",
            many.len()
        ))),
    }
}

/// `Last-Modified` of the bundle, else the page's "Data Last Updated" note,
/// else the visit time. A HEAD the server does not implement counts as a
/// missing header; any other failed HEAD fails the visit.
pub(super) async fn derive_source_updated(
    ctx: &VisitContext<'_>,
    body: &str,
    uris: &[String],
) -> Result<DateTime<Utc>> {
    let noted = page_last_updated(body)?;

    if let Some(uri) = uris.first().map(String::as_str) {
        let client = ctx.client;
        let response = ctx
            .retrying(uri, || async move { http::head_if_supported(client, uri).await })
            .await?;
        if let Some(modified) = response.as_ref().and_then(http::last_modified) {
            return Ok(modified);
        }
        debug!(source = %ctx.descriptor.name, uri, "No Last-Modified from bundle");
    }

    Ok(noted.unwrap_or_else(|| ctx.clock.now()))
}

fn page_last_updated(body: &str) -> Result<Option<DateTime<Utc>>> {
    let pattern = Regex::new(LAST_UPDATED_PATTERN)
        .map_err(|e| IngestError::ParseError(format!("invalid pattern: {}", e)))?;

    let text: String = Html::parse_document(body).root_element().text().collect();
    let Some(captured) = pattern.captures(&text).and_then(|c| c.get(1)) else {
        return Ok(None);
    };

    let raw = captured.as_str().replace('.', "");
    let raw = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let date = NaiveDate::parse_from_str(&raw, "%m/%d/%Y")
        .or_else(|_| NaiveDate::parse_from_str(&raw, "%B %d, %Y"))
        .or_else(|_| NaiveDate::parse_from_str(&raw, "%b %d, %Y"))
        .ok();

    Ok(date.map(midnight_utc))
}
