// Studies: landing page listing daily static copies of the trials database

use super::{midnight_utc, resolve, selector, VisitContext};
use crate::error::{IngestError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use scraper::Html;

const DAILY_TOKEN: &str = "daily";
const DATE_FORMAT: &str = "%m/%d/%Y";

/// First data row of the daily-copies table
#[derive(Debug, PartialEq)]
struct DailyRow {
    href: String,
    date: String,
}

/// The page carries a daily-copies table and a monthly-archives table, each
/// under its own heading. The daily table is the first table after a heading
/// mentioning daily copies, or the first table when no heading does.
fn daily_row(body: &str) -> Result<DailyRow> {
    let document = Html::parse_document(body);
    let block_sel = selector("h1, h2, h3, h4, h5, h6, table")?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("td")?;
    let anchor_sel = selector("a[href]")?;

    let mut first_table = None;
    let mut under_daily_heading = None;
    let mut after_daily_heading = false;
    for block in document.select(&block_sel) {
        if block.value().name() == "table" {
            first_table.get_or_insert(block);
            if after_daily_heading {
                under_daily_heading = Some(block);
                break;
            }
        } else {
            let heading: String = block.text().collect();
            after_daily_heading = heading.to_lowercase().contains(DAILY_TOKEN);
        }
    }

    let table = under_daily_heading.or(first_table).ok_or_else(|| {
        IngestError::UpstreamLayoutChanged("no table of daily static copies".into())
    })?;

    let row = table
        .select(&row_sel)
        .find(|row| row.select(&cell_sel).next().is_some())
        .ok_or_else(|| IngestError::UpstreamLayoutChanged("daily copies table is empty".into()))?;

    let href = row
        .select(&anchor_sel)
        .next()
        .and_then(|a| a.value().attr("href"))
        .ok_or_else(|| IngestError::UpstreamLayoutChanged("first row has no download link".into()))?
        .trim()
        .to_string();

    if !href.contains(DAILY_TOKEN) {
        return Err(IngestError::UpstreamLayoutChanged(format!(
            "first row links to '{}', not a daily copy",
            href
        )));
    }

    let date = row
        .select(&cell_sel)
        .nth(1)
        .map(|cell| cell.text().collect::<String>().trim().to_string())
        .ok_or_else(|| IngestError::UpstreamLayoutChanged("first row has no date cell".into()))?;

    Ok(DailyRow { href, date })
}

pub(super) fn select_uris(ctx: &VisitContext<'_>, body: &str) -> Result<Vec<String>> {
    let row = daily_row(body)?;
    Ok(vec![resolve(&ctx.descriptor.link, &row.href)?])
}

pub(super) fn derive_source_updated(body: &str) -> Result<DateTime<Utc>> {
    let row = daily_row(body)?;
    let date = NaiveDate::parse_from_str(&row.date, DATE_FORMAT).map_err(|e| {
        IngestError::UpstreamLayoutChanged(format!("unreadable date '{}': {}", row.date, e))
    })?;
    Ok(midnight_utc(date))
}
