//! Source visitors
//!
//! A visitor inspects a source's upstream endpoint and reports the URIs that
//! currently hold its data plus the upstream publication time. It never
//! touches durable state; the coordinator persists the outcome.
//!
//! Visitors are a closed set selected by `link_type`:
//!
//! | link_type    | visitor   |
//! |--------------|-----------|
//! | `baseurl`    | Studies   |
//! | `pg_dump`    | Studies   |
//! | `direct`     | Approvals |
//! | `index_json` | Labels    |
//!
//! Each one is expressed as the same three capabilities: `probe` retrieves the
//! upstream document, `select_uris` extracts download URIs from it and
//! `derive_source_updated` settles the publication timestamp.

mod approvals;
mod labels;
mod studies;

use crate::clock::Clock;
use crate::error::{IngestError, Result};
use crate::http::{self, RetryPolicy};
use crate::models::{LinkType, SourceDescriptor};
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use scraper::Selector;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

/// What a visit discovered
#[derive(Debug, Clone, PartialEq)]
pub struct VisitOutcome {
    pub uris: Vec<String>,
    pub source_updated: DateTime<Utc>,
    /// `source_updated > last_extracted` (true when never extracted)
    pub has_changed: bool,
}

/// Inputs shared by every visitor
pub struct VisitContext<'a> {
    pub descriptor: &'a SourceDescriptor,
    pub client: &'a Client,
    pub clock: &'a dyn Clock,
    pub policy: RetryPolicy,
    pub cancel: &'a CancellationToken,
}

impl VisitContext<'_> {
    fn webpage(&self) -> Result<&str> {
        self.descriptor.webpage.as_deref().ok_or_else(|| {
            IngestError::ConfigMalformed(format!(
                "source '{}' has no webpage to visit",
                self.descriptor.name
            ))
        })
    }

    /// Run one upstream request under the retry policy
    pub(crate) async fn retrying<T, F, Fut>(&self, url: &str, attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        http::with_retry(&self.policy, self.cancel, url, attempt).await
    }
}

/// Upstream document retrieved by `probe`
#[derive(Debug, Clone)]
pub(crate) enum Probe {
    Html { body: String },
    Index { document: serde_json::Value, last_modified: Option<DateTime<Utc>> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visitor {
    Studies,
    Approvals,
    Labels,
}

impl Visitor {
    pub fn for_link_type(link_type: LinkType) -> Self {
        match link_type {
            LinkType::BaseUrl | LinkType::PgDump => Visitor::Studies,
            LinkType::Direct => Visitor::Approvals,
            LinkType::IndexJson => Visitor::Labels,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Visitor::Studies => "studies",
            Visitor::Approvals => "approvals",
            Visitor::Labels => "labels",
        }
    }

    /// Endpoint a visit inspects, recorded on the visit event
    pub fn endpoint(self, descriptor: &SourceDescriptor) -> String {
        match self {
            Visitor::Studies | Visitor::Approvals => {
                descriptor.webpage.clone().unwrap_or_else(|| descriptor.link.clone())
            },
            Visitor::Labels => descriptor.link.clone(),
        }
    }

    pub async fn visit(self, ctx: &VisitContext<'_>) -> Result<VisitOutcome> {
        let probe = self.probe(ctx).await?;
        let uris = self.select_uris(ctx, &probe)?;
        let source_updated = self.derive_source_updated(ctx, &probe, &uris).await?;

        let has_changed = ctx
            .descriptor
            .last_extracted
            .map_or(true, |extracted| source_updated > extracted);

        info!(
            source = %ctx.descriptor.name,
            visitor = self.name(),
            uris = uris.len(),
            source_updated = %source_updated,
            has_changed,
            "Visit complete"
        );

        Ok(VisitOutcome { uris, source_updated, has_changed })
    }

    async fn probe(self, ctx: &VisitContext<'_>) -> Result<Probe> {
        match self {
            Visitor::Studies | Visitor::Approvals => {
                let url = ctx.webpage()?;
                debug!(source = %ctx.descriptor.name, url, "Probing landing page");
                let client = ctx.client;
                let body = ctx
                    .retrying(url, || async move {
                        Ok::<_, IngestError>(http::get(client, url).await?.text().await?)
                    })
                    .await?;
                Ok(Probe::Html { body })
            },
            Visitor::Labels => labels::probe(ctx).await,
        }
    }

    fn select_uris(self, ctx: &VisitContext<'_>, probe: &Probe) -> Result<Vec<String>> {
        match (self, probe) {
            (Visitor::Studies, Probe::Html { body }) => studies::select_uris(ctx, body),
            (Visitor::Approvals, Probe::Html { body }) => approvals::select_uris(ctx, body),
            (Visitor::Labels, Probe::Index { document, .. }) => labels::select_uris(document),
            _ => Err(IngestError::UpstreamLayoutChanged(format!(
                "unexpected document for {} visitor",
                self.name()
            ))),
        }
    }

    async fn derive_source_updated(
        self,
        ctx: &VisitContext<'_>,
        probe: &Probe,
        uris: &[String],
    ) -> Result<DateTime<Utc>> {
        match (self, probe) {
            (Visitor::Studies, Probe::Html { body }) => studies::derive_source_updated(body),
            (Visitor::Approvals, Probe::Html { body }) => {
                approvals::derive_source_updated(ctx, body, uris).await
            },
            (Visitor::Labels, Probe::Index { document, last_modified }) => {
                Ok(labels::derive_source_updated(ctx, document, *last_modified))
            },
            _ => Err(IngestError::UpstreamLayoutChanged(format!(
                "unexpected document for {} visitor",
                self.name()
            ))),
        }
    }
}

/// Resolve an href against the source's base `link`
pub(crate) fn resolve(base: &str, href: &str) -> Result<String> {
    let base = Url::parse(base)
        .map_err(|e| IngestError::ConfigMalformed(format!("invalid link '{}': {}", base, e)))?;
    base.join(href.trim()).map(|url| url.to_string()).map_err(|e| {
        IngestError::UpstreamLayoutChanged(format!("unusable href '{}': {}", href, e))
    })
}

pub(crate) fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css)
        .map_err(|e| IngestError::ParseError(format!("invalid selector '{}': {}", css, e)))
}

pub(crate) fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_visitor_selection() {
        assert_eq!(Visitor::for_link_type(LinkType::BaseUrl), Visitor::Studies);
        assert_eq!(Visitor::for_link_type(LinkType::PgDump), Visitor::Studies);
        assert_eq!(Visitor::for_link_type(LinkType::Direct), Visitor::Approvals);
        assert_eq!(Visitor::for_link_type(LinkType::IndexJson), Visitor::Labels);
    }

    #[test]
    fn test_resolve_against_base() {
        assert_eq!(
            resolve("http://127.0.0.1:8080", "/static/20240115_daily.zip").unwrap(),
            "http://127.0.0.1:8080/static/20240115_daily.zip"
        );
        assert_eq!(
            resolve("https://example.org/base/", "https://cdn.example.org/a.zip").unwrap(),
            "https://cdn.example.org/a.zip"
        );
        assert!(matches!(resolve("not a url", "/a.zip"), Err(IngestError::ConfigMalformed(_))));
    }
}
