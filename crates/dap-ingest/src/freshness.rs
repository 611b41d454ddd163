//! Freshness policy
//!
//! A source is due when its local copy is at least `lifecycle_days` old and
//! the upstream has published something newer than that copy. A source that
//! was never extracted is always due.
//!
//! The coordinator consults the policy twice: once with the cached descriptor
//! before visiting (advisory) and once with the freshly visited values, which
//! is the decision that gates fetching.

use crate::models::SourceDescriptor;
use chrono::{DateTime, Duration, Utc};

pub fn is_due(
    now: DateTime<Utc>,
    last_extracted: Option<DateTime<Utc>>,
    lifecycle_days: i64,
    source_updated: Option<DateTime<Utc>>,
    has_changed: bool,
) -> bool {
    let Some(last_extracted) = last_extracted else {
        return true;
    };

    // A lifecycle beyond chrono's range never elapses
    let aged = Duration::try_days(lifecycle_days)
        .is_some_and(|lifecycle| now - last_extracted >= lifecycle);
    let newer_upstream = source_updated.is_some_and(|updated| updated > last_extracted);

    aged && (has_changed || newer_upstream)
}

pub fn descriptor_is_due(descriptor: &SourceDescriptor, now: DateTime<Utc>) -> bool {
    is_due(
        now,
        descriptor.last_extracted,
        descriptor.lifecycle_days,
        descriptor.source_updated,
        descriptor.has_changed,
    )
}
