//! Command implementations
//!
//! Each command returns the process exit code on success; errors carry their
//! own code through [`IngestError::exit_code`](crate::error::IngestError::exit_code).

use crate::config::Profile;
use crate::coordinator::{Coordinator, SourceState};
use crate::error::Result;
use crate::models::SourceDescriptor;
use crate::open_repository;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// `dap-ingest run`
pub async fn run(profile: Profile, sources: &[String], cancel: CancellationToken) -> Result<i32> {
    let repo = open_repository(&profile).await?;
    let coordinator = Coordinator::new(profile, repo.clone()).with_cancellation(cancel);
    let report = coordinator.run(sources).await;
    repo.close().await;
    let report = report?;

    for outcome in &report.outcomes {
        let state = match outcome.state {
            SourceState::Done => "done".to_string(),
            SourceState::Skipped => "skipped".to_string(),
            SourceState::Failed(kind) => format!("failed ({}, code {})", kind, kind.code()),
        };
        println!("{:<24} {}", outcome.name, state);
    }
    if report.cancelled {
        println!("run {} was cancelled", report.run_id);
    }

    Ok(report.exit_code())
}

/// `dap-ingest seed`
pub async fn seed(profile: Profile) -> Result<i32> {
    let repo = open_repository(&profile).await?;
    let created = Coordinator::new(profile, repo.clone()).seed().await;
    repo.close().await;
    let created = created?;

    info!(created, "Seed complete");
    println!("{} descriptor(s) created", created);
    Ok(0)
}

/// `dap-ingest sources`
pub async fn sources(profile: Profile) -> Result<i32> {
    let repo = open_repository(&profile).await?;
    let descriptors = repo.list_sources().await;
    repo.close().await;
    print_descriptors(&descriptors?);
    Ok(0)
}

/// `dap-ingest due`
pub async fn due(profile: Profile, now: DateTime<Utc>) -> Result<i32> {
    let repo = open_repository(&profile).await?;
    let descriptors = repo.get_due_sources(now).await;
    repo.close().await;
    print_descriptors(&descriptors?);
    Ok(0)
}

/// `dap-ingest events <source>`
pub async fn events(profile: Profile, source: &str, since: Option<DateTime<Utc>>) -> Result<i32> {
    let repo = open_repository(&profile).await?;
    let events = match repo.get_descriptor(source).await {
        Ok(_) => repo.events_for(source, since).await,
        Err(e) => Err(e),
    };
    repo.close().await;

    for event in events? {
        println!(
            "{:>6} {:<6} {} {} {:>3} {}",
            event.id,
            event.kind,
            event.start.to_rfc3339(),
            event.end.to_rfc3339(),
            event.return_code,
            event.return_value
        );
    }
    Ok(0)
}

fn print_descriptors(descriptors: &[SourceDescriptor]) {
    if descriptors.is_empty() {
        println!("No sources found.");
        return;
    }
    for d in descriptors {
        println!(
            "{:<24} {:<10} lifecycle={}d last_extracted={} source_updated={} has_changed={}",
            d.name,
            d.link_type,
            d.lifecycle_days,
            fmt_time(d.last_extracted),
            fmt_time(d.source_updated),
            d.has_changed
        );
    }
}

fn fmt_time(value: Option<DateTime<Utc>>) -> String {
    value.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
}
