//! Event recorder
//!
//! Appends one provenance row per coordinator phase and mirrors it to the
//! `dap::events` tracing target with the same fields.

use crate::clock::Clock;
use crate::error::{IngestError, Result};
use crate::models::{Event, EventKind, NewEvent};
use crate::repository::RepositoryTx;
use chrono::{DateTime, Utc};
use dap_common::logging::EVENT_TARGET;

/// Start time of a phase whose event is not written yet
#[derive(Debug, Clone)]
pub struct PhaseTimer {
    source_name: String,
    start: DateTime<Utc>,
}

impl PhaseTimer {
    pub fn start(source_name: &str, clock: &dyn Clock) -> Self {
        Self { source_name: source_name.to_string(), start: clock.now() }
    }

    /// Successful outcome of the phase
    pub fn success(
        &self,
        kind: EventKind,
        return_value: impl Into<String>,
        artifact_uri: Option<String>,
        clock: &dyn Clock,
    ) -> NewEvent {
        self.finish(kind, 0, return_value.into(), artifact_uri, clock)
    }

    /// Failed outcome, coded with the error's kind
    pub fn failure(
        &self,
        error: &IngestError,
        artifact_uri: Option<String>,
        clock: &dyn Clock,
    ) -> NewEvent {
        let value = match error {
            IngestError::Cancelled => error.to_string(),
            other => format!("{}: {}", other.kind(), other),
        };
        self.finish(EventKind::Error, error.kind().code(), value, artifact_uri, clock)
    }

    fn finish(
        &self,
        kind: EventKind,
        return_code: i32,
        return_value: String,
        artifact_uri: Option<String>,
        clock: &dyn Clock,
    ) -> NewEvent {
        NewEvent {
            source_name: self.source_name.clone(),
            kind,
            start: self.start,
            end: clock.now().max(self.start),
            return_code,
            return_value,
            artifact_uri,
        }
    }
}

/// Thin wrapper over `append_event` that also logs every row
#[derive(Debug, Clone, Copy, Default)]
pub struct EventRecorder;

impl EventRecorder {
    pub async fn record(&self, tx: &mut RepositoryTx, event: &NewEvent) -> Result<Event> {
        let stored = tx.append_event(event).await?;
        emit(&stored);
        Ok(stored)
    }
}

fn emit(event: &Event) {
    let artifact_uri = event.artifact_uri.as_deref().unwrap_or("");
    if event.return_code == 0 {
        tracing::info!(
            target: EVENT_TARGET,
            id = event.id,
            source = %event.source_name,
            kind = %event.kind,
            start = %event.start.to_rfc3339(),
            end = %event.end.to_rfc3339(),
            return_code = event.return_code,
            return_value = %event.return_value,
            artifact_uri,
            "event"
        );
    } else {
        tracing::warn!(
            target: EVENT_TARGET,
            id = event.id,
            source = %event.source_name,
            kind = %event.kind,
            start = %event.start.to_rfc3339(),
            end = %event.end.to_rfc3339(),
            return_code = event.return_code,
            return_value = %event.return_value,
            artifact_uri,
            "event"
        );
    }
}
