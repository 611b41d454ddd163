//! Pipeline coordinator
//!
//! Drives every selected source through `Visit -> Decide -> Fetch -> Stage`,
//! one source at a time. Each phase ends with exactly one event, written in
//! the same transaction as the descriptor fields the phase owns:
//!
//! | phase  | event             | descriptor fields                              |
//! |--------|-------------------|------------------------------------------------|
//! | Visit  | `visit` / `error` | `uris`, `source_updated`, `has_changed`, `last_updated` |
//! | Decide | `skip` (if not due) | none                                         |
//! | Fetch  | `fetch` / `error` | `last_extracted`, `has_changed`, `last_updated` |
//! | Stage  | `stage` / `error` | `last_staged`, `last_updated`                  |
//!
//! A failing source does not stop the run. Cancellation is checked between
//! sources, between URIs and between staged tables; the source in flight and
//! every source not yet started receive a `cancelled` error event.

use crate::clock::{Clock, SystemClock};
use crate::config::Profile;
use crate::error::{ErrorKind, IngestError, Result};
use crate::events::{EventRecorder, PhaseTimer};
use crate::fetcher::{self, FetchedUri, Fetcher};
use crate::freshness::descriptor_is_due;
use crate::http::{self, RetryPolicy};
use crate::models::{DescriptorUpdate, EventKind, NewEvent, SourceDescriptor};
use crate::repository::MetadataRepository;
use crate::stager::{self, StageContext};
use crate::visitor::{VisitContext, Visitor};
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Terminal state of one source pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Done,
    Skipped,
    Failed(ErrorKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOutcome {
    pub name: String,
    pub state: SourceState,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started: DateTime<Utc>,
    pub outcomes: Vec<SourceOutcome>,
    pub cancelled: bool,
}

impl RunReport {
    /// 0 when every source ended Done or Skipped, else the first failure's code
    pub fn exit_code(&self) -> i32 {
        self.outcomes
            .iter()
            .find_map(|o| match o.state {
                SourceState::Failed(kind) => Some(kind.code()),
                _ => None,
            })
            .unwrap_or(0)
    }

    pub fn state_of(&self, source: &str) -> Option<SourceState> {
        self.outcomes.iter().find(|o| o.name == source).map(|o| o.state)
    }

    fn count(&self, pred: impl Fn(&SourceState) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.state)).count()
    }
}

/// Totals over every URI of a fetch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchReport {
    pub uris: usize,
    pub files: usize,
    pub bytes: u64,
    pub retries: u32,
}

impl FetchReport {
    fn add(&mut self, fetched: &FetchedUri) {
        self.uris += 1;
        self.files += fetched.files.len();
        self.bytes += fetched.bytes;
        self.retries += fetched.retries;
    }

    pub fn summary(&self) -> String {
        format!(
            "retries={} uris={} files={} bytes={}",
            self.retries, self.uris, self.files, self.bytes
        )
    }
}

pub struct Coordinator {
    profile: Profile,
    repo: MetadataRepository,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    retry_policy: RetryPolicy,
    recorder: EventRecorder,
}

impl Coordinator {
    pub fn new(profile: Profile, repo: MetadataRepository) -> Self {
        let retry_policy = profile.http.retry_policy();
        Self {
            profile,
            repo,
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
            retry_policy,
            recorder: EventRecorder,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn repository(&self) -> &MetadataRepository {
        &self.repo
    }

    /// Create descriptors missing from the repository
    ///
    /// Existing descriptors keep their state; only `webpage`, `link` and
    /// `lifecycle_days` follow the profile when they were edited there.
    #[tracing::instrument(skip(self), fields(profile = %self.profile.name))]
    pub async fn seed(&self) -> Result<usize> {
        let now = self.clock.now();
        let descriptors: Vec<SourceDescriptor> =
            self.profile.sources.iter().map(|s| s.descriptor(now)).collect();

        let created = self
            .repo
            .transaction(move |tx| {
                Box::pin(async move {
                    let mut created = 0;
                    for wanted in &descriptors {
                        let Some(stored) = tx.find_descriptor(&wanted.name).await? else {
                            tx.create_descriptor(wanted).await?;
                            info!(source = %wanted.name, "Seeded descriptor");
                            created += 1;
                            continue;
                        };

                        let update = DescriptorUpdate {
                            webpage: wanted.webpage.clone().filter(|w| stored.webpage.as_ref() != Some(w)),
                            link: Some(wanted.link.clone()).filter(|l| l != &stored.link),
                            lifecycle_days: Some(wanted.lifecycle_days)
                                .filter(|d| *d != stored.lifecycle_days),
                            ..Default::default()
                        };
                        if !update.is_empty() {
                            tx.update_descriptor(&wanted.name, &update).await?;
                            info!(source = %wanted.name, "Descriptor refreshed from profile");
                        }
                    }
                    Ok(created)
                })
            })
            .await?;

        Ok(created)
    }

    /// Process the named sources (all profile sources when empty)
    ///
    /// Returns `Err` only for failures that end the whole run: an unknown
    /// source name, or a repository that stays unavailable after one retry.
    pub async fn run(&self, sources: &[String]) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started = self.clock.now();

        let selected: Vec<String> = if sources.is_empty() {
            self.profile.sources.iter().map(|s| s.name.clone()).collect()
        } else {
            for name in sources {
                self.profile.source(name)?;
            }
            sources.to_vec()
        };

        info!(%run_id, profile = %self.profile.name, sources = selected.len(), "Run started");
        self.seed().await?;

        let mut report = RunReport { run_id, started, outcomes: Vec::new(), cancelled: false };
        for (position, name) in selected.iter().enumerate() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                for remaining in &selected[position..] {
                    self.record_cancelled(remaining).await?;
                    report.outcomes.push(SourceOutcome {
                        name: remaining.clone(),
                        state: SourceState::Failed(ErrorKind::Cancelled),
                    });
                }
                break;
            }

            let descriptor = self.load_descriptor(name).await?;
            let span = tracing::info_span!("source", %run_id, source = %name);
            let state = self.run_source(descriptor, started).instrument(span).await?;
            report.outcomes.push(SourceOutcome { name: name.clone(), state });

            if state == SourceState::Failed(ErrorKind::Cancelled) {
                report.cancelled = true;
                for remaining in &selected[position + 1..] {
                    self.record_cancelled(remaining).await?;
                    report.outcomes.push(SourceOutcome {
                        name: remaining.clone(),
                        state: SourceState::Failed(ErrorKind::Cancelled),
                    });
                }
                break;
            }
        }

        info!(
            %run_id,
            done = report.count(|s| *s == SourceState::Done),
            skipped = report.count(|s| *s == SourceState::Skipped),
            failed = report.count(|s| matches!(s, SourceState::Failed(_))),
            cancelled = report.cancelled,
            "Run completed"
        );

        Ok(report)
    }

    #[tracing::instrument(skip_all, fields(link_type = %descriptor.link_type))]
    async fn run_source(
        &self,
        mut descriptor: SourceDescriptor,
        run_time: DateTime<Utc>,
    ) -> Result<SourceState> {
        let name = descriptor.name.clone();
        let clock = self.clock.as_ref();
        let visitor = Visitor::for_link_type(descriptor.link_type);
        let endpoint = visitor.endpoint(&descriptor);

        let pre_due = descriptor_is_due(&descriptor, run_time);
        debug!(pre_due, "Cached freshness decision");

        // Visit
        let timer = PhaseTimer::start(&name, clock);
        let client = match http::client_for(&descriptor, &self.profile.http) {
            Ok(client) => client,
            Err(e) => return self.fail(&timer, e, Some(endpoint)).await,
        };
        let ctx = VisitContext {
            descriptor: &descriptor,
            client: &client,
            clock,
            policy: self.retry_policy,
            cancel: &self.cancel,
        };
        let outcome = match visitor.visit(&ctx).await {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(&timer, e, Some(endpoint)).await,
        };

        let source_updated = descriptor
            .source_updated
            .map_or(outcome.source_updated, |previous| previous.max(outcome.source_updated));
        let visit_event = timer.success(
            EventKind::Visit,
            format!(
                "uris={} source_updated={} has_changed={} pre_due={}",
                outcome.uris.len(),
                source_updated.to_rfc3339(),
                outcome.has_changed,
                pre_due
            ),
            Some(endpoint),
            clock,
        );
        let update = DescriptorUpdate {
            uris: Some(outcome.uris),
            source_updated: Some(source_updated),
            has_changed: Some(outcome.has_changed),
            last_updated: Some(run_time),
            ..Default::default()
        };
        descriptor = self.persist(&name, Some(update), visit_event).await?;

        // Decide
        if !descriptor_is_due(&descriptor, run_time) {
            let timer = PhaseTimer::start(&name, clock);
            let reason = format!(
                "not due: last_extracted={} lifecycle_days={} has_changed={}",
                descriptor.last_extracted.map(|t| t.to_rfc3339()).unwrap_or_default(),
                descriptor.lifecycle_days,
                descriptor.has_changed
            );
            info!(%reason, "Skipping source");
            self.persist(&name, None, timer.success(EventKind::Skip, reason, None, clock)).await?;
            return Ok(SourceState::Skipped);
        }

        // Fetch
        let timer = PhaseTimer::start(&name, clock);
        let extract_dir = self.profile.paths.extract_dir(&name);
        let extract_uri = Some(extract_dir.display().to_string());
        let fetched = match self.fetch_all(&client, &descriptor, &extract_dir).await {
            Ok(fetched) => fetched,
            Err(e) => return self.fail(&timer, e, extract_uri).await,
        };
        let update = DescriptorUpdate {
            last_extracted: Some(run_time),
            has_changed: Some(false),
            last_updated: Some(run_time),
            ..Default::default()
        };
        let fetch_event = timer.success(EventKind::Fetch, fetched.summary(), extract_uri, clock);
        descriptor = self.persist(&name, Some(update), fetch_event).await?;

        // Stage
        let timer = PhaseTimer::start(&name, clock);
        let staging_dir = self.profile.paths.staging_dir(&name);
        let staging_uri = Some(staging_dir.display().to_string());
        let database = match descriptor.database.as_deref() {
            Some(role) => match self.profile.database(role) {
                Ok(credentials) => Some(credentials),
                Err(e) => return self.fail(&timer, e, staging_uri).await,
            },
            None => None,
        };
        let stage_ctx = StageContext {
            descriptor: &descriptor,
            extract_dir: &extract_dir,
            staging_dir: &staging_dir,
            max_skipped_ratio: self.profile.stage.max_skipped_ratio,
            database,
            cancel: &self.cancel,
        };
        let staged = match stager::stage(&stage_ctx).await {
            Ok(staged) => staged,
            Err(e) => return self.fail(&timer, e, staging_uri).await,
        };
        let update = DescriptorUpdate {
            last_staged: Some(run_time),
            last_updated: Some(run_time),
            ..Default::default()
        };
        let stage_event = timer.success(EventKind::Stage, staged.summary(), staging_uri, clock);
        self.persist(&name, Some(update), stage_event).await?;

        info!(tables = staged.outputs.len(), "Source done");
        Ok(SourceState::Done)
    }

    #[tracing::instrument(skip(self, client, descriptor), fields(uris = descriptor.uris.len()))]
    async fn fetch_all(
        &self,
        client: &Client,
        descriptor: &SourceDescriptor,
        extract_dir: &Path,
    ) -> Result<FetchReport> {
        fetcher::reset_dir(extract_dir).await?;

        let fetcher = Fetcher::new(client, self.retry_policy, self.cancel.clone());
        let mut report = FetchReport::default();
        for (i, uri) in descriptor.uris.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            let fetched = fetcher.fetch(uri, &extract_dir.join(format!("{:03}", i))).await?;
            report.add(&fetched);
        }
        Ok(report)
    }

    async fn fail(
        &self,
        timer: &PhaseTimer,
        err: IngestError,
        artifact_uri: Option<String>,
    ) -> Result<SourceState> {
        let kind = err.kind();
        if kind == ErrorKind::Cancelled {
            warn!("Source cancelled");
        } else {
            error!(kind = %kind, error = %err, "Source failed");
        }
        let event = timer.failure(&err, artifact_uri, self.clock.as_ref());
        let name = event.source_name.clone();
        self.persist(&name, None, event).await?;
        Ok(SourceState::Failed(kind))
    }

    async fn record_cancelled(&self, name: &str) -> Result<()> {
        let timer = PhaseTimer::start(name, self.clock.as_ref());
        let event = timer.failure(&IngestError::Cancelled, None, self.clock.as_ref());
        self.persist(name, None, event).await?;
        Ok(())
    }

    async fn load_descriptor(&self, name: &str) -> Result<SourceDescriptor> {
        match self.repo.get_descriptor(name).await {
            Err(e) if e.kind() == ErrorKind::StoreError && !matches!(e, IngestError::NotFound(_)) => {
                warn!(source = name, error = %e, "Repository read failed, retrying once");
                self.repo.get_descriptor(name).await
            },
            other => other,
        }
    }

    /// Write a phase's descriptor update and event atomically
    ///
    /// A failed attempt is rolled back and retried once; a second failure
    /// is fatal for the run.
    async fn persist(
        &self,
        name: &str,
        update: Option<DescriptorUpdate>,
        event: NewEvent,
    ) -> Result<SourceDescriptor> {
        match self.try_persist(name, update.as_ref(), &event).await {
            Ok(descriptor) => Ok(descriptor),
            Err(first) => {
                warn!(source = name, error = %first, "Persisting phase failed, retrying once");
                self.try_persist(name, update.as_ref(), &event).await.map_err(|second| {
                    error!(source = name, error = %second, "Repository unavailable");
                    second
                })
            },
        }
    }

    async fn try_persist(
        &self,
        name: &str,
        update: Option<&DescriptorUpdate>,
        event: &NewEvent,
    ) -> Result<SourceDescriptor> {
        let mut tx = self.repo.begin().await?;
        let descriptor = match update {
            Some(update) => tx.update_descriptor(name, update).await?,
            None => tx.get_descriptor(name).await?,
        };
        self.recorder.record(&mut tx, event).await?;
        tx.commit().await?;
        Ok(descriptor)
    }
}
