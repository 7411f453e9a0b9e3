//! The workflow aggregate and the runner that drives it.
//!
//! A [`Workflow`] owns the selection (diagrams, resources, options) and every
//! [`ParsingJob`] created for it. [`WorkflowRunner::run`] spawns one task per
//! chunk (submit, poll, reconcile). Tasks never touch the workflow directly:
//! they send [`JobEvent`]s over a channel and the runner, as the single owner,
//! folds them in and reports an aggregate snapshot after each one. All tasks
//! share a cancellation token bound to the runner.
//!
//! Resources selected by id alone are resolved to their names before any
//! chunk is submitted; the workflow reports `loading` while that runs.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::api::DiagramApi;
use crate::batcher::{submit_chunk, DetectOptions, JobBatcher, Submission};
use crate::config::Config;
use crate::entity::map_entities;
use crate::error::PipelineError;
use crate::models::{
    Diagram, FailedFile, FileAnnotationCount, FileId, ParsingJob, Resource, ResourceType,
    StatusCount,
};
use crate::poller::JobPoller;
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::reconcile::ReconciliationEngine;
use crate::status::{aggregate_status, percent_done, total_status_count, AggregateStatus, RunFlags};

/// Per-resource-type attribute used as the entity match value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchFields {
    #[serde(default)]
    pub assets: Option<String>,
    #[serde(default)]
    pub files: Option<String>,
}

/// Options of a run; unset values fall back to the `[detection]` config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowOptions {
    #[serde(default)]
    pub partial_match: Option<bool>,
    #[serde(default)]
    pub min_tokens: Option<u32>,
    #[serde(default)]
    pub match_fields: Option<MatchFields>,
}

/// A chunk whose detection job could not be created.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFailure {
    pub chunk: usize,
    pub file_ids: Vec<FileId>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub diagrams: Vec<Diagram>,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub options: WorkflowOptions,
    #[serde(skip_deserializing)]
    pub jobs: Vec<ParsingJob>,
    #[serde(skip_deserializing)]
    pub started: bool,
    #[serde(skip_deserializing)]
    pub submission_failures: Vec<ChunkFailure>,
    #[serde(skip)]
    pub resources_loading: bool,
}

impl Workflow {
    pub fn new(id: u64, diagrams: Vec<Diagram>, resources: Vec<Resource>) -> Self {
        Self {
            id,
            diagrams,
            resources,
            options: WorkflowOptions::default(),
            jobs: Vec::new(),
            started: false,
            submission_failures: Vec::new(),
            resources_loading: false,
        }
    }

    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(content)
    }

    pub fn diagram_ids(&self) -> Vec<FileId> {
        self.diagrams.iter().map(|d| d.id).collect()
    }

    pub fn has_selection(&self) -> bool {
        !self.diagrams.is_empty() && !self.resources.is_empty()
    }

    /// Ids of selected resources that carry no name yet, per type.
    pub fn unnamed_resources(&self) -> BTreeMap<ResourceType, Vec<u64>> {
        let mut out: BTreeMap<ResourceType, Vec<u64>> = BTreeMap::new();
        for r in self.resources.iter().filter(|r| r.name.is_empty()) {
            out.entry(r.resource_type).or_default().push(r.id);
        }
        out
    }

    pub fn detect_options(&self, config: &Config) -> DetectOptions {
        DetectOptions {
            search_field: config.detection.search_field.clone(),
            min_tokens: self.options.min_tokens.unwrap_or(config.detection.min_tokens),
            partial_match: self
                .options
                .partial_match
                .unwrap_or(config.detection.partial_match),
        }
    }

    /// Entity records for the detection service, assets first.
    pub fn entity_payload(&self, config: &Config) -> Vec<serde_json::Value> {
        let fields = self.options.match_fields.clone().unwrap_or_default();
        let asset_field = fields
            .assets
            .unwrap_or_else(|| config.detection.asset_match_field.clone());
        let file_field = fields
            .files
            .unwrap_or_else(|| config.detection.file_match_field.clone());
        map_entities(&self.resources, &asset_field, &file_field)
            .iter()
            .map(|e| e.to_json(&config.detection.search_field))
            .collect()
    }

    fn flags(&self) -> RunFlags {
        RunFlags {
            has_selection: self.has_selection(),
            started: self.started,
            resources_loading: self.resources_loading,
            submission_failures: self.submission_failures.len(),
        }
    }

    pub fn status(&self) -> AggregateStatus {
        aggregate_status(&self.jobs, self.flags())
    }

    pub fn status_count(&self) -> StatusCount {
        total_status_count(&self.jobs)
    }

    pub fn percent(&self) -> u8 {
        if self.status() == AggregateStatus::Done {
            return 100;
        }
        percent_done(&self.status_count())
    }

    /// Counts per file across every job.
    pub fn annotation_counts(&self) -> BTreeMap<FileId, FileAnnotationCount> {
        self.jobs
            .iter()
            .flat_map(|j| j.annotation_counts.iter().map(|(k, v)| (*k, *v)))
            .collect()
    }

    /// Files that failed detection or reconciliation, in job order.
    pub fn failed_files(&self) -> Vec<FailedFile> {
        self.jobs
            .iter()
            .flat_map(|j| j.failed_files.iter().chain(j.reconcile_failures.iter()))
            .cloned()
            .collect()
    }

    fn upsert_job(&mut self, job: ParsingJob) {
        match self.jobs.iter_mut().find(|j| j.job_id == job.job_id) {
            Some(slot) => *slot = job,
            None => self.jobs.push(job),
        }
    }

    /// Fold one event into the aggregate.
    pub fn apply(&mut self, event: JobEvent) {
        match event {
            JobEvent::Submitted { job, .. } => self.upsert_job(job),
            JobEvent::Resumed { .. } => {}
            JobEvent::SubmissionFailed(failure) => self.submission_failures.push(failure),
            JobEvent::Updated(job) => self.upsert_job(job),
        }
    }
}

/// Messages from chunk tasks to the runner.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Submitted { chunk: usize, job: ParsingJob },
    Resumed { chunk: usize, job_id: u64 },
    SubmissionFailed(ChunkFailure),
    Updated(ParsingJob),
}

pub struct WorkflowRunner {
    api: Arc<dyn DiagramApi>,
    config: Config,
    engine: Arc<ReconciliationEngine>,
    progress: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
}

impl WorkflowRunner {
    pub fn new(api: Arc<dyn DiagramApi>, config: Config) -> Self {
        let engine = Arc::new(ReconciliationEngine::new(
            api.clone(),
            config.review.creating_app.clone(),
        ));
        Self {
            api,
            config,
            engine,
            progress: Arc::new(NoProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Token that stops every chunk task of this runner.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Submit (or resume) every chunk of the workflow and wait for all chunk
    /// tasks to end. Failures local to a chunk or file are recorded on the
    /// workflow; the returned status is the final aggregate.
    pub async fn run(&self, workflow: &mut Workflow) -> AggregateStatus {
        if !workflow.has_selection() {
            tracing::warn!(workflow = workflow.id, "nothing selected, not starting");
            return workflow.status();
        }
        self.resolve_resources(workflow).await;
        workflow.started = true;
        workflow.submission_failures.clear();

        let batcher = JobBatcher::new(self.config.detection.chunk_size);
        let entities = workflow.entity_payload(&self.config);
        let options = workflow.detect_options(&self.config);
        let chunks = batcher.plan(&workflow.diagram_ids());
        tracing::info!(
            workflow = workflow.id,
            chunks = chunks.len(),
            entities = entities.len(),
            "starting run"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        for (chunk, ids) in chunks.iter().enumerate() {
            let request = batcher.request_for(ids, &entities, &options);
            let task = ChunkTask {
                api: self.api.clone(),
                engine: self.engine.clone(),
                poller: JobPoller::new(self.api.clone(), self.config.polling.clone()),
                known: workflow.jobs.clone(),
                cancel: self.cancel.child_token(),
                tx: tx.clone(),
            };
            tasks.spawn(task.run(chunk, request));
        }
        drop(tx);

        while let Some(event) = rx.recv().await {
            self.report(&event);
            workflow.apply(event);
            self.report_status(workflow);
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "chunk task panicked");
            }
        }

        let status = workflow.status();
        tracing::info!(workflow = workflow.id, status = status.as_str(), "run finished");
        status
    }

    /// Fill in names of resources selected by id only. Lookups that fail
    /// leave the name empty; the run goes on with what is known.
    async fn resolve_resources(&self, workflow: &mut Workflow) {
        let unnamed = workflow.unnamed_resources();
        if unnamed.is_empty() {
            return;
        }
        workflow.resources_loading = true;
        self.report_status(workflow);

        for (resource_type, ids) in unnamed {
            match self.api.resource_names(resource_type, &ids).await {
                Ok(names) => {
                    for r in workflow
                        .resources
                        .iter_mut()
                        .filter(|r| r.resource_type == resource_type && r.name.is_empty())
                    {
                        if let Some(name) = names.get(&r.id) {
                            r.name = name.clone();
                        }
                    }
                    tracing::debug!(
                        ?resource_type,
                        requested = ids.len(),
                        resolved = names.len(),
                        "resource names loaded"
                    );
                }
                Err(e) => {
                    tracing::warn!(?resource_type, error = %e, "could not load resource names");
                }
            }
        }
        workflow.resources_loading = false;
    }

    fn report_status(&self, workflow: &Workflow) {
        self.progress.report(ProgressEvent::Status {
            status: workflow.status(),
            percent: workflow.percent(),
            count: workflow.status_count(),
        });
    }

    fn report(&self, event: &JobEvent) {
        let progress = match event {
            JobEvent::Submitted { chunk, job } => ProgressEvent::ChunkSubmitted {
                chunk: *chunk,
                job_id: job.job_id,
                files: job.items.len(),
            },
            JobEvent::Resumed { chunk, job_id } => ProgressEvent::ChunkResumed {
                chunk: *chunk,
                job_id: *job_id,
            },
            JobEvent::SubmissionFailed(f) => ProgressEvent::Notification {
                success: false,
                message: format!("chunk {} not submitted: {}", f.chunk + 1, f.message),
            },
            JobEvent::Updated(job) if job.is_terminal() || job.stalled => {
                ProgressEvent::JobFinished {
                    job_id: job.job_id,
                    phase: job.phase,
                    failed_files: job.failed_files.len() + job.reconcile_failures.len(),
                    stalled: job.stalled,
                }
            }
            JobEvent::Updated(job) => ProgressEvent::JobProgress {
                job_id: job.job_id,
                count: job.status_count,
            },
        };
        self.progress.report(progress);
    }
}

impl Drop for WorkflowRunner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ChunkTask {
    api: Arc<dyn DiagramApi>,
    engine: Arc<ReconciliationEngine>,
    poller: JobPoller,
    known: Vec<ParsingJob>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl ChunkTask {
    async fn run(self, chunk: usize, request: crate::models::DetectRequest) {
        let submission = submit_chunk(self.api.as_ref(), &self.known, chunk, &request).await;
        let mut job = match submission {
            Ok(Submission::Created(job)) => {
                let _ = self.tx.send(JobEvent::Submitted {
                    chunk,
                    job: job.clone(),
                });
                job
            }
            Ok(Submission::Resumed(job_id)) => {
                let _ = self.tx.send(JobEvent::Resumed { chunk, job_id });
                match self.known.iter().find(|j| j.job_id == job_id) {
                    Some(job) => job.clone(),
                    None => return,
                }
            }
            Err(e) => {
                tracing::warn!(chunk, error = %e, "chunk not submitted");
                let message = match &e {
                    PipelineError::Submission { source, .. } => source.to_string(),
                    other => other.to_string(),
                };
                let _ = self.tx.send(JobEvent::SubmissionFailed(ChunkFailure {
                    chunk,
                    file_ids: request.items.iter().map(|i| i.file_id).collect(),
                    message,
                }));
                return;
            }
        };

        let tx = self.tx.clone();
        let outcome = self
            .poller
            .run(&mut job, &self.cancel, |j| {
                let _ = tx.send(JobEvent::Updated(j.clone()));
            })
            .await;

        match outcome {
            Ok(items) => {
                self.engine.reconcile_job(&mut job, &items).await;
            }
            Err(e) => {
                tracing::warn!(
                    chunk,
                    job_id = job.job_id,
                    recoverable = e.is_recoverable(),
                    error = %e,
                    "polling stopped"
                );
            }
        }
        let _ = self.tx.send(JobEvent::Updated(job));
    }
}
