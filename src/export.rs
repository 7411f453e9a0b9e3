//! Per-file export ("convert to shareable image") jobs.
//!
//! Export jobs are independent of detection jobs: one job per file, each with
//! its own spawned poll task. Only confirmed annotations are baked into the
//! artifact, labelled with the referenced asset or file name. Submitting a
//! file whose export is still in flight returns the running job instead of
//! starting another.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::annotations::AnnotationStatus;
use crate::api::{fetch_tagged_annotations, DiagramApi};
use crate::config::PollingConfig;
use crate::error::{ApiError, PipelineError};
use crate::models::{
    bounding_box_to_vertices, ConvertItem, ConvertJobCreated, ConvertRequest, ExportAnnotation,
    ExportRegion, FileId, ResourceType,
};
use crate::poller::backoff;
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};

/// Label used when a referenced resource has no resolvable name.
pub const NO_LABEL: &str = "No label";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExportStatus {
    Queued,
    Distributing,
    Distributed,
    Running,
    Collecting,
    Completed,
    Failed,
}

impl ExportStatus {
    /// Unknown service states are treated as still running.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "queued" => ExportStatus::Queued,
            "distributing" => ExportStatus::Distributing,
            "distributed" => ExportStatus::Distributed,
            "collecting" => ExportStatus::Collecting,
            "completed" => ExportStatus::Completed,
            "failed" => ExportStatus::Failed,
            _ => ExportStatus::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExportStatus::Completed | ExportStatus::Failed)
    }
}

/// What a caller needs to render an export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum ExportView {
    InProgress,
    Ready { svg_id: u64 },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub file_id: FileId,
    pub job_id: Option<u64>,
    pub status: ExportStatus,
    pub converted_file_id: Option<u64>,
    pub error_message: Option<String>,
    /// Polling gave up before a terminal state; a new submit is allowed.
    pub stalled: bool,
}

impl ExportJob {
    fn pending(file_id: FileId) -> Self {
        Self {
            file_id,
            job_id: None,
            status: ExportStatus::Queued,
            converted_file_id: None,
            error_message: None,
            stalled: false,
        }
    }

    fn in_flight(&self) -> bool {
        !self.status.is_terminal() && !self.stalled
    }

    pub fn view(&self) -> ExportView {
        match self.status {
            ExportStatus::Completed => match self.converted_file_id {
                Some(svg_id) => ExportView::Ready { svg_id },
                None => ExportView::Failed {
                    message: "export finished without an artifact".to_string(),
                },
            },
            ExportStatus::Failed => ExportView::Failed {
                message: self
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "export failed".to_string()),
            },
            _ => ExportView::InProgress,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportSubmission {
    Started(u64),
    /// An export for this file was already running; nothing was submitted.
    InFlight(Option<u64>),
}

type JobTable = Arc<Mutex<HashMap<FileId, ExportJob>>>;

fn table(jobs: &JobTable) -> MutexGuard<'_, HashMap<FileId, ExportJob>> {
    jobs.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ExportJobOrchestrator {
    api: Arc<dyn DiagramApi>,
    polling: PollingConfig,
    prefix: Option<String>,
    jobs: JobTable,
    tasks: Mutex<HashMap<FileId, JoinHandle<()>>>,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressReporter>,
}

impl ExportJobOrchestrator {
    pub fn new(api: Arc<dyn DiagramApi>, polling: PollingConfig) -> Self {
        Self {
            api,
            polling,
            prefix: None,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            tasks: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            progress: Arc::new(NoProgress),
        }
    }

    /// Name prefix for exported artifacts.
    pub fn with_prefix(mut self, prefix: Option<String>) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn job(&self, file_id: FileId) -> Option<ExportJob> {
        table(&self.jobs).get(&file_id).cloned()
    }

    /// Confirmed annotations of a file, ready to bake into an artifact.
    pub async fn payload(&self, file_id: FileId) -> Result<ConvertItem, ApiError> {
        let confirmed: Vec<_> = fetch_tagged_annotations(self.api.as_ref(), file_id)
            .await?
            .into_iter()
            .filter(|a| a.status() == AnnotationStatus::Confirmed)
            .collect();

        let mut ids: HashMap<ResourceType, BTreeSet<u64>> = HashMap::new();
        for a in &confirmed {
            if let (Some(rt), Some(id)) = (a.resource_type(), a.resource_ref().and_then(|r| r.id)) {
                ids.entry(rt).or_default().insert(id);
            }
        }
        let mut names: HashMap<(ResourceType, u64), String> = HashMap::new();
        for (rt, set) in &ids {
            let wanted: Vec<u64> = set.iter().copied().collect();
            for (id, name) in self.api.resource_names(*rt, &wanted).await? {
                names.insert((*rt, id), name);
            }
        }

        let annotations = confirmed
            .iter()
            .map(|a| {
                let text = a
                    .resource_type()
                    .zip(a.resource_ref().and_then(|r| r.id))
                    .and_then(|key| names.get(&key).cloned())
                    .unwrap_or_else(|| NO_LABEL.to_string());
                ExportAnnotation {
                    text,
                    region: ExportRegion {
                        shape: "rectangle".to_string(),
                        vertices: bounding_box_to_vertices(&a.bounding_box()),
                        page: a.page(),
                    },
                }
            })
            .collect();
        Ok(ConvertItem {
            file_id,
            annotations,
        })
    }

    async fn create(&self, file_id: FileId) -> Result<ConvertJobCreated, ApiError> {
        let item = self.payload(file_id).await?;
        let request = ConvertRequest {
            diagrams: vec![item],
            prefix: self.prefix.clone(),
        };
        self.api.submit_convert(&request).await
    }

    /// Start an export for `file_id` unless one is already in flight.
    pub async fn submit(&self, file_id: FileId) -> Result<ExportSubmission, PipelineError> {
        {
            let mut jobs = table(&self.jobs);
            if let Some(existing) = jobs.get(&file_id).filter(|j| j.in_flight()) {
                tracing::debug!(file_id, "export already in flight");
                return Ok(ExportSubmission::InFlight(existing.job_id));
            }
            jobs.insert(file_id, ExportJob::pending(file_id));
        }

        let job_id = match self.create(file_id).await {
            Ok(c) => c.job_id,
            Err(source) => {
                table(&self.jobs).remove(&file_id);
                return Err(PipelineError::Export { file_id, source });
            }
        };
        if let Some(job) = table(&self.jobs).get_mut(&file_id) {
            job.job_id = Some(job_id);
        }
        tracing::info!(file_id, job_id, "export job submitted");
        self.progress.report(ProgressEvent::Export {
            file_id,
            status: "Queued".to_string(),
        });

        let handle = tokio::spawn(poll_export(
            self.api.clone(),
            self.jobs.clone(),
            self.polling.clone(),
            self.cancel.child_token(),
            self.progress.clone(),
            file_id,
            job_id,
        ));
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.insert(file_id, handle);
        Ok(ExportSubmission::Started(job_id))
    }

    /// Wait for the file's poll task to end and return the final job state.
    pub async fn wait(&self, file_id: FileId) -> Option<ExportJob> {
        let handle = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&file_id);
        if let Some(h) = handle {
            if let Err(e) = h.await {
                tracing::warn!(file_id, error = %e, "export poll task ended abnormally");
            }
        }
        self.job(file_id)
    }

    /// Stop every poll task. Job states are left as last observed.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ExportJobOrchestrator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_export(
    api: Arc<dyn DiagramApi>,
    jobs: JobTable,
    config: PollingConfig,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressReporter>,
    file_id: FileId,
    job_id: u64,
) {
    let deadline = Instant::now() + config.timeout();
    let mut failures: u32 = 0;
    let mut last = ExportStatus::Queued;

    loop {
        let wait = match api.convert_status(job_id, file_id).await {
            Ok(item) => {
                failures = 0;
                let status = ExportStatus::parse(&item.status);
                {
                    let mut t = table(&jobs);
                    if let Some(job) = t.get_mut(&file_id) {
                        job.status = status;
                        job.converted_file_id = item.svg_id.or(job.converted_file_id);
                        job.error_message = item.error_message.clone();
                    }
                }
                if status != last {
                    progress.report(ProgressEvent::Export {
                        file_id,
                        status: item.status.clone(),
                    });
                    last = status;
                }
                if status.is_terminal() {
                    tracing::info!(file_id, job_id, ?status, "export job finished");
                    return;
                }
                config.interval()
            }
            Err(e) => {
                failures += 1;
                let delay = backoff(config.interval(), config.max_backoff(), failures);
                tracing::warn!(file_id, job_id, error = %e, "export poll failed");
                delay
            }
        };

        if Instant::now() + wait > deadline {
            {
                let mut t = table(&jobs);
                if let Some(job) = t.get_mut(&file_id) {
                    job.stalled = true;
                }
            }
            tracing::warn!(file_id, job_id, "export still running, giving up polling");
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait.max(Duration::from_millis(1))) => {}
        }
    }
}
