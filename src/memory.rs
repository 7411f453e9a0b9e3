//! In-memory [`DiagramApi`] implementation for tests and local runs.
//!
//! Keeps files, both annotation stores, labels and jobs in a single
//! `Mutex`-guarded state. Detection and convert jobs advance one step per
//! status poll, and results are scripted per file, so every lifecycle of the
//! orchestrators (partial failures, failed jobs, transient poll errors,
//! unreadable annotation stores) can be reproduced without a network.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::annotations::{
    AnnotationCreate, ApiAnnotation, EventAnnotation, TaggedAnnotation,
};
use crate::api::{ApiStatusUpdate, DiagramApi, EventStatusUpdate};
use crate::error::ApiError;
use crate::labels::{LabelDefinition, LabelPatch};
use crate::models::{
    ConvertItemStatus, ConvertJobCreated, ConvertRequest, DetectJobCreated, DetectRequest,
    DetectResultItem, DetectStatusResponse, DetectedAnnotation, FileId, JobStatus, ResourceType,
    StatusCount,
};

const CONVERT_STAGES: [&str; 6] = [
    "Queued",
    "Distributing",
    "Distributed",
    "Running",
    "Collecting",
    "Completed",
];

#[derive(Debug, Clone)]
enum ScriptedDetection {
    Found(Vec<DetectedAnnotation>),
    Error(String),
}

#[derive(Default)]
struct FileRecord {
    labels: Vec<String>,
    asset_ids: BTreeSet<u64>,
}

struct DetectJob {
    files: Vec<FileId>,
    polls: u32,
    polls_needed: u32,
    fails: bool,
}

struct ConvertJob {
    files: Vec<FileId>,
    polls: usize,
}

#[derive(Default)]
struct State {
    next_id: u64,
    files: HashMap<FileId, FileRecord>,
    events: BTreeMap<u64, EventAnnotation>,
    annotations: BTreeMap<u64, ApiAnnotation>,
    label_definitions: BTreeSet<String>,
    names: HashMap<(ResourceType, u64), String>,
    detections: HashMap<FileId, ScriptedDetection>,
    slow_files: HashMap<FileId, u32>,
    failing_job_files: HashSet<FileId>,
    failing_reads: HashSet<FileId>,
    failing_submissions: usize,
    transient_poll_errors: u32,
    jobs: HashMap<u64, DetectJob>,
    converts: HashMap<u64, ConvertJob>,
    failing_converts: HashMap<FileId, String>,
    stalled_converts: HashSet<FileId>,
    failing_deletes: HashSet<FileId>,
    convert_requests: Vec<ConvertRequest>,
    submissions: usize,
    create_calls: usize,
    label_ensures: usize,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process detection, annotation and file service.
pub struct InMemoryApi {
    state: Mutex<State>,
    default_polls: u32,
}

impl InMemoryApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1000,
                ..State::default()
            }),
            default_polls: 1,
        }
    }

    /// Number of status polls a detection job needs before it completes.
    pub fn with_completion_polls(mut self, polls: u32) -> Self {
        self.default_polls = polls.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ============ Scripting ============

    pub fn add_file(&self, file_id: FileId, labels: &[&str]) {
        let mut s = self.state();
        let rec = s.files.entry(file_id).or_default();
        rec.labels = labels.iter().map(|l| l.to_string()).collect();
    }

    pub fn add_event_annotation(&self, mut annotation: EventAnnotation) -> u64 {
        let mut s = self.state();
        let id = s.next_id();
        annotation.id = id;
        s.files.entry(annotation.file_id).or_default();
        s.events.insert(id, annotation);
        id
    }

    pub fn add_api_annotation(&self, mut annotation: ApiAnnotation) -> u64 {
        let mut s = self.state();
        let id = s.next_id();
        annotation.id = id;
        s.files.entry(annotation.annotated_resource_id).or_default();
        s.annotations.insert(id, annotation);
        id
    }

    pub fn set_resource_name(&self, resource_type: ResourceType, id: u64, name: &str) {
        self.state()
            .names
            .insert((resource_type, id), name.to_string());
    }

    /// Detections the service will return for a file.
    pub fn script_detections(&self, file_id: FileId, annotations: Vec<DetectedAnnotation>) {
        self.state()
            .detections
            .insert(file_id, ScriptedDetection::Found(annotations));
    }

    /// Make the service report a per-file error for this file.
    pub fn script_detection_error(&self, file_id: FileId, message: &str) {
        self.state()
            .detections
            .insert(file_id, ScriptedDetection::Error(message.to_string()));
    }

    /// Jobs covering this file take `polls` status polls to complete.
    pub fn slow_down(&self, file_id: FileId, polls: u32) {
        self.state().slow_files.insert(file_id, polls);
    }

    /// Jobs covering this file end in the `Failed` state.
    pub fn fail_jobs_containing(&self, file_id: FileId) {
        self.state().failing_job_files.insert(file_id);
    }

    /// The next `count` job submissions are refused.
    pub fn fail_submissions(&self, count: usize) {
        self.state().failing_submissions = count;
    }

    /// The next `count` status polls fail with a transport error.
    pub fn inject_poll_errors(&self, count: u32) {
        self.state().transient_poll_errors = count;
    }

    /// Annotation reads for this file fail.
    pub fn fail_annotation_reads(&self, file_id: FileId) {
        self.state().failing_reads.insert(file_id);
    }

    pub fn fail_convert(&self, file_id: FileId, message: &str) {
        self.state()
            .failing_converts
            .insert(file_id, message.to_string());
    }

    /// Convert jobs never get past `Running` for this file.
    pub fn stall_convert(&self, file_id: FileId) {
        self.state().stalled_converts.insert(file_id);
    }

    /// Deleting annotations-API records of this file fails.
    pub fn fail_api_deletes(&self, file_id: FileId) {
        self.state().failing_deletes.insert(file_id);
    }

    // ============ Inspection ============

    pub fn annotations_for(&self, file_id: FileId) -> Vec<TaggedAnnotation> {
        let s = self.state();
        let mut out: Vec<TaggedAnnotation> = s
            .annotations
            .values()
            .filter(|a| a.annotated_resource_id == file_id)
            .cloned()
            .map(TaggedAnnotation::Annotations)
            .collect();
        out.extend(
            s.events
                .values()
                .filter(|e| e.file_id == file_id)
                .cloned()
                .map(TaggedAnnotation::Events),
        );
        out
    }

    pub fn labels_for(&self, file_id: FileId) -> Vec<String> {
        self.state()
            .files
            .get(&file_id)
            .map(|f| f.labels.clone())
            .unwrap_or_default()
    }

    pub fn linked_assets(&self, file_id: FileId) -> Vec<u64> {
        self.state()
            .files
            .get(&file_id)
            .map(|f| f.asset_ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_label_definition(&self, external_id: &str) -> bool {
        self.state().label_definitions.contains(external_id)
    }

    pub fn submission_count(&self) -> usize {
        self.state().submissions
    }

    pub fn create_call_count(&self) -> usize {
        self.state().create_calls
    }

    pub fn label_ensure_count(&self) -> usize {
        self.state().label_ensures
    }

    pub fn convert_requests(&self) -> Vec<ConvertRequest> {
        self.state().convert_requests.clone()
    }

    fn check_readable(s: &State, file_id: FileId) -> Result<(), ApiError> {
        if s.failing_reads.contains(&file_id) {
            return Err(ApiError::Status {
                status: 500,
                body: format!("annotation store unavailable for file {}", file_id),
            });
        }
        Ok(())
    }
}

impl Default for InMemoryApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiagramApi for InMemoryApi {
    async fn submit_detection(&self, request: &DetectRequest) -> Result<DetectJobCreated, ApiError> {
        let mut s = self.state();
        if s.failing_submissions > 0 {
            s.failing_submissions -= 1;
            return Err(ApiError::Status {
                status: 400,
                body: "detection job rejected".to_string(),
            });
        }
        s.submissions += 1;
        let files: Vec<FileId> = request.items.iter().map(|i| i.file_id).collect();
        let polls_needed = files
            .iter()
            .filter_map(|f| s.slow_files.get(f).copied())
            .max()
            .unwrap_or(self.default_polls);
        let fails = files.iter().any(|f| s.failing_job_files.contains(f));
        let job_id = s.next_id();
        s.jobs.insert(
            job_id,
            DetectJob {
                files,
                polls: 0,
                polls_needed,
                fails,
            },
        );
        Ok(DetectJobCreated {
            job_id,
            status: JobStatus::Queued,
        })
    }

    async fn detection_status(&self, job_id: u64) -> Result<DetectStatusResponse, ApiError> {
        let mut s = self.state();
        if s.transient_poll_errors > 0 {
            s.transient_poll_errors -= 1;
            return Err(ApiError::Transport("connection reset".to_string()));
        }
        let scripted = s.detections.clone();
        let job = s
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| ApiError::NotFound(format!("job {}", job_id)))?;
        job.polls += 1;
        let n = job.files.len() as u32;

        if job.polls < job.polls_needed {
            return Ok(DetectStatusResponse {
                job_id: Some(job_id),
                status: JobStatus::Running,
                items: Vec::new(),
                status_count: Some(StatusCount {
                    running: n,
                    ..StatusCount::default()
                }),
                error_message: None,
            });
        }

        if job.fails {
            return Ok(DetectStatusResponse {
                job_id: Some(job_id),
                status: JobStatus::Failed,
                items: Vec::new(),
                status_count: Some(StatusCount {
                    failed: n,
                    ..StatusCount::default()
                }),
                error_message: Some("detection service failure".to_string()),
            });
        }

        let mut count = StatusCount::default();
        let items = job
            .files
            .iter()
            .map(|&file_id| match scripted.get(&file_id) {
                Some(ScriptedDetection::Error(msg)) => {
                    count.failed += 1;
                    DetectResultItem {
                        file_id,
                        annotations: None,
                        error_message: Some(msg.clone()),
                    }
                }
                Some(ScriptedDetection::Found(found)) => {
                    count.completed += 1;
                    DetectResultItem {
                        file_id,
                        annotations: Some(found.clone()),
                        error_message: None,
                    }
                }
                None => {
                    count.completed += 1;
                    DetectResultItem {
                        file_id,
                        annotations: Some(Vec::new()),
                        error_message: None,
                    }
                }
            })
            .collect();

        Ok(DetectStatusResponse {
            job_id: Some(job_id),
            status: JobStatus::Completed,
            items,
            status_count: Some(count),
            error_message: None,
        })
    }

    async fn list_event_annotations(&self, file_id: FileId) -> Result<Vec<EventAnnotation>, ApiError> {
        let s = self.state();
        Self::check_readable(&s, file_id)?;
        Ok(s.events
            .values()
            .filter(|e| e.file_id == file_id)
            .cloned()
            .collect())
    }

    async fn list_api_annotations(&self, file_id: FileId) -> Result<Vec<ApiAnnotation>, ApiError> {
        let s = self.state();
        Self::check_readable(&s, file_id)?;
        Ok(s.annotations
            .values()
            .filter(|a| a.annotated_resource_id == file_id)
            .cloned()
            .collect())
    }

    async fn create_annotations(
        &self,
        annotations: &[AnnotationCreate],
    ) -> Result<Vec<ApiAnnotation>, ApiError> {
        let mut s = self.state();
        s.create_calls += 1;
        let mut created = Vec::with_capacity(annotations.len());
        for a in annotations {
            let id = s.next_id();
            let stored = ApiAnnotation {
                id,
                annotated_resource_id: a.annotated_resource_id,
                annotation_type: a.annotation_type,
                status: a.status,
                creating_app: a.creating_app.clone(),
                data: a.data.clone(),
            };
            s.files.entry(a.annotated_resource_id).or_default();
            s.annotations.insert(id, stored.clone());
            created.push(stored);
        }
        Ok(created)
    }

    async fn update_event_status(&self, updates: &[EventStatusUpdate]) -> Result<(), ApiError> {
        let mut s = self.state();
        for u in updates {
            let event = s
                .events
                .get_mut(&u.annotation.id)
                .ok_or_else(|| ApiError::NotFound(format!("event {}", u.annotation.id)))?;
            event.status = u.status;
        }
        Ok(())
    }

    async fn update_api_status(&self, updates: &[ApiStatusUpdate]) -> Result<(), ApiError> {
        let mut s = self.state();
        for u in updates {
            let a = s
                .annotations
                .get_mut(&u.id)
                .ok_or_else(|| ApiError::NotFound(format!("annotation {}", u.id)))?;
            a.status = u.status;
        }
        Ok(())
    }

    async fn delete_event_annotations(&self, ids: &[u64]) -> Result<(), ApiError> {
        let mut s = self.state();
        for id in ids {
            s.events.remove(id);
        }
        Ok(())
    }

    async fn delete_api_annotations(&self, ids: &[u64]) -> Result<(), ApiError> {
        let mut s = self.state();
        let blocked = ids.iter().any(|id| {
            s.annotations
                .get(id)
                .is_some_and(|a| s.failing_deletes.contains(&a.annotated_resource_id))
        });
        if blocked {
            return Err(ApiError::Status {
                status: 500,
                body: "delete failed".to_string(),
            });
        }
        for id in ids {
            s.annotations.remove(id);
        }
        Ok(())
    }

    async fn ensure_label(&self, label: &LabelDefinition) -> Result<(), ApiError> {
        // A real round trip; lets concurrent callers interleave.
        tokio::task::yield_now().await;
        let mut s = self.state();
        s.label_ensures += 1;
        s.label_definitions.insert(label.external_id.to_string());
        Ok(())
    }

    async fn update_file_labels(&self, patches: &[LabelPatch]) -> Result<(), ApiError> {
        let mut s = self.state();
        for p in patches {
            if let Some(missing) = p
                .add
                .iter()
                .find(|l| !s.label_definitions.contains(l.as_str()))
            {
                return Err(ApiError::Status {
                    status: 400,
                    body: format!("label '{}' does not exist", missing),
                });
            }
        }
        for p in patches {
            let rec = s.files.entry(p.file_id).or_default();
            p.apply(&mut rec.labels);
        }
        Ok(())
    }

    async fn link_assets(&self, file_id: FileId, asset_ids: &[u64]) -> Result<(), ApiError> {
        let mut s = self.state();
        let rec = s.files.entry(file_id).or_default();
        rec.asset_ids.extend(asset_ids.iter().copied());
        Ok(())
    }

    async fn resource_names(
        &self,
        resource_type: ResourceType,
        ids: &[u64],
    ) -> Result<HashMap<u64, String>, ApiError> {
        let s = self.state();
        Ok(ids
            .iter()
            .filter_map(|id| {
                s.names
                    .get(&(resource_type, *id))
                    .map(|n| (*id, n.clone()))
            })
            .collect())
    }

    async fn submit_convert(&self, request: &ConvertRequest) -> Result<ConvertJobCreated, ApiError> {
        let mut s = self.state();
        let job_id = s.next_id();
        s.convert_requests.push(request.clone());
        s.converts.insert(
            job_id,
            ConvertJob {
                files: request.diagrams.iter().map(|d| d.file_id).collect(),
                polls: 0,
            },
        );
        Ok(ConvertJobCreated { job_id })
    }

    async fn convert_status(&self, job_id: u64, file_id: FileId) -> Result<ConvertItemStatus, ApiError> {
        let mut s = self.state();
        let failure = s.failing_converts.get(&file_id).cloned();
        let stalled = s.stalled_converts.contains(&file_id);
        let job = s
            .converts
            .get_mut(&job_id)
            .ok_or_else(|| ApiError::NotFound(format!("convert job {}", job_id)))?;
        if !job.files.contains(&file_id) {
            return Err(ApiError::NotFound(format!(
                "file {} in convert job {}",
                file_id, job_id
            )));
        }
        let last = if stalled { 3 } else { CONVERT_STAGES.len() - 1 }; // 3 is "Running"
        let stage = job.polls.min(last);
        job.polls += 1;

        if stage == CONVERT_STAGES.len() - 1 {
            if let Some(message) = failure {
                return Ok(ConvertItemStatus {
                    status: "Failed".to_string(),
                    svg_id: None,
                    error_message: Some(message),
                });
            }
            return Ok(ConvertItemStatus {
                status: "Completed".to_string(),
                svg_id: Some(file_id + 1_000_000),
                error_message: None,
            });
        }

        Ok(ConvertItemStatus {
            status: CONVERT_STAGES[stage].to_string(),
            svg_id: None,
            error_message: None,
        })
    }
}
