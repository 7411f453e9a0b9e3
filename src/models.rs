//! Core data models used throughout the contextualizer.
//!
//! These types describe the diagrams a user selects, the candidate resources
//! they are matched against, and the wire shapes exchanged with the detection
//! service while a parsing job runs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a file record in the external file store.
pub type FileId = u64;

/// Kind of resource an entity or annotation points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Asset,
    File,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Asset => "asset",
            ResourceType::File => "file",
        }
    }
}

/// A file selected for contextualization, mirrored from the file store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagram {
    pub id: FileId,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub name: String,
    /// External ids of the labels currently attached to the file record.
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub data_set_id: Option<u64>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// A candidate asset or file that detected tags may be linked to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub resource_type: ResourceType,
    pub id: u64,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Flat entity record submitted to the detection service.
///
/// `match_value` is serialized under the configured search field name, so it
/// has no fixed key of its own; see [`Entity::to_json`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entity {
    pub resource_type: ResourceType,
    pub id: u64,
    pub external_id: Option<String>,
    pub match_value: String,
}

impl Entity {
    pub fn to_json(&self, search_field: &str) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        obj.insert(
            "resourceType".to_string(),
            serde_json::Value::String(self.resource_type.as_str().to_string()),
        );
        obj.insert("id".to_string(), serde_json::Value::from(self.id));
        if let Some(ext) = &self.external_id {
            obj.insert(
                "externalId".to_string(),
                serde_json::Value::String(ext.clone()),
            );
        }
        obj.insert(
            search_field.to_string(),
            serde_json::Value::String(self.match_value.clone()),
        );
        serde_json::Value::Object(obj)
    }
}

/// Status reported by the detection service for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(alias = "queued", alias = "QUEUED")]
    Queued,
    #[serde(alias = "running", alias = "RUNNING")]
    Running,
    #[serde(alias = "completed", alias = "COMPLETED")]
    Completed,
    #[serde(alias = "failed", alias = "FAILED")]
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Per-file progress counters of a detection job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    #[serde(default)]
    pub completed: u32,
    #[serde(default)]
    pub running: u32,
    #[serde(default)]
    pub queued: u32,
    #[serde(default)]
    pub failed: u32,
}

impl StatusCount {
    pub fn total(&self) -> u32 {
        self.completed + self.running + self.queued + self.failed
    }

    pub fn merge(&mut self, other: &StatusCount) {
        self.completed += other.completed;
        self.running += other.running;
        self.queued += other.queued;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobItem {
    pub file_id: FileId,
}

/// A file the detection service (or reconciliation) could not process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedFile {
    pub file_id: FileId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Local lifecycle of a parsing job as driven by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Submitted,
    Polling,
    Completed,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Completed | JobPhase::Failed)
    }
}

/// One detection job covering a chunk of diagrams.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsingJob {
    pub job_id: u64,
    pub status: JobStatus,
    pub phase: JobPhase,
    pub status_count: StatusCount,
    pub items: Vec<JobItem>,
    /// Files the detection service reported an error for.
    pub failed_files: Vec<FailedFile>,
    /// Files whose results could not be reconciled into annotations.
    pub reconcile_failures: Vec<FailedFile>,
    pub annotation_counts: BTreeMap<FileId, FileAnnotationCount>,
    /// Fingerprint of the submission, used to resume instead of resubmitting.
    pub submission_key: String,
    /// Set when the poll loop gave up waiting; the job is still non-terminal.
    pub stalled: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ParsingJob {
    pub fn new(job_id: u64, status: JobStatus, file_ids: &[FileId], submission_key: String) -> Self {
        Self {
            job_id,
            status,
            phase: JobPhase::Submitted,
            status_count: StatusCount {
                queued: file_ids.len() as u32,
                ..StatusCount::default()
            },
            items: file_ids.iter().map(|&file_id| JobItem { file_id }).collect(),
            failed_files: Vec::new(),
            reconcile_failures: Vec::new(),
            annotation_counts: BTreeMap::new(),
            submission_key,
            stalled: false,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn file_ids(&self) -> Vec<FileId> {
        self.items.iter().map(|i| i.file_id).collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Per-file tally produced by one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAnnotationCount {
    pub existing_file_links: usize,
    pub existing_asset_links: usize,
    pub new_file_links: usize,
    pub new_asset_links: usize,
}

// ============ Detection wire types ============

/// Body of a detection submission.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectRequest {
    pub items: Vec<JobItem>,
    pub entities: Vec<serde_json::Value>,
    pub search_field: String,
    pub min_tokens: u32,
    pub partial_match: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectJobCreated {
    pub job_id: u64,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectStatusResponse {
    #[serde(default)]
    pub job_id: Option<u64>,
    pub status: JobStatus,
    #[serde(default)]
    pub items: Vec<DetectResultItem>,
    #[serde(default)]
    pub status_count: Option<StatusCount>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectResultItem {
    pub file_id: FileId,
    #[serde(default)]
    pub annotations: Option<Vec<DetectedAnnotation>>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedAnnotation {
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub entities: Vec<DetectedEntity>,
    pub region: Region,
}

/// Entity echoed back by the detection service; extra fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedEntity {
    pub resource_type: ResourceType,
    pub id: u64,
    #[serde(default)]
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Region {
    #[serde(default)]
    pub shape: String,
    #[serde(default)]
    pub vertices: Vec<Vertex>,
    #[serde(default = "default_page")]
    pub page: u32,
}

fn default_page() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Vertex {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl BoundingBox {
    pub fn approx_eq(&self, other: &BoundingBox) -> bool {
        const EPS: f64 = 1e-6;
        (self.x_min - other.x_min).abs() < EPS
            && (self.y_min - other.y_min).abs() < EPS
            && (self.x_max - other.x_max).abs() < EPS
            && (self.y_max - other.y_max).abs() < EPS
    }
}

/// Rectangle regions carry four vertices; anything else maps to the zero box.
pub fn vertices_to_bounding_box(vertices: &[Vertex]) -> BoundingBox {
    if vertices.len() == 4 {
        BoundingBox {
            x_min: vertices[0].x,
            y_min: vertices[0].y,
            x_max: vertices[2].x,
            y_max: vertices[2].y,
        }
    } else {
        BoundingBox::default()
    }
}

pub fn bounding_box_to_vertices(b: &BoundingBox) -> Vec<Vertex> {
    vec![
        Vertex { x: b.x_min, y: b.y_min },
        Vertex { x: b.x_max, y: b.y_min },
        Vertex { x: b.x_max, y: b.y_max },
        Vertex { x: b.x_min, y: b.y_max },
    ]
}

// ============ Export wire types ============

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertRequest {
    pub diagrams: Vec<ConvertItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertItem {
    pub file_id: FileId,
    pub annotations: Vec<ExportAnnotation>,
}

/// A confirmed annotation baked into an exported artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportAnnotation {
    pub text: String,
    pub region: ExportRegion,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRegion {
    pub shape: String,
    pub vertices: Vec<Vertex>,
    pub page: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertJobCreated {
    pub job_id: u64,
}

/// Poll result of one file inside a convert job.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvertItemStatus {
    pub status: String,
    #[serde(default)]
    pub svg_id: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
}
