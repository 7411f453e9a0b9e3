//! The external detection / annotation / file service.
//!
//! Every network call the engine makes goes through [`DiagramApi`], so the
//! orchestration layers can run against the HTTP implementation
//! ([`crate::http::HttpApi`]) or the in-process one
//! ([`crate::memory::InMemoryApi`]) alike.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::annotations::{
    AnnotationCreate, ApiAnnotation, ApiStatus, EventAnnotation, EventStatus, TaggedAnnotation,
};
use crate::error::ApiError;
use crate::labels::{LabelDefinition, LabelPatch};
use crate::models::{
    ConvertItemStatus, ConvertJobCreated, ConvertRequest, DetectJobCreated, DetectRequest,
    DetectStatusResponse, FileId, ResourceType,
};

/// Status change for one legacy annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct EventStatusUpdate {
    pub annotation: EventAnnotation,
    pub status: EventStatus,
    pub checked_by: Option<String>,
}

/// Status change for one annotations-API annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiStatusUpdate {
    pub id: u64,
    pub status: ApiStatus,
}

#[async_trait]
pub trait DiagramApi: Send + Sync {
    /// Create a detection job for a chunk of files.
    async fn submit_detection(&self, request: &DetectRequest) -> Result<DetectJobCreated, ApiError>;

    /// Current status (and, once complete, per-file results) of a detection job.
    async fn detection_status(&self, job_id: u64) -> Result<DetectStatusResponse, ApiError>;

    async fn list_event_annotations(&self, file_id: FileId) -> Result<Vec<EventAnnotation>, ApiError>;

    async fn list_api_annotations(&self, file_id: FileId) -> Result<Vec<ApiAnnotation>, ApiError>;

    /// Persist new annotations in one batched call.
    async fn create_annotations(
        &self,
        annotations: &[AnnotationCreate],
    ) -> Result<Vec<ApiAnnotation>, ApiError>;

    async fn update_event_status(&self, updates: &[EventStatusUpdate]) -> Result<(), ApiError>;

    async fn update_api_status(&self, updates: &[ApiStatusUpdate]) -> Result<(), ApiError>;

    async fn delete_event_annotations(&self, ids: &[u64]) -> Result<(), ApiError>;

    async fn delete_api_annotations(&self, ids: &[u64]) -> Result<(), ApiError>;

    /// Create the label definition if the label store does not know it yet.
    async fn ensure_label(&self, label: &LabelDefinition) -> Result<(), ApiError>;

    async fn update_file_labels(&self, patches: &[LabelPatch]) -> Result<(), ApiError>;

    /// Add asset links to a file record. Adding an existing link is a no-op.
    async fn link_assets(&self, file_id: FileId, asset_ids: &[u64]) -> Result<(), ApiError>;

    /// Display names of assets or files, keyed by id. Unknown ids are omitted.
    async fn resource_names(
        &self,
        resource_type: ResourceType,
        ids: &[u64],
    ) -> Result<HashMap<u64, String>, ApiError>;

    async fn submit_convert(&self, request: &ConvertRequest) -> Result<ConvertJobCreated, ApiError>;

    async fn convert_status(&self, job_id: u64, file_id: FileId) -> Result<ConvertItemStatus, ApiError>;
}

/// Fetch both annotation sources for a file and tag them.
///
/// The two reads run concurrently; either failing fails the whole fetch.
pub async fn fetch_tagged_annotations(
    api: &dyn DiagramApi,
    file_id: FileId,
) -> Result<Vec<TaggedAnnotation>, ApiError> {
    let (current, legacy) = futures::future::try_join(
        api.list_api_annotations(file_id),
        api.list_event_annotations(file_id),
    )
    .await?;

    let mut tagged: Vec<TaggedAnnotation> = current
        .into_iter()
        .map(TaggedAnnotation::Annotations)
        .collect();
    tagged.extend(legacy.into_iter().map(TaggedAnnotation::Events));
    Ok(tagged)
}
