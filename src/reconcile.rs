//! Merging detection results into the annotation stores.
//!
//! For each file of a completed job the engine reads both annotation
//! sources, drops detections that an existing non-discarded annotation (or an
//! earlier candidate of the same pass) already covers, persists the rest as
//! `suggested` annotations in one batched call, and writes the label derived
//! from the resulting set.
//!
//! Files are reconciled concurrently and in isolation: one file failing is
//! recorded on the job and never affects its siblings. Two passes over the
//! same file id are serialized by a per-file lock so concurrent runs cannot
//! both create the same annotation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::annotations::{
    count_links, AnnotationCreate, ApiAnnotationData, ApiAnnotationType, ApiStatus,
    AnnotationStatus, ResourceRef, TaggedAnnotation,
};
use crate::api::{fetch_tagged_annotations, DiagramApi};
use crate::error::{ApiError, PipelineError};
use crate::labels::{derive_label, write_label, EnsuredLabels, FileLabel};
use crate::models::{
    vertices_to_bounding_box, BoundingBox, DetectResultItem, DetectedAnnotation, FailedFile,
    FileAnnotationCount, FileId, ParsingJob, ResourceType,
};

/// What one reconciliation pass did to a file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileReconciliation {
    pub file_id: FileId,
    pub counts: FileAnnotationCount,
    pub label: FileLabel,
}

pub struct ReconciliationEngine {
    api: Arc<dyn DiagramApi>,
    creating_app: String,
    ensured: EnsuredLabels,
    locks: Mutex<HashMap<FileId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ReconciliationEngine {
    pub fn new(api: Arc<dyn DiagramApi>, creating_app: impl Into<String>) -> Self {
        Self {
            api,
            creating_app: creating_app.into(),
            ensured: EnsuredLabels::default(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn file_lock(&self, file_id: FileId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(file_id).or_default().clone()
    }

    /// Reconcile every file of a completed job that came back with results.
    ///
    /// Counts land in `job.annotation_counts`, failures in
    /// `job.reconcile_failures`. Items for files the job does not cover are
    /// ignored.
    pub async fn reconcile_job(&self, job: &mut ParsingJob, items: &[DetectResultItem]) {
        let covered: HashSet<FileId> = job.file_ids().into_iter().collect();
        let work = items.iter().filter_map(|item| {
            let annotations = item.annotations.as_deref()?;
            covered
                .contains(&item.file_id)
                .then(|| self.reconcile_file(item.file_id, annotations))
        });
        let results = futures::future::join_all(work).await;

        for result in results {
            match result {
                Ok(done) => {
                    job.annotation_counts.insert(done.file_id, done.counts);
                }
                Err(PipelineError::FileReconciliation { file_id, source }) => {
                    tracing::warn!(job_id = job.job_id, file_id, error = %source, "reconciliation failed");
                    job.reconcile_failures.push(FailedFile {
                        file_id,
                        error_message: Some(source.to_string()),
                    });
                }
                Err(other) => {
                    tracing::warn!(job_id = job.job_id, error = %other, "reconciliation failed");
                }
            }
        }
    }

    /// One file, sequentially: fetch, create, label.
    pub async fn reconcile_file(
        &self,
        file_id: FileId,
        detections: &[DetectedAnnotation],
    ) -> Result<FileReconciliation, PipelineError> {
        let lock = self.file_lock(file_id);
        let result = {
            let _guard = lock.lock().await;
            self.reconcile_locked(file_id, detections).await
        };
        self.release_lock(file_id, lock);
        result.map_err(|source| PipelineError::FileReconciliation { file_id, source })
    }

    /// Forget the lock of `file_id` once no other pass holds or awaits it.
    fn release_lock(&self, file_id: FileId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&file_id);
        }
    }

    async fn reconcile_locked(
        &self,
        file_id: FileId,
        detections: &[DetectedAnnotation],
    ) -> Result<FileReconciliation, ApiError> {
        let existing = fetch_tagged_annotations(self.api.as_ref(), file_id).await?;
        let live: Vec<TaggedAnnotation> = existing
            .iter()
            .filter(|a| a.status() != AnnotationStatus::Discarded)
            .cloned()
            .collect();
        let existing_pending = live
            .iter()
            .filter(|a| a.status() == AnnotationStatus::Pending)
            .count();
        tracing::debug!(
            file_id,
            existing = live.len(),
            existing_pending,
            detections = detections.len(),
            "reconciling file"
        );

        let candidates = self.candidates(file_id, detections, &existing);
        let created = if candidates.is_empty() {
            Vec::new()
        } else {
            self.api.create_annotations(&candidates).await?
        };

        let mut all = existing;
        all.extend(created.into_iter().map(TaggedAnnotation::Annotations));
        let label = derive_label(&all);
        write_label(self.api.as_ref(), &self.ensured, file_id, label).await?;

        let (existing_file_links, existing_asset_links) = count_links(&live);
        let new_file_links = candidates
            .iter()
            .filter(|c| c.resource_type() == Some(ResourceType::File))
            .count();
        let new_asset_links = candidates.len() - new_file_links;
        tracing::info!(file_id, created = candidates.len(), label = label.as_str(), "file reconciled");

        Ok(FileReconciliation {
            file_id,
            counts: FileAnnotationCount {
                existing_file_links,
                existing_asset_links,
                new_file_links,
                new_asset_links,
            },
            label,
        })
    }

    /// One candidate per distinct entity of each detection, minus anything
    /// already covered.
    fn candidates(
        &self,
        file_id: FileId,
        detections: &[DetectedAnnotation],
        existing: &[TaggedAnnotation],
    ) -> Vec<AnnotationCreate> {
        let mut out: Vec<AnnotationCreate> = Vec::new();
        for detection in detections {
            let region = vertices_to_bounding_box(&detection.region.vertices);
            let page = detection.region.page;
            let mut seen = HashSet::new();
            for entity in detection.entities.iter().filter(|e| seen.insert(*e)) {
                let target = ResourceRef {
                    id: Some(entity.id),
                    external_id: entity.external_id.clone(),
                };
                let known = existing
                    .iter()
                    .any(|a| a.covers(entity.resource_type, &target, &region, page))
                    || out
                        .iter()
                        .any(|c| same_link(c, entity.resource_type, &target, &region, page));
                if known {
                    continue;
                }
                out.push(self.build(file_id, detection, entity.resource_type, target, region, page));
            }
        }
        out
    }

    fn build(
        &self,
        file_id: FileId,
        detection: &DetectedAnnotation,
        resource_type: ResourceType,
        target: ResourceRef,
        region: BoundingBox,
        page: u32,
    ) -> AnnotationCreate {
        let (annotation_type, asset_ref, file_ref) = match resource_type {
            ResourceType::Asset => (ApiAnnotationType::AssetLink, Some(target), None),
            ResourceType::File => (ApiAnnotationType::FileLink, None, Some(target)),
        };
        AnnotationCreate {
            annotation_type,
            annotated_resource_type: "file",
            annotated_resource_id: file_id,
            status: ApiStatus::Suggested,
            creating_app: self.creating_app.clone(),
            creating_app_version: env!("CARGO_PKG_VERSION").to_string(),
            creating_user: None,
            data: ApiAnnotationData {
                text: detection.text.clone(),
                text_region: region,
                page_number: Some(page),
                asset_ref,
                file_ref,
            },
        }
    }
}

fn same_link(
    candidate: &AnnotationCreate,
    resource_type: ResourceType,
    target: &ResourceRef,
    region: &BoundingBox,
    page: u32,
) -> bool {
    let existing_ref = match candidate.annotation_type {
        ApiAnnotationType::AssetLink => candidate.data.asset_ref.as_ref(),
        ApiAnnotationType::FileLink => candidate.data.file_ref.as_ref(),
        ApiAnnotationType::UnhandledTextObject => None,
    };
    candidate.resource_type() == Some(resource_type)
        && existing_ref.is_some_and(|r| r.matches(target))
        && candidate.data.page_number == Some(page)
        && candidate.data.text_region.approx_eq(region)
}
