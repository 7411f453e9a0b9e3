//! Bulk review commands: approve, reject, clear.
//!
//! Each command runs per file concurrently. A file's steps are sequential
//! (read, transition, link, label) and its failure never rolls back or stops
//! other files. The caller gets one aggregated outcome and the progress
//! reporter gets exactly one notification per command. Cached reads are
//! invalidated once after every command, whether it fully succeeded or not.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use crate::annotations::{AnnotationStatus, EventStatus, TaggedAnnotation, ApiStatus};
use crate::api::{fetch_tagged_annotations, ApiStatusUpdate, DiagramApi, EventStatusUpdate};
use crate::error::{ApiError, PipelineError};
use crate::labels::{derive_label, write_label, EnsuredLabels, FileLabel};
use crate::models::{FileId, ResourceType};
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};

/// Deletes are sent in batches of at most this many ids per source.
pub const DELETE_BATCH_SIZE: usize = 1000;

/// Cached read models a command may have made stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheScope {
    Files,
    Labels,
    Events,
    AnnotationsForFile(FileId),
}

/// Hook into whatever caches reads of files, labels and annotations.
pub trait CacheInvalidator: Send + Sync {
    fn invalidate(&self, scopes: &[CacheScope]);
}

pub struct NoopInvalidator;

impl CacheInvalidator for NoopInvalidator {
    fn invalidate(&self, _scopes: &[CacheScope]) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewCommand {
    Approve,
    Reject,
    Clear,
}

impl ReviewCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewCommand::Approve => "approve",
            ReviewCommand::Reject => "reject",
            ReviewCommand::Clear => "clear",
        }
    }

    fn past_tense(&self) -> &'static str {
        match self {
            ReviewCommand::Approve => "Approved",
            ReviewCommand::Reject => "Rejected",
            ReviewCommand::Clear => "Cleared",
        }
    }
}

/// Outcome for one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileReview {
    pub file_id: FileId,
    /// Annotations whose status changed (or that were deleted, for clear).
    pub changed: usize,
    pub label: FileLabel,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewReport {
    pub command: ReviewCommand,
    pub files: Vec<FileReview>,
    pub failures: Vec<(FileId, String)>,
}

/// Current label and link counts of one file, as derived from its annotations.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileState {
    pub file_id: FileId,
    pub label: FileLabel,
    pub pending: usize,
    pub confirmed: usize,
    pub discarded: usize,
}

pub struct ReviewCommandProcessor {
    api: Arc<dyn DiagramApi>,
    checked_by: Option<String>,
    invalidator: Arc<dyn CacheInvalidator>,
    progress: Arc<dyn ProgressReporter>,
    ensured: EnsuredLabels,
}

impl ReviewCommandProcessor {
    pub fn new(api: Arc<dyn DiagramApi>) -> Self {
        Self {
            api,
            checked_by: None,
            invalidator: Arc::new(NoopInvalidator),
            progress: Arc::new(NoProgress),
            ensured: EnsuredLabels::default(),
        }
    }

    /// Recorded on legacy annotations a command transitions.
    pub fn checked_by(mut self, user: Option<String>) -> Self {
        self.checked_by = user;
        self
    }

    pub fn with_invalidator(mut self, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        self.invalidator = invalidator;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// `pending → confirmed`, then link confirmed assets onto the file.
    pub async fn approve(&self, file_ids: &[FileId]) -> Result<ReviewReport, PipelineError> {
        self.run(ReviewCommand::Approve, file_ids).await
    }

    /// `pending → discarded`.
    pub async fn reject(&self, file_ids: &[FileId]) -> Result<ReviewReport, PipelineError> {
        self.run(ReviewCommand::Reject, file_ids).await
    }

    /// Delete every annotation of the files and strip both labels.
    /// Irreversible, so it refuses to run unless `confirmed`.
    pub async fn clear(
        &self,
        file_ids: &[FileId],
        confirmed: bool,
    ) -> Result<ReviewReport, PipelineError> {
        if !confirmed {
            return Err(PipelineError::NotConfirmed("clear"));
        }
        self.run(ReviewCommand::Clear, file_ids).await
    }

    /// Read-only view of a file's derived state.
    pub async fn inspect(&self, file_id: FileId) -> Result<FileState, ApiError> {
        let annotations = fetch_tagged_annotations(self.api.as_ref(), file_id).await?;
        let count = |s: AnnotationStatus| annotations.iter().filter(|a| a.status() == s).count();
        Ok(FileState {
            file_id,
            label: derive_label(&annotations),
            pending: count(AnnotationStatus::Pending),
            confirmed: count(AnnotationStatus::Confirmed),
            discarded: count(AnnotationStatus::Discarded),
        })
    }

    async fn run(
        &self,
        command: ReviewCommand,
        file_ids: &[FileId],
    ) -> Result<ReviewReport, PipelineError> {
        let results = futures::future::join_all(
            file_ids.iter().map(|&id| self.process_file(command, id)),
        )
        .await;

        let mut report = ReviewReport {
            command,
            files: Vec::new(),
            failures: Vec::new(),
        };
        for (&file_id, result) in file_ids.iter().zip(results) {
            match result {
                Ok(done) => report.files.push(done),
                Err(e) => {
                    tracing::warn!(command = command.as_str(), file_id, error = %e, "review step failed");
                    report.failures.push((file_id, e.to_string()));
                }
            }
        }

        let mut scopes = vec![CacheScope::Files, CacheScope::Labels, CacheScope::Events];
        scopes.extend(file_ids.iter().map(|&id| CacheScope::AnnotationsForFile(id)));
        self.invalidator.invalidate(&scopes);

        if let Some((_, first)) = report.failures.first() {
            let err = PipelineError::ReviewCommand {
                command: command.as_str(),
                failed: report.failures.len(),
                total: file_ids.len(),
                message: first.clone(),
            };
            self.progress.report(ProgressEvent::Notification {
                success: false,
                message: err.to_string(),
            });
            return Err(err);
        }

        self.progress.report(ProgressEvent::Notification {
            success: true,
            message: format!("{} {} diagram(s)", command.past_tense(), report.files.len()),
        });
        Ok(report)
    }

    async fn process_file(
        &self,
        command: ReviewCommand,
        file_id: FileId,
    ) -> Result<FileReview, ApiError> {
        let annotations = fetch_tagged_annotations(self.api.as_ref(), file_id).await?;
        match command {
            ReviewCommand::Approve => {
                self.transition(file_id, annotations, AnnotationStatus::Confirmed)
                    .await
            }
            ReviewCommand::Reject => {
                self.transition(file_id, annotations, AnnotationStatus::Discarded)
                    .await
            }
            ReviewCommand::Clear => self.clear_file(file_id, annotations).await,
        }
    }

    async fn transition(
        &self,
        file_id: FileId,
        mut annotations: Vec<TaggedAnnotation>,
        to: AnnotationStatus,
    ) -> Result<FileReview, ApiError> {
        let mut events = Vec::new();
        let mut current = Vec::new();
        for a in annotations
            .iter_mut()
            .filter(|a| a.status() == AnnotationStatus::Pending)
        {
            match a {
                TaggedAnnotation::Events(e) => events.push(EventStatusUpdate {
                    annotation: e.clone(),
                    status: EventStatus::from_semantic(to),
                    checked_by: self.checked_by.clone(),
                }),
                TaggedAnnotation::Annotations(x) => current.push(ApiStatusUpdate {
                    id: x.id,
                    status: ApiStatus::from_semantic(to),
                }),
            }
            a.set_status(to);
        }

        if !events.is_empty() {
            self.api.update_event_status(&events).await?;
        }
        if !current.is_empty() {
            self.api.update_api_status(&current).await?;
        }

        if to == AnnotationStatus::Confirmed {
            let mut assets: Vec<u64> = annotations
                .iter()
                .filter(|a| {
                    a.status() == AnnotationStatus::Confirmed
                        && a.resource_type() == Some(ResourceType::Asset)
                })
                .filter_map(|a| a.resource_ref().and_then(|r| r.id))
                .collect();
            assets.sort_unstable();
            assets.dedup();
            if !assets.is_empty() {
                self.api.link_assets(file_id, &assets).await?;
            }
        }

        let label = derive_label(&annotations);
        write_label(self.api.as_ref(), &self.ensured, file_id, label).await?;
        Ok(FileReview {
            file_id,
            changed: events.len() + current.len(),
            label,
        })
    }

    async fn clear_file(
        &self,
        file_id: FileId,
        annotations: Vec<TaggedAnnotation>,
    ) -> Result<FileReview, ApiError> {
        let mut event_ids = Vec::new();
        let mut api_ids = Vec::new();
        for a in &annotations {
            match a {
                TaggedAnnotation::Events(e) => event_ids.push(e.id),
                TaggedAnnotation::Annotations(x) => api_ids.push(x.id),
            }
        }

        let mut first_error = None;
        let mut kept: HashSet<(bool, u64)> = HashSet::new();
        for batch in event_ids.chunks(DELETE_BATCH_SIZE) {
            if let Err(e) = self.api.delete_event_annotations(batch).await {
                kept.extend(batch.iter().map(|id| (true, *id)));
                first_error.get_or_insert(e);
            }
        }
        for batch in api_ids.chunks(DELETE_BATCH_SIZE) {
            if let Err(e) = self.api.delete_api_annotations(batch).await {
                kept.extend(batch.iter().map(|id| (false, *id)));
                first_error.get_or_insert(e);
            }
        }

        // Whatever a failed batch left behind still decides the label.
        let remaining: Vec<TaggedAnnotation> = annotations
            .iter()
            .filter(|a| kept.contains(&(matches!(a, TaggedAnnotation::Events(_)), a.id())))
            .cloned()
            .collect();
        let label = derive_label(&remaining);
        write_label(self.api.as_ref(), &self.ensured, file_id, label).await?;
        if let Some(e) = first_error {
            tracing::warn!(
                file_id,
                remaining = remaining.len(),
                label = label.as_str(),
                "clear left annotations behind"
            );
            return Err(e);
        }
        Ok(FileReview {
            file_id,
            changed: annotations.len(),
            label: FileLabel::NoTags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::{
        ApiAnnotation, ApiAnnotationData, ApiAnnotationType, EventAnnotation, ResourceRef,
    };
    use crate::labels::{INTERACTIVE_LABEL, PENDING_LABEL};
    use crate::memory::InMemoryApi;
    use crate::models::BoundingBox;
    use std::sync::Mutex;

    fn suggested(file_id: FileId, asset: u64) -> ApiAnnotation {
        ApiAnnotation {
            id: 0,
            annotated_resource_id: file_id,
            annotation_type: ApiAnnotationType::AssetLink,
            status: ApiStatus::Suggested,
            creating_app: "test".into(),
            data: ApiAnnotationData {
                text: format!("A-{}", asset),
                text_region: BoundingBox::default(),
                page_number: Some(1),
                asset_ref: Some(ResourceRef {
                    id: Some(asset),
                    external_id: None,
                }),
                file_ref: None,
            },
        }
    }

    fn legacy(file_id: FileId, status: EventStatus, asset: u64) -> EventAnnotation {
        EventAnnotation {
            id: 0,
            file_id,
            status,
            resource_type: Some(ResourceType::Asset),
            resource_id: Some(asset),
            resource_external_id: None,
            label: format!("L-{}", asset),
            bounding_box: BoundingBox::default(),
            page: 1,
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Vec<CacheScope>>>);

    impl CacheInvalidator for Recorder {
        fn invalidate(&self, scopes: &[CacheScope]) {
            self.0.lock().unwrap().push(scopes.to_vec());
        }
    }

    #[derive(Default)]
    struct Notes(Mutex<Vec<bool>>);

    impl ProgressReporter for Notes {
        fn report(&self, event: ProgressEvent) {
            if let ProgressEvent::Notification { success, .. } = event {
                self.0.lock().unwrap().push(success);
            }
        }
    }

    fn setup() -> Arc<InMemoryApi> {
        let api = Arc::new(InMemoryApi::new());
        api.add_file(1, &[PENDING_LABEL.external_id]);
        api.add_api_annotation(suggested(1, 10));
        api.add_event_annotation(legacy(1, EventStatus::Unhandled, 11));
        api
    }

    #[tokio::test]
    async fn approve_confirms_links_and_labels() {
        let api = setup();
        let report = ReviewCommandProcessor::new(api.clone())
            .approve(&[1])
            .await
            .unwrap();
        assert_eq!(report.files[0].changed, 2);
        assert_eq!(report.files[0].label, FileLabel::Interactive);
        assert!(api
            .annotations_for(1)
            .iter()
            .all(|a| a.status() == AnnotationStatus::Confirmed));
        assert_eq!(api.linked_assets(1), vec![10, 11]);
        assert_eq!(api.labels_for(1), vec![INTERACTIVE_LABEL.external_id.to_string()]);
    }

    #[tokio::test]
    async fn approve_twice_is_harmless() {
        let api = setup();
        let p = ReviewCommandProcessor::new(api.clone());
        p.approve(&[1]).await.unwrap();
        let again = p.approve(&[1]).await.unwrap();
        assert_eq!(again.files[0].changed, 0);
        assert_eq!(again.files[0].label, FileLabel::Interactive);
        assert_eq!(api.linked_assets(1), vec![10, 11]);
    }

    #[tokio::test]
    async fn reject_without_prior_approval_has_no_tags() {
        let api = setup();
        let report = ReviewCommandProcessor::new(api.clone())
            .reject(&[1])
            .await
            .unwrap();
        assert_eq!(report.files[0].label, FileLabel::NoTags);
        assert!(api.labels_for(1).is_empty());
        assert_eq!(api.annotations_for(1).len(), 2);
        assert!(api.linked_assets(1).is_empty());
    }

    #[tokio::test]
    async fn reject_keeps_interactive_when_confirmed_remain() {
        let api = setup();
        api.add_event_annotation(legacy(1, EventStatus::Verified, 12));
        let report = ReviewCommandProcessor::new(api.clone())
            .reject(&[1])
            .await
            .unwrap();
        assert_eq!(report.files[0].label, FileLabel::Interactive);
    }

    #[tokio::test]
    async fn clear_requires_confirmation() {
        let api = setup();
        let err = ReviewCommandProcessor::new(api.clone())
            .clear(&[1], false)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotConfirmed("clear")));
        assert_eq!(api.annotations_for(1).len(), 2);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let api = setup();
        api.add_file(2, &[INTERACTIVE_LABEL.external_id]);
        api.add_event_annotation(legacy(2, EventStatus::Verified, 3));
        let report = ReviewCommandProcessor::new(api.clone())
            .clear(&[1, 2], true)
            .await
            .unwrap();
        assert!(report.files.iter().all(|f| f.label == FileLabel::NoTags));
        for f in [1, 2] {
            assert!(api.annotations_for(f).is_empty());
            assert!(api.labels_for(f).is_empty());
        }
    }

    #[tokio::test]
    async fn failed_delete_keeps_label_in_line_with_leftovers() {
        let api = setup();
        api.add_file(3, &[INTERACTIVE_LABEL.external_id]);
        api.add_api_annotation(suggested(3, 10));
        api.add_event_annotation(legacy(3, EventStatus::Verified, 11));
        api.fail_api_deletes(3);
        let err = ReviewCommandProcessor::new(api.clone())
            .clear(&[1, 3], true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ReviewCommand {
                failed: 1,
                total: 2,
                ..
            }
        ));
        assert!(api.labels_for(1).is_empty());
        let left = api.annotations_for(3);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].status(), AnnotationStatus::Pending);
        assert_eq!(api.labels_for(3), vec![PENDING_LABEL.external_id.to_string()]);
    }

    #[tokio::test]
    async fn partial_failure_reports_once_and_keeps_successes() {
        let api = setup();
        api.add_file(2, &[]);
        api.fail_annotation_reads(2);
        let recorder = Arc::new(Recorder::default());
        let notes = Arc::new(Notes::default());
        let err = ReviewCommandProcessor::new(api.clone())
            .with_invalidator(recorder.clone())
            .with_progress(notes.clone())
            .approve(&[1, 2])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ReviewCommand {
                failed: 1,
                total: 2,
                ..
            }
        ));
        assert_eq!(api.labels_for(1), vec![INTERACTIVE_LABEL.external_id.to_string()]);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
        assert!(recorder.0.lock().unwrap()[0].contains(&CacheScope::AnnotationsForFile(2)));
        assert_eq!(*notes.0.lock().unwrap(), vec![false]);
    }

    #[tokio::test]
    async fn inspect_counts_by_status() {
        let api = setup();
        api.add_event_annotation(legacy(1, EventStatus::Deleted, 4));
        let state = ReviewCommandProcessor::new(api.clone())
            .inspect(1)
            .await
            .unwrap();
        assert_eq!(state.pending, 2);
        assert_eq!(state.discarded, 1);
        assert_eq!(state.label, FileLabel::Pending);
    }
}
