//! File review labels.
//!
//! A file's label is a pure function of its annotation set ([`derive_label`]).
//! The label attribute on the remote file record is only a cache of that
//! value: every write path recomputes the label from the annotations it just
//! read or mutated and writes a full [`LabelPatch`] (add the target label,
//! remove the other one), which is idempotent.

use std::collections::HashSet;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::annotations::{AnnotationStatus, TaggedAnnotation};
use crate::api::DiagramApi;
use crate::error::ApiError;
use crate::models::FileId;

/// Definition of a label in the label store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelDefinition {
    pub external_id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

pub const PENDING_LABEL: LabelDefinition = LabelDefinition {
    external_id: "Pending interactive engineering diagram",
    name: "Pending interactive engineering diagram",
    description: "Diagrams that have this label have been contextualized but the detected tags have not been approved yet.",
};

pub const INTERACTIVE_LABEL: LabelDefinition = LabelDefinition {
    external_id: "Interactive engineering diagram",
    name: "Interactive engineering diagram",
    description: "Diagrams that have this label have been contextualized and the detected tags have been approved.",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FileLabel {
    NoTags,
    Pending,
    Interactive,
}

impl FileLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileLabel::NoTags => "no tags",
            FileLabel::Pending => "pending",
            FileLabel::Interactive => "interactive",
        }
    }

    /// Read the cached label off a file record's label list.
    pub fn from_file_labels(labels: &[String]) -> Self {
        if labels.iter().any(|l| l == PENDING_LABEL.external_id) {
            FileLabel::Pending
        } else if labels.iter().any(|l| l == INTERACTIVE_LABEL.external_id) {
            FileLabel::Interactive
        } else {
            FileLabel::NoTags
        }
    }
}

/// Pending wins over confirmed; with neither the file has no tags.
pub fn derive_label_from_statuses<I>(statuses: I) -> FileLabel
where
    I: IntoIterator<Item = AnnotationStatus>,
{
    let mut confirmed = false;
    for status in statuses {
        match status {
            AnnotationStatus::Pending => return FileLabel::Pending,
            AnnotationStatus::Confirmed => confirmed = true,
            AnnotationStatus::Discarded => {}
        }
    }
    if confirmed {
        FileLabel::Interactive
    } else {
        FileLabel::NoTags
    }
}

pub fn derive_label(annotations: &[TaggedAnnotation]) -> FileLabel {
    derive_label_from_statuses(annotations.iter().map(TaggedAnnotation::status))
}

/// Label changes for one file record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelPatch {
    pub file_id: FileId,
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl LabelPatch {
    /// The full patch that makes a file's cached label equal `label`.
    pub fn towards(file_id: FileId, label: FileLabel) -> Self {
        let pending = PENDING_LABEL.external_id.to_string();
        let interactive = INTERACTIVE_LABEL.external_id.to_string();
        let (add, remove) = match label {
            FileLabel::Pending => (vec![pending], vec![interactive]),
            FileLabel::Interactive => (vec![interactive], vec![pending]),
            FileLabel::NoTags => (vec![], vec![pending, interactive]),
        };
        Self {
            file_id,
            add,
            remove,
        }
    }

    /// Apply to a local label list, as the file store does.
    pub fn apply(&self, labels: &mut Vec<String>) {
        labels.retain(|l| !self.remove.contains(l));
        for l in &self.add {
            if !labels.contains(l) {
                labels.push(l.clone());
            }
        }
    }

    /// The label definition that must exist before this patch is written.
    pub fn required_definition(&self) -> Option<LabelDefinition> {
        self.add.first().map(|l| {
            if l == PENDING_LABEL.external_id {
                PENDING_LABEL
            } else {
                INTERACTIVE_LABEL
            }
        })
    }
}

/// Label definitions already ensured during the current run or command.
///
/// The set stays locked while a definition is being ensured, so concurrent
/// writers of the same run wait for the first one instead of racing it.
#[derive(Default)]
pub struct EnsuredLabels(Mutex<HashSet<&'static str>>);

impl EnsuredLabels {
    async fn ensure(&self, api: &dyn DiagramApi, def: &LabelDefinition) -> Result<(), ApiError> {
        let mut ensured = self.0.lock().await;
        if !ensured.contains(def.external_id) {
            api.ensure_label(def).await?;
            ensured.insert(def.external_id);
        }
        Ok(())
    }
}

/// Push `label` to the file record, creating its definition first if this
/// run has not done so yet.
pub async fn write_label(
    api: &dyn DiagramApi,
    ensured: &EnsuredLabels,
    file_id: FileId,
    label: FileLabel,
) -> Result<(), ApiError> {
    let patch = LabelPatch::towards(file_id, label);
    if let Some(def) = patch.required_definition() {
        ensured.ensure(api, &def).await?;
    }
    api.update_file_labels(std::slice::from_ref(&patch)).await?;
    tracing::debug!(file_id, label = label.as_str(), "file label written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::tests::{api, event};
    use crate::annotations::{ApiStatus, EventStatus};
    use crate::annotations::AnnotationStatus::*;

    #[test]
    fn empty_set_has_no_tags() {
        assert_eq!(derive_label(&[]), FileLabel::NoTags);
    }

    #[test]
    fn any_pending_means_pending() {
        assert_eq!(derive_label_from_statuses([Confirmed, Pending]), FileLabel::Pending);
        assert_eq!(derive_label_from_statuses([Discarded, Pending]), FileLabel::Pending);
    }

    #[test]
    fn confirmed_without_pending_is_interactive() {
        assert_eq!(
            derive_label_from_statuses([Confirmed, Discarded]),
            FileLabel::Interactive
        );
    }

    #[test]
    fn only_discarded_has_no_tags() {
        assert_eq!(derive_label_from_statuses([Discarded, Discarded]), FileLabel::NoTags);
    }

    #[test]
    fn mixed_sources_derive_together() {
        let set = vec![
            event(1, EventStatus::Verified, Some(2)),
            api(2, ApiStatus::Rejected, 3),
        ];
        assert_eq!(derive_label(&set), FileLabel::Interactive);
    }

    #[test]
    fn patch_converges_from_any_label() {
        for start in [
            vec![],
            vec![PENDING_LABEL.external_id.to_string()],
            vec![INTERACTIVE_LABEL.external_id.to_string(), "other".to_string()],
        ] {
            for target in [FileLabel::NoTags, FileLabel::Pending, FileLabel::Interactive] {
                let mut labels = start.clone();
                let patch = LabelPatch::towards(1, target);
                patch.apply(&mut labels);
                patch.apply(&mut labels);
                assert_eq!(FileLabel::from_file_labels(&labels), target);
                let both = labels
                    .iter()
                    .filter(|l| {
                        *l == PENDING_LABEL.external_id || *l == INTERACTIVE_LABEL.external_id
                    })
                    .count();
                assert!(both <= 1);
            }
        }
    }

    #[tokio::test]
    async fn write_label_creates_definition_once() {
        let api = crate::memory::InMemoryApi::new();
        api.add_file(1, &[]);
        let ensured = EnsuredLabels::default();
        write_label(&api, &ensured, 1, FileLabel::Pending).await.unwrap();
        write_label(&api, &ensured, 1, FileLabel::Interactive).await.unwrap();
        assert!(api.has_label_definition(PENDING_LABEL.external_id));
        assert_eq!(
            api.labels_for(1),
            vec![INTERACTIVE_LABEL.external_id.to_string()]
        );
    }

    #[tokio::test]
    async fn concurrent_writers_ensure_definition_once() {
        let api = crate::memory::InMemoryApi::new();
        api.add_file(1, &[]);
        api.add_file(2, &[]);
        let ensured = EnsuredLabels::default();
        let (a, b) = tokio::join!(
            write_label(&api, &ensured, 1, FileLabel::Pending),
            write_label(&api, &ensured, 2, FileLabel::Pending),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(api.label_ensure_count(), 1);
        assert_eq!(api.labels_for(1), vec![PENDING_LABEL.external_id.to_string()]);
        assert_eq!(api.labels_for(2), vec![PENDING_LABEL.external_id.to_string()]);
    }

    #[test]
    fn no_tags_patch_needs_no_definition() {
        assert_eq!(LabelPatch::towards(1, FileLabel::NoTags).required_definition(), None);
        assert_eq!(
            LabelPatch::towards(1, FileLabel::Pending).required_definition(),
            Some(PENDING_LABEL)
        );
    }
}
