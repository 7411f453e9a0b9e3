//! Dual-source annotation model.
//!
//! Diagrams may carry annotations from two overlapping stores: legacy
//! annotations kept as events ([`EventAnnotation`]) and annotations from the
//! current annotations API ([`ApiAnnotation`]). Both use their own status
//! vocabulary. [`TaggedAnnotation`] wraps either one behind an explicit
//! discriminator and every piece of business logic reads it through
//! [`TaggedAnnotation::status`], which normalizes into [`AnnotationStatus`].
//! The raw variants are only inspected at the persistence boundary.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::models::{BoundingBox, FileId, ResourceType};

/// Semantic status shared by both annotation sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationStatus {
    Pending,
    Confirmed,
    Discarded,
}

// ============ Legacy (event) annotations ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Unhandled,
    Verified,
    Deleted,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Unhandled => "unhandled",
            EventStatus::Verified => "verified",
            EventStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unhandled" => Some(EventStatus::Unhandled),
            "verified" => Some(EventStatus::Verified),
            "deleted" => Some(EventStatus::Deleted),
            _ => None,
        }
    }

    pub fn from_semantic(status: AnnotationStatus) -> Self {
        match status {
            AnnotationStatus::Pending => EventStatus::Unhandled,
            AnnotationStatus::Confirmed => EventStatus::Verified,
            AnnotationStatus::Discarded => EventStatus::Deleted,
        }
    }
}

/// Metadata keys under which legacy annotations are stored on events.
pub mod event_keys {
    pub const EVENT_TYPE: &str = "cognite_annotation";
    pub const FILE_ID: &str = "CDF_ANNOTATION_file_id";
    pub const STATUS: &str = "CDF_ANNOTATION_status";
    pub const RESOURCE_TYPE: &str = "CDF_ANNOTATION_resource_type";
    pub const RESOURCE_ID: &str = "CDF_ANNOTATION_resource_id";
    pub const RESOURCE_EXTERNAL_ID: &str = "CDF_ANNOTATION_resource_external_id";
    pub const BOX: &str = "CDF_ANNOTATION_box";
    pub const PAGE: &str = "CDF_ANNOTATION_page";
    pub const LABEL: &str = "CDF_ANNOTATION_label";
    pub const CHECKED_BY: &str = "CDF_ANNOTATION_checked_by";
}

/// Raw event record as returned by the event store.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub id: u64,
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAnnotation {
    pub id: u64,
    pub file_id: FileId,
    pub status: EventStatus,
    pub resource_type: Option<ResourceType>,
    pub resource_id: Option<u64>,
    pub resource_external_id: Option<String>,
    pub label: String,
    #[serde(rename = "box")]
    pub bounding_box: BoundingBox,
    pub page: u32,
}

impl EventAnnotation {
    /// Decode an annotation event. Events that are not annotations, or whose
    /// status is unknown, are rejected.
    pub fn from_event(event: &RawEvent) -> Result<Self, ApiError> {
        use event_keys::*;

        if event.event_type.as_deref() != Some(EVENT_TYPE) {
            return Err(ApiError::Decode(format!(
                "event {} is not an annotation",
                event.id
            )));
        }
        let meta = &event.metadata;
        let file_id = meta
            .get(FILE_ID)
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| ApiError::Decode(format!("event {} has no file id", event.id)))?;
        let status = meta
            .get(STATUS)
            .and_then(|s| EventStatus::parse(s))
            .ok_or_else(|| ApiError::Decode(format!("event {} has no valid status", event.id)))?;
        let resource_type = match meta.get(RESOURCE_TYPE).map(String::as_str) {
            Some("asset") => Some(ResourceType::Asset),
            Some("file") => Some(ResourceType::File),
            _ => None,
        };
        let bounding_box = meta
            .get(BOX)
            .and_then(|b| serde_json::from_str::<BoundingBox>(b).ok())
            .unwrap_or_default();

        Ok(Self {
            id: event.id,
            file_id,
            status,
            resource_type,
            resource_id: meta.get(RESOURCE_ID).and_then(|v| v.parse().ok()),
            resource_external_id: meta.get(RESOURCE_EXTERNAL_ID).cloned(),
            label: meta
                .get(LABEL)
                .cloned()
                .or_else(|| event.description.clone())
                .unwrap_or_default(),
            bounding_box,
            page: meta.get(PAGE).and_then(|p| p.parse().ok()).unwrap_or(1),
        })
    }

    pub fn to_event(&self) -> RawEvent {
        use event_keys::*;

        let mut metadata = HashMap::new();
        metadata.insert(FILE_ID.to_string(), self.file_id.to_string());
        metadata.insert(STATUS.to_string(), self.status.as_str().to_string());
        if let Some(rt) = self.resource_type {
            metadata.insert(RESOURCE_TYPE.to_string(), rt.as_str().to_string());
        }
        if let Some(id) = self.resource_id {
            metadata.insert(RESOURCE_ID.to_string(), id.to_string());
        }
        if let Some(ext) = &self.resource_external_id {
            metadata.insert(RESOURCE_EXTERNAL_ID.to_string(), ext.clone());
        }
        metadata.insert(
            BOX.to_string(),
            serde_json::to_string(&self.bounding_box).unwrap_or_default(),
        );
        metadata.insert(PAGE.to_string(), self.page.to_string());
        metadata.insert(LABEL.to_string(), self.label.clone());
        RawEvent {
            id: self.id,
            event_type: Some(EVENT_TYPE.to_string()),
            description: Some(self.label.clone()),
            metadata,
        }
    }
}

// ============ Annotations API ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
    Suggested,
    Approved,
    Rejected,
}

impl ApiStatus {
    pub fn from_semantic(status: AnnotationStatus) -> Self {
        match status {
            AnnotationStatus::Pending => ApiStatus::Suggested,
            AnnotationStatus::Confirmed => ApiStatus::Approved,
            AnnotationStatus::Discarded => ApiStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiAnnotationType {
    #[serde(rename = "diagrams.AssetLink")]
    AssetLink,
    #[serde(rename = "diagrams.FileLink")]
    FileLink,
    #[serde(rename = "diagrams.UnhandledTextObject")]
    UnhandledTextObject,
}

/// Reference to a linked asset or file, by id and/or external id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

impl ResourceRef {
    pub fn is_set(&self) -> bool {
        self.id.is_some() || self.external_id.is_some()
    }

    /// Two refs match when they share an id, or (lacking ids) an external id.
    pub fn matches(&self, other: &ResourceRef) -> bool {
        match (self.id, other.id) {
            (Some(a), Some(b)) => a == b,
            _ => match (&self.external_id, &other.external_id) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAnnotationData {
    #[serde(default)]
    pub text: String,
    pub text_region: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_ref: Option<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_ref: Option<ResourceRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiAnnotation {
    pub id: u64,
    pub annotated_resource_id: FileId,
    pub annotation_type: ApiAnnotationType,
    pub status: ApiStatus,
    #[serde(default)]
    pub creating_app: String,
    pub data: ApiAnnotationData,
}

/// A new annotation to persist through the annotations API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationCreate {
    pub annotation_type: ApiAnnotationType,
    pub annotated_resource_type: &'static str,
    pub annotated_resource_id: FileId,
    pub status: ApiStatus,
    pub creating_app: String,
    pub creating_app_version: String,
    pub creating_user: Option<String>,
    pub data: ApiAnnotationData,
}

impl AnnotationCreate {
    pub fn resource_type(&self) -> Option<ResourceType> {
        match self.annotation_type {
            ApiAnnotationType::AssetLink => Some(ResourceType::Asset),
            ApiAnnotationType::FileLink => Some(ResourceType::File),
            ApiAnnotationType::UnhandledTextObject => None,
        }
    }
}

// ============ Tagged union ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "annotation", rename_all = "lowercase")]
pub enum TaggedAnnotation {
    Events(EventAnnotation),
    Annotations(ApiAnnotation),
}

impl TaggedAnnotation {
    pub fn id(&self) -> u64 {
        match self {
            TaggedAnnotation::Events(a) => a.id,
            TaggedAnnotation::Annotations(a) => a.id,
        }
    }

    pub fn status(&self) -> AnnotationStatus {
        match self {
            TaggedAnnotation::Events(a) => match a.status {
                EventStatus::Unhandled => AnnotationStatus::Pending,
                EventStatus::Verified => AnnotationStatus::Confirmed,
                EventStatus::Deleted => AnnotationStatus::Discarded,
            },
            TaggedAnnotation::Annotations(a) => match a.status {
                ApiStatus::Suggested => AnnotationStatus::Pending,
                ApiStatus::Approved => AnnotationStatus::Confirmed,
                ApiStatus::Rejected => AnnotationStatus::Discarded,
            },
        }
    }

    /// Rewrite the status in the source's own vocabulary.
    pub fn set_status(&mut self, status: AnnotationStatus) {
        match self {
            TaggedAnnotation::Events(a) => a.status = EventStatus::from_semantic(status),
            TaggedAnnotation::Annotations(a) => a.status = ApiStatus::from_semantic(status),
        }
    }

    pub fn resource_type(&self) -> Option<ResourceType> {
        match self {
            TaggedAnnotation::Events(a) => a.resource_type,
            TaggedAnnotation::Annotations(a) => match a.annotation_type {
                ApiAnnotationType::AssetLink => Some(ResourceType::Asset),
                ApiAnnotationType::FileLink => Some(ResourceType::File),
                ApiAnnotationType::UnhandledTextObject => None,
            },
        }
    }

    pub fn resource_ref(&self) -> Option<ResourceRef> {
        match self {
            TaggedAnnotation::Events(a) => {
                let r = ResourceRef {
                    id: a.resource_id,
                    external_id: a.resource_external_id.clone(),
                };
                r.is_set().then_some(r)
            }
            TaggedAnnotation::Annotations(a) => match a.annotation_type {
                ApiAnnotationType::AssetLink => a.data.asset_ref.clone(),
                ApiAnnotationType::FileLink => a.data.file_ref.clone(),
                ApiAnnotationType::UnhandledTextObject => None,
            },
        }
    }

    pub fn bounding_box(&self) -> BoundingBox {
        match self {
            TaggedAnnotation::Events(a) => a.bounding_box,
            TaggedAnnotation::Annotations(a) => a.data.text_region,
        }
    }

    pub fn page(&self) -> u32 {
        match self {
            TaggedAnnotation::Events(a) => a.page,
            TaggedAnnotation::Annotations(a) => a.data.page_number.unwrap_or(1),
        }
    }

    /// Whether this annotation already covers the same link at the same place.
    pub fn covers(
        &self,
        resource_type: ResourceType,
        target: &ResourceRef,
        region: &BoundingBox,
        page: u32,
    ) -> bool {
        self.status() != AnnotationStatus::Discarded
            && self.resource_type() == Some(resource_type)
            && self.resource_ref().is_some_and(|r| r.matches(target))
            && self.page() == page
            && self.bounding_box().approx_eq(region)
    }
}

/// Link tallies over a set of annotations, as `(file_links, asset_links)`.
pub fn count_links(annotations: &[TaggedAnnotation]) -> (usize, usize) {
    annotations
        .iter()
        .fold((0, 0), |(files, assets), a| match a.resource_type() {
            Some(ResourceType::File) => (files + 1, assets),
            Some(ResourceType::Asset) => (files, assets + 1),
            None => (files, assets),
        })
}
