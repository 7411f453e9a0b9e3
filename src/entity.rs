//! Conversion of candidate resources into detection entities.
//!
//! The detection service matches text in a diagram against one string per
//! entity. Which attribute supplies that string is configurable per resource
//! type: a top-level attribute (`name`, `externalId`, `description`) or a
//! metadata key written as `metadata.<key>`. Missing values become `""`.

use crate::models::{Entity, Resource, ResourceType};

/// Where an entity's match value is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchField {
    Name,
    ExternalId,
    Description,
    Metadata(String),
}

impl MatchField {
    pub fn parse(field: &str) -> Self {
        if let Some(key) = field.strip_prefix("metadata.") {
            return MatchField::Metadata(key.to_string());
        }
        match field {
            "externalId" | "external_id" => MatchField::ExternalId,
            "description" => MatchField::Description,
            _ => MatchField::Name,
        }
    }

    fn read(&self, resource: &Resource) -> String {
        match self {
            MatchField::Name => resource.name.clone(),
            MatchField::ExternalId => resource.external_id.clone().unwrap_or_default(),
            MatchField::Description => resource.description.clone().unwrap_or_default(),
            MatchField::Metadata(key) => resource.metadata.get(key).cloned().unwrap_or_default(),
        }
    }
}

fn map_resources(resources: &[Resource], kind: ResourceType, field: &MatchField) -> Vec<Entity> {
    resources
        .iter()
        .filter(|r| r.resource_type == kind)
        .map(|r| Entity {
            resource_type: kind,
            id: r.id,
            external_id: r.external_id.clone(),
            match_value: field.read(r),
        })
        .collect()
}

pub fn map_assets_to_entities(resources: &[Resource], field: &str) -> Vec<Entity> {
    map_resources(resources, ResourceType::Asset, &MatchField::parse(field))
}

pub fn map_files_to_entities(resources: &[Resource], field: &str) -> Vec<Entity> {
    map_resources(resources, ResourceType::File, &MatchField::parse(field))
}

/// Map a mixed resource selection, assets first, with per-type match fields.
pub fn map_entities(resources: &[Resource], asset_field: &str, file_field: &str) -> Vec<Entity> {
    let mut entities = map_assets_to_entities(resources, asset_field);
    entities.extend(map_files_to_entities(resources, file_field));
    entities
}
