//! Multimodal Fusion Resolver
//!
//! Splits a multimodal request into independent image and review fetches
//! attributed to one resolved entity. Ambiguous references stop here.

use crate::catalog::SchemaCatalog;
use crate::errors::{AppError, Result};
use crate::services::{cell_text, Row};
use serde::{Deserialize, Serialize};

use super::intent::{EntityCandidate, EntityKey, EntityReference, ResolutionStatus};

/// One independent fetch for the entity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "fetch", rename_all = "snake_case")]
pub enum FusionFetch {
    Reviews { entity_id: String },
    ImageDescription { entity_id: String, product_name: String },
}

impl FusionFetch {
    pub fn entity_id(&self) -> &str {
        match self {
            FusionFetch::Reviews { entity_id } | FusionFetch::ImageDescription { entity_id, .. } => {
                entity_id
            }
        }
    }
}

/// Fetches that all belong to one entity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FusionRequest {
    pub entity: EntityReference,
    pub fetches: Vec<FusionFetch>,
}

#[derive(Debug, Clone, Default)]
pub struct FusionResolver;

impl FusionResolver {
    pub fn new() -> Self {
        Self
    }

    /// Build the fetch list for a resolved entity
    pub fn resolve(
        &self,
        entity: &EntityReference,
        want_image: bool,
        want_reviews: bool,
    ) -> Result<FusionRequest> {
        let entity_id = match &entity.status {
            ResolutionStatus::ResolvedToId { id } => id.clone(),
            ResolutionStatus::Ambiguous { candidates } => {
                return Err(AppError::AmbiguousEntity {
                    reference: entity.display_name(),
                    candidates: candidates.iter().map(ToString::to_string).collect(),
                })
            }
            ResolutionStatus::Unresolved => {
                return Err(AppError::Internal {
                    message: format!("{} reached fusion without a resolution step", entity.raw),
                })
            }
        };

        if !want_image && !want_reviews {
            return Err(AppError::IntentUnresolved {
                reason: format!("nothing was asked about {}", entity.display_name()),
            });
        }

        let mut fetches = Vec::with_capacity(2);
        if want_reviews {
            fetches.push(FusionFetch::Reviews {
                entity_id: entity_id.clone(),
            });
        }
        if want_image {
            fetches.push(FusionFetch::ImageDescription {
                entity_id,
                product_name: entity.display_name(),
            });
        }

        Ok(FusionRequest {
            entity: entity.clone(),
            fetches,
        })
    }

    /// Apply the rows of an entity lookup to the reference
    ///
    /// A single row, or a single exact name match, resolves the reference.
    /// Several rows mark it ambiguous; none is `EntityNotFound`.
    pub fn apply_resolution(
        &self,
        entity: &mut EntityReference,
        rows: &[Row],
        catalog: &SchemaCatalog,
    ) -> Result<()> {
        let table = catalog.require_table(&entity.table)?;
        let id_of = |row: &Row| row.get(&table.primary_key).map(cell_text);
        let label_of = |row: &Row| {
            table
                .display_column
                .as_ref()
                .and_then(|column| row.get(column))
                .map(cell_text)
        };

        if rows.is_empty() {
            return Err(AppError::EntityNotFound {
                reference: entity.display_name(),
            });
        }

        if let Some(id) = entity.resolved_id().map(str::to_string) {
            let label = rows
                .iter()
                .find(|row| id_of(*row).as_deref() == Some(id.as_str()))
                .and_then(label_of);
            entity.mark_resolved(id, label);
            return Ok(());
        }

        let wanted = match &entity.raw {
            EntityKey::Text(text) => text.trim().to_lowercase(),
            other => other.to_string(),
        };
        let exact: Vec<&Row> = rows
            .iter()
            .filter(|row| label_of(*row).map(|l| l.trim().to_lowercase()) == Some(wanted.clone()))
            .collect();

        let chosen = match (exact.as_slice(), rows) {
            ([only], _) => Some(*only),
            ([], [only]) => Some(only),
            _ => None,
        };

        match chosen {
            Some(row) => {
                let id = id_of(row).ok_or_else(|| AppError::execution(
                    "entity_resolution",
                    format!("row has no {}", table.primary_key),
                ))?;
                entity.mark_resolved(id, label_of(row));
            }
            None => {
                let pool: Vec<&Row> = if exact.len() > 1 { exact } else { rows.iter().collect() };
                let candidates = pool
                    .into_iter()
                    .filter_map(|row| {
                        Some(EntityCandidate {
                            id: id_of(row)?,
                            label: label_of(row).unwrap_or_default(),
                        })
                    })
                    .collect();
                entity.mark_ambiguous(candidates);
            }
        }
        Ok(())
    }
}
