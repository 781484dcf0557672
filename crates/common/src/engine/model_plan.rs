//! Model-Invocation Generator
//!
//! Chooses between the two invocation shapes of the segmentation model and
//! refuses to guess when a question supports both.

use crate::catalog::SchemaCatalog;
use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};

use super::intent::{slots, Archetype, Intent};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum InvocationShape {
    /// Cluster of one known entity
    PredictForEntity { entity_id: String },
    /// Every entity assigned to one cluster
    FilterByCluster { cluster_id: u32 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputField {
    ClusterId,
    Confidence,
    Distance,
}

/// Request handed to the model predictor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInvocationPlan {
    pub model_id: String,
    pub entity_table: String,
    pub entity_key: String,
    /// Feature columns the predictor binds for each entity
    pub features: Vec<String>,
    pub shape: InvocationShape,
    pub outputs: Vec<OutputField>,
}

impl ModelInvocationPlan {
    pub fn entity_id(&self) -> Option<&str> {
        match &self.shape {
            InvocationShape::PredictForEntity { entity_id } => Some(entity_id),
            InvocationShape::FilterByCluster { .. } => None,
        }
    }

    pub fn cluster_id(&self) -> Option<u32> {
        match &self.shape {
            InvocationShape::FilterByCluster { cluster_id } => Some(*cluster_id),
            InvocationShape::PredictForEntity { .. } => None,
        }
    }
}

/// Generator for model invocations
#[derive(Debug, Clone, Default)]
pub struct ModelInvocationGenerator;

impl ModelInvocationGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self, intent: &Intent, catalog: &SchemaCatalog) -> Result<ModelInvocationPlan> {
        let model = catalog.model();

        let wants_entity = match intent.archetype {
            Archetype::ModelPredictLookup => intent.entity().is_some(),
            Archetype::CrossFilterByModelOutput => false,
            other => {
                return Err(AppError::Internal {
                    message: format!("{} has no model invocation", other),
                })
            }
        };
        let cluster = intent.integer(slots::CLUSTER_ID);

        let predict_for_entity = match (wants_entity, cluster, intent.text(slots::PRIMARY)) {
            (true, Some(c), None) => {
                let entity = intent.entity().map(|e| e.display_name()).unwrap_or_default();
                return Err(AppError::AmbiguousInvocation {
                    message: format!(
                        "the question names both {} {} and cluster {}; ask either which cluster \
                        the {} is in, or which {} are in cluster {}",
                        model.entity_key, entity, c, model.entity_key, model.entity_table, c
                    ),
                });
            }
            (true, Some(_), Some(primary)) => primary == slots::ENTITY,
            (true, None, _) => true,
            (false, Some(_), _) => false,
            (false, None, _) => {
                return Err(AppError::IntentUnresolved {
                    reason: format!("no {} id or cluster id to ask the model about", model.entity_key),
                })
            }
        };

        let (shape, outputs) = if predict_for_entity {
            let entity = intent.entity().ok_or_else(|| AppError::Internal {
                message: "entity slot vanished".to_string(),
            })?;
            if entity.table != model.entity_table {
                return Err(AppError::SchemaMismatch {
                    table: entity.table.clone(),
                    column: model.entity_key.clone(),
                });
            }
            let entity_id = entity.resolved_id().ok_or_else(|| AppError::IntentUnresolved {
                reason: format!("{} must be given as an id", model.entity_key),
            })?;
            (
                InvocationShape::PredictForEntity {
                    entity_id: entity_id.to_string(),
                },
                vec![OutputField::ClusterId, OutputField::Confidence],
            )
        } else {
            let requested = cluster.unwrap_or(-1);
            let cluster_id = u32::try_from(requested)
                .ok()
                .filter(|c| model.has_cluster(*c))
                .ok_or_else(|| {
                    let known: Vec<String> = model.label_domain.iter().map(u32::to_string).collect();
                    AppError::IntentUnresolved {
                        reason: format!(
                            "cluster {} does not exist; model '{}' has clusters {}",
                            requested,
                            model.model_id,
                            known.join(", ")
                        ),
                    }
                })?;
            (
                InvocationShape::FilterByCluster { cluster_id },
                vec![OutputField::ClusterId],
            )
        };

        Ok(ModelInvocationPlan {
            model_id: model.model_id.clone(),
            entity_table: model.entity_table.clone(),
            entity_key: model.entity_key.clone(),
            features: model.input_features.clone(),
            shape,
            outputs,
        })
    }
}
