//! Plans produced by the Planning state

use crate::catalog::SchemaCatalog;
use crate::errors::{AppError, Result};
use crate::services::Predictions;
use serde::{Deserialize, Serialize};

use super::bundle::Component;
use super::intent::{slots, Archetype, EntityReference, Intent, SlotValue};
use super::model_plan::{InvocationShape, ModelInvocationPlan};
use super::query_generator::DeferredQuery;
use super::query_plan::QueryPlan;

/// Model filter followed by a structured fetch constrained by its output
///
/// The structured step only exists as a template until `bind` receives the
/// model's predictions, so it cannot run first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrossFilterPlan {
    model_step: ModelInvocationPlan,
    structured_step: DeferredQuery,
}

impl CrossFilterPlan {
    pub fn new(model_step: ModelInvocationPlan, structured_step: DeferredQuery) -> Result<Self> {
        if !matches!(model_step.shape, InvocationShape::FilterByCluster { .. }) {
            return Err(AppError::Internal {
                message: "cross-filter needs a filter-by-cluster model step".to_string(),
            });
        }
        if structured_step.id_column().column != model_step.entity_key {
            return Err(AppError::SchemaMismatch {
                table: structured_step.id_column().table.clone(),
                column: model_step.entity_key.clone(),
            });
        }
        Ok(Self {
            model_step,
            structured_step,
        })
    }

    pub fn model_step(&self) -> &ModelInvocationPlan {
        &self.model_step
    }

    pub fn structured_step(&self) -> &DeferredQuery {
        &self.structured_step
    }

    /// Entity ids the model placed in the requested cluster, ascending
    pub fn member_ids(&self, predictions: &Predictions) -> Vec<String> {
        let cluster = self.model_step.cluster_id();
        predictions
            .iter()
            .filter(|(_, p)| Some(p.cluster_id) == cluster)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Second phase: the structured fetch restricted to the model's members
    pub fn bind(&self, predictions: &Predictions, catalog: &SchemaCatalog) -> Result<QueryPlan> {
        self.structured_step.bind(&self.member_ids(predictions), catalog)
    }
}

/// Entity whose images or reviews were requested
#[derive(Debug, Clone, PartialEq)]
pub struct FusionTarget {
    pub entity: EntityReference,
    pub want_image: bool,
    pub want_reviews: bool,
    /// Set when the lookup this target depends on failed
    pub blocked_by: Option<Component>,
}

impl FusionTarget {
    /// Target for intents that ask for images or reviews
    pub fn from_intent(intent: &Intent, catalog: &SchemaCatalog) -> Option<Self> {
        if !intent.wants_fusion() {
            return None;
        }

        let entity = match intent.entity() {
            Some(entity) => entity.clone(),
            None if intent.archetype == Archetype::LookupByAttribute => {
                let table = catalog.table(intent.text(slots::TABLE)?)?;
                let key_column = intent.text(slots::KEY_COLUMN)?;
                let key = match intent.slot(slots::KEY_VALUE)? {
                    SlotValue::Text(text) => text.clone(),
                    SlotValue::Integer(n) => n.to_string(),
                    _ => return None,
                };
                if key_column == table.primary_key {
                    EntityReference::canonical(&table.name, key)
                } else if table.display_column.as_deref() == Some(key_column) {
                    EntityReference::text(&table.name, key)
                } else {
                    return None;
                }
            }
            None => return None,
        };

        Some(Self {
            entity,
            want_image: intent.flag(slots::WANT_IMAGE).unwrap_or(false),
            want_reviews: intent.flag(slots::WANT_REVIEWS).unwrap_or(false),
            blocked_by: None,
        })
    }

    /// Fetch components this target asks for
    pub fn requested(&self) -> Vec<Component> {
        let mut components = Vec::with_capacity(2);
        if self.want_reviews {
            components.push(Component::ReviewFetcher);
        }
        if self.want_image {
            components.push(Component::ImageDescriber);
        }
        components
    }
}

/// First call of the Executing state
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedStep {
    Structured(QueryPlan),
    Model(ModelInvocationPlan),
    CrossFilter(CrossFilterPlan),
    /// Facts about the fusion entity; resolves it when given by name
    EntityLookup(QueryPlan),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnPlan {
    pub step: PlannedStep,
    pub fusion: Option<FusionTarget>,
}
