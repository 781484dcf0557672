//! Turn-scoped result bundle
//!
//! Append-only record of what each component returned during one turn,
//! plus the failures that left gaps. Nothing in here outlives the turn.

use crate::errors::{AppError, ErrorKind};
use crate::services::{Predictions, ProductImage, Row};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::intent::EntityReference;

/// Kind of data, in the order answers present it
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Structured,
    Model,
    Descriptive,
}

/// Producer of a bundle entry or failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Reasoning,
    StructuredQuery,
    EntityResolution,
    ModelPredictor,
    ReviewFetcher,
    ImageLocator,
    ImageDescriber,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Reasoning => "reasoning",
            Component::StructuredQuery => "structured_query",
            Component::EntityResolution => "entity_resolution",
            Component::ModelPredictor => "model_predictor",
            Component::ReviewFetcher => "review_fetcher",
            Component::ImageLocator => "image_locator",
            Component::ImageDescriber => "image_describer",
        }
    }

    pub fn data_kind(&self) -> DataKind {
        match self {
            Component::StructuredQuery | Component::EntityResolution => DataKind::Structured,
            Component::ModelPredictor => DataKind::Model,
            Component::Reasoning
            | Component::ReviewFetcher
            | Component::ImageLocator
            | Component::ImageDescriber => DataKind::Descriptive,
        }
    }

    /// Read-only calls that may be retried once
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Component::Reasoning
                | Component::StructuredQuery
                | Component::EntityResolution
                | Component::ModelPredictor
        )
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw output of one component call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComponentOutput {
    Rows {
        columns: Vec<String>,
        rows: Vec<Row>,
    },
    Assignments {
        model_id: String,
        /// Set when the model was asked for one cluster's members
        cluster_filter: Option<u32>,
        predictions: Predictions,
    },
    Reviews {
        reviews: Vec<String>,
    },
    ImageDescription {
        image: ProductImage,
        description: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BundleEntry {
    /// Position in the bundle, stable for the turn
    pub id: usize,
    pub component: Component,
    pub label: String,
    /// Entity the entry is about, when it is about one
    pub entity_id: Option<String>,
    pub output: ComponentOutput,
}

/// Step that produced nothing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepFailure {
    pub component: Component,
    pub label: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultBundle {
    entries: Vec<BundleEntry>,
    entities: Vec<EntityReference>,
    failures: Vec<StepFailure>,
}

impl ResultBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its id
    pub fn record(
        &mut self,
        component: Component,
        label: impl Into<String>,
        entity_id: Option<String>,
        output: ComponentOutput,
    ) -> usize {
        let id = self.entries.len();
        self.entries.push(BundleEntry {
            id,
            component,
            label: label.into(),
            entity_id,
            output,
        });
        id
    }

    /// Note a failed call; the step gets no entry
    pub fn record_failure(&mut self, component: Component, label: impl Into<String>, error: &AppError) {
        self.failures.push(StepFailure {
            component,
            label: label.into(),
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    /// Note a step that was never started because a prerequisite failed
    pub fn record_not_started(
        &mut self,
        component: Component,
        label: impl Into<String>,
        prerequisite: Component,
    ) {
        self.failures.push(StepFailure {
            component,
            label: label.into(),
            kind: ErrorKind::ExecutionFailed,
            message: format!("not started because {} failed", prerequisite),
        });
    }

    /// Remember an entity used by this turn, replacing an earlier state of it
    pub fn add_entity(&mut self, entity: EntityReference) {
        match self
            .entities
            .iter_mut()
            .find(|e| e.table == entity.table && e.raw == entity.raw)
        {
            Some(existing) => *existing = entity,
            None => self.entities.push(entity),
        }
    }

    pub fn entries(&self) -> &[BundleEntry] {
        &self.entries
    }

    pub fn entry(&self, id: usize) -> Option<&BundleEntry> {
        self.entries.get(id)
    }

    pub fn entities(&self) -> &[EntityReference] {
        &self.entities
    }

    pub fn failures(&self) -> &[StepFailure] {
        &self.failures
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Some step failed but others produced data
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_keep_insertion_ids() {
        let mut bundle = ResultBundle::new();
        let first = bundle.record(
            Component::ReviewFetcher,
            "reviews",
            Some("22720".into()),
            ComponentOutput::Reviews { reviews: vec!["Lovely tins".into()] },
        );
        let second = bundle.record(
            Component::StructuredQuery,
            "top products",
            None,
            ComponentOutput::Rows { columns: vec![], rows: vec![] },
        );

        assert_eq!((first, second), (0, 1));
        assert_eq!(bundle.entry(1).unwrap().component, Component::StructuredQuery);
        assert!(!bundle.is_partial());
    }

    #[test]
    fn test_failure_leaves_no_entry() {
        let mut bundle = ResultBundle::new();
        let err = AppError::Timeout {
            component: "model_predictor".into(),
            timeout_ms: 100,
        };
        bundle.record_failure(Component::ModelPredictor, "cluster 5 members", &err);
        bundle.record_not_started(Component::StructuredQuery, "top countries", Component::ModelPredictor);

        assert!(bundle.is_empty());
        assert!(bundle.is_partial());
        assert_eq!(bundle.failures()[0].kind, ErrorKind::ExecutionFailed);
        assert!(bundle.failures()[1].message.contains("model_predictor"));
    }

    #[test]
    fn test_kind_order() {
        assert!(DataKind::Structured < DataKind::Model);
        assert!(DataKind::Model < DataKind::Descriptive);
        assert_eq!(Component::EntityResolution.data_kind(), DataKind::Structured);
        assert!(!Component::ImageDescriber.is_idempotent());
    }

    #[test]
    fn test_entity_is_replaced_after_resolution() {
        let mut bundle = ResultBundle::new();
        let mut entity = EntityReference::text("products", "cake tins");
        bundle.add_entity(entity.clone());
        entity.mark_resolved("22720", None);
        bundle.add_entity(entity);

        assert_eq!(bundle.entities().len(), 1);
        assert_eq!(bundle.entities()[0].resolved_id(), Some("22720"));
    }
}
