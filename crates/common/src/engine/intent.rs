//! Intent, slot and entity-reference types
//!
//! An `Intent` is one archetype plus its extracted slots. Construction goes
//! through `Intent::new`, which refuses to build an intent whose required
//! slots are not all filled.

use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Slot names shared by the classifier and the generators
pub mod slots {
    pub const TABLE: &str = "table";
    pub const KEY_COLUMN: &str = "key_column";
    pub const KEY_VALUE: &str = "key_value";
    pub const ATTRIBUTE: &str = "attribute";
    pub const SORT_KEY: &str = "sort_key";
    pub const GROUP_BY: &str = "group_by";
    pub const LIMIT: &str = "limit";
    pub const ENTITY: &str = "entity";
    pub const CLUSTER_ID: &str = "cluster_id";
    pub const PRIMARY: &str = "primary";
    pub const WANT_IMAGE: &str = "want_image";
    pub const WANT_REVIEWS: &str = "want_reviews";
}

/// Closed set of supported question shapes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    LookupByAttribute,
    AggregateTopN,
    ModelPredictLookup,
    CrossFilterByModelOutput,
    MultimodalEntityReport,
}

impl Archetype {
    pub const ALL: [Archetype; 5] = [
        Archetype::LookupByAttribute,
        Archetype::AggregateTopN,
        Archetype::ModelPredictLookup,
        Archetype::CrossFilterByModelOutput,
        Archetype::MultimodalEntityReport,
    ];

    /// Slots that must be filled for the intent to exist
    pub fn required_slots(&self) -> &'static [&'static str] {
        match self {
            Archetype::LookupByAttribute => &[slots::TABLE, slots::KEY_COLUMN, slots::KEY_VALUE],
            Archetype::AggregateTopN => &[slots::TABLE, slots::SORT_KEY],
            Archetype::ModelPredictLookup => &[slots::ENTITY],
            Archetype::CrossFilterByModelOutput => &[slots::CLUSTER_ID, slots::GROUP_BY],
            Archetype::MultimodalEntityReport => &[slots::ENTITY],
        }
    }

    /// Rank used when candidates tie on unresolved slots (lower wins)
    pub fn tie_break_rank(&self) -> u8 {
        match self {
            Archetype::MultimodalEntityReport => 0,
            Archetype::CrossFilterByModelOutput => 1,
            Archetype::ModelPredictLookup => 2,
            Archetype::AggregateTopN => 3,
            Archetype::LookupByAttribute => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Archetype::LookupByAttribute => "lookup_by_attribute",
            Archetype::AggregateTopN => "aggregate_top_n",
            Archetype::ModelPredictLookup => "model_predict_lookup",
            Archetype::CrossFilterByModelOutput => "cross_filter_by_model_output",
            Archetype::MultimodalEntityReport => "multimodal_entity_report",
        }
    }
}

impl fmt::Display for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw form of an entity reference as it appeared in the question
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EntityKey {
    /// Free text such as a product name
    Text(String),
    /// Numeric identifier such as a customer id
    Numeric(i64),
    /// Canonical identifier such as a stock code
    Canonical(String),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Text(text) => write!(f, "'{}'", text),
            EntityKey::Numeric(id) => write!(f, "{}", id),
            EntityKey::Canonical(id) => f.write_str(id),
        }
    }
}

/// Candidate offered when a reference is ambiguous
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityCandidate {
    pub id: String,
    pub label: String,
}

impl fmt::Display for EntityCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.id)
    }
}

/// Resolution status of an entity reference
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolutionStatus {
    Unresolved,
    ResolvedToId { id: String },
    Ambiguous { candidates: Vec<EntityCandidate> },
}

/// Loosely typed identifier plus its resolution status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityReference {
    /// Catalog table the entity lives in
    pub table: String,

    pub raw: EntityKey,

    pub status: ResolutionStatus,

    /// Display label learned during resolution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl EntityReference {
    /// Reference by free text; needs a resolution step
    pub fn text(table: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            raw: EntityKey::Text(text.into()),
            status: ResolutionStatus::Unresolved,
            label: None,
        }
    }

    /// Reference by numeric id; the id is already canonical
    pub fn numeric(table: impl Into<String>, id: i64) -> Self {
        Self {
            table: table.into(),
            raw: EntityKey::Numeric(id),
            status: ResolutionStatus::ResolvedToId { id: id.to_string() },
            label: None,
        }
    }

    /// Reference by canonical identifier
    pub fn canonical(table: impl Into<String>, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            table: table.into(),
            raw: EntityKey::Canonical(id.clone()),
            status: ResolutionStatus::ResolvedToId { id },
            label: None,
        }
    }

    pub fn resolved_id(&self) -> Option<&str> {
        match &self.status {
            ResolutionStatus::ResolvedToId { id } => Some(id),
            _ => None,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self.status, ResolutionStatus::Unresolved)
    }

    /// Name to show the user
    pub fn display_name(&self) -> String {
        match (&self.label, &self.raw) {
            (Some(label), _) => label.clone(),
            (None, EntityKey::Text(text)) => text.clone(),
            (None, raw) => raw.to_string(),
        }
    }

    pub(crate) fn mark_resolved(&mut self, id: impl Into<String>, label: Option<String>) {
        self.status = ResolutionStatus::ResolvedToId { id: id.into() };
        if label.is_some() {
            self.label = label;
        }
    }

    pub(crate) fn mark_ambiguous(&mut self, candidates: Vec<EntityCandidate>) {
        self.status = ResolutionStatus::Ambiguous { candidates };
    }
}

/// Sort request carried in a slot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SortSpec {
    /// Column name, or `count` for grouped rankings
    pub column: String,
    pub descending: bool,
}

/// Name of the virtual column produced by grouped counts
pub const COUNT_COLUMN: &str = "count";

/// Extracted slot value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SlotValue {
    Text(String),
    Integer(i64),
    Flag(bool),
    Sort(SortSpec),
    Entity(EntityReference),
}

impl SlotValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SlotValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SlotValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            SlotValue::Flag(flag) => Some(*flag),
            _ => None,
        }
    }

    pub fn as_sort(&self) -> Option<&SortSpec> {
        match self {
            SlotValue::Sort(sort) => Some(sort),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityReference> {
        match self {
            SlotValue::Entity(entity) => Some(entity),
            _ => None,
        }
    }
}

/// A classified question
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Intent {
    pub archetype: Archetype,
    slots: BTreeMap<String, SlotValue>,
    pub source_text: String,
}

impl Intent {
    /// Build an intent, failing with `IntentUnresolved` when a required slot is missing
    pub fn new(
        archetype: Archetype,
        slots: BTreeMap<String, SlotValue>,
        source_text: impl Into<String>,
    ) -> Result<Self> {
        let missing = missing_slots(archetype, &slots);
        if !missing.is_empty() {
            return Err(AppError::IntentUnresolved {
                reason: format!("{} is missing {}", archetype, missing.join(", ")),
            });
        }
        Ok(Self {
            archetype,
            slots,
            source_text: source_text.into(),
        })
    }

    pub fn slot(&self, name: &str) -> Option<&SlotValue> {
        self.slots.get(name)
    }

    pub fn slots(&self) -> &BTreeMap<String, SlotValue> {
        &self.slots
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.slot(name).and_then(SlotValue::as_text)
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        self.slot(name).and_then(SlotValue::as_integer)
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.slot(name).and_then(SlotValue::as_flag)
    }

    pub fn entity(&self) -> Option<&EntityReference> {
        self.slot(slots::ENTITY).and_then(SlotValue::as_entity)
    }

    /// Whether the question asks for images or reviews
    pub fn wants_fusion(&self) -> bool {
        self.archetype == Archetype::MultimodalEntityReport
            || self.flag(slots::WANT_IMAGE).unwrap_or(false)
            || self.flag(slots::WANT_REVIEWS).unwrap_or(false)
    }
}

/// Required slots of `archetype` absent from `slots`
pub fn missing_slots(archetype: Archetype, slots: &BTreeMap<String, SlotValue>) -> Vec<&'static str> {
    archetype
        .required_slots()
        .iter()
        .copied()
        .filter(|name| !slots.contains_key(*name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intent_requires_all_slots() {
        let mut filled = BTreeMap::new();
        filled.insert(slots::TABLE.to_string(), SlotValue::Text("products".into()));

        let err = Intent::new(Archetype::AggregateTopN, filled.clone(), "top products").unwrap_err();
        assert!(matches!(err, AppError::IntentUnresolved { .. }));
        assert!(err.to_string().contains("sort_key"));

        filled.insert(
            slots::SORT_KEY.to_string(),
            SlotValue::Sort(SortSpec {
                column: "unit_price".into(),
                descending: true,
            }),
        );
        let intent = Intent::new(Archetype::AggregateTopN, filled, "top products").unwrap();
        assert_eq!(intent.text(slots::TABLE), Some("products"));
    }

    #[test]
    fn test_numeric_reference_is_resolved() {
        let entity = EntityReference::numeric("customers", 17490);
        assert_eq!(entity.resolved_id(), Some("17490"));
        assert!(!entity.is_unresolved());
    }

    #[test]
    fn test_text_reference_resolution() {
        let mut entity = EntityReference::text("products", "regency cake tins");
        assert!(entity.is_unresolved());
        assert_eq!(entity.display_name(), "regency cake tins");

        entity.mark_resolved("22720", Some("SET OF 3 REGENCY CAKE TINS".into()));
        assert_eq!(entity.resolved_id(), Some("22720"));
        assert_eq!(entity.display_name(), "SET OF 3 REGENCY CAKE TINS");
    }

    #[test]
    fn test_tie_break_prefers_multimodal() {
        let mut ranked = Archetype::ALL.to_vec();
        ranked.sort_by_key(|a| a.tie_break_rank());
        assert_eq!(ranked[0], Archetype::MultimodalEntityReport);
        assert_eq!(ranked[4], Archetype::LookupByAttribute);
    }
}
