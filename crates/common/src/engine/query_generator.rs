//! Structured-Query Generator
//!
//! Turns tabular intents into validated `QueryPlan`s. Every plan leaves
//! here checked against the catalog, ordered deterministically and with a
//! clamped row limit.

use crate::catalog::{SchemaCatalog, SemanticType, TableDef};
use crate::config::OrchestratorConfig;
use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::intent::{slots, Archetype, EntityKey, EntityReference, Intent, SlotValue, COUNT_COLUMN};
use super::query_plan::{
    Aggregation, ColumnRef, JoinKey, Operator, Predicate, QueryPlan, SortKey, SortTarget,
};

/// Rows fetched when resolving an entity by name
pub const RESOLUTION_CANDIDATE_LIMIT: usize = 5;

/// Structured half of a cross-filter, waiting for the model's entity ids
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeferredQuery {
    template: QueryPlan,
    id_column: ColumnRef,
    numeric_ids: bool,
}

impl DeferredQuery {
    pub fn template(&self) -> &QueryPlan {
        &self.template
    }

    pub fn id_column(&self) -> &ColumnRef {
        &self.id_column
    }

    /// Constrain the template to `ids` and validate the result
    pub fn bind(&self, ids: &[String], catalog: &SchemaCatalog) -> Result<QueryPlan> {
        let values = ids
            .iter()
            .map(|id| {
                if self.numeric_ids {
                    id.parse::<i64>().map(Value::from).map_err(|_| AppError::Validation {
                        message: format!("model returned non-numeric id '{}' for {}", id, self.id_column),
                        field: Some(self.id_column.column.clone()),
                    })
                } else {
                    Ok(Value::String(id.clone()))
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let mut plan = self.template.clone();
        plan.filters
            .push(Predicate::new(self.id_column.clone(), Operator::In, Value::Array(values)));
        plan.validate(catalog)?;
        Ok(plan)
    }
}

/// Generator for structured fetches
#[derive(Debug, Clone)]
pub struct StructuredQueryGenerator {
    default_limit: usize,
    max_limit: usize,
}

impl StructuredQueryGenerator {
    pub fn new(default_limit: usize, max_limit: usize) -> Self {
        let max_limit = max_limit.max(1);
        Self {
            default_limit: default_limit.clamp(1, max_limit),
            max_limit,
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.default_row_limit, config.max_row_limit)
    }

    /// Requested limit, or the default, clamped to `1..=max`
    pub fn clamp_limit(&self, requested: Option<i64>) -> usize {
        match requested {
            Some(n) if n < 1 => 1,
            Some(n) => usize::try_from(n).unwrap_or(usize::MAX).min(self.max_limit),
            None => self.default_limit,
        }
    }

    /// Build the plan for a lookup, a top-n, or the template of a cross-filter
    pub fn generate(&self, intent: &Intent, catalog: &SchemaCatalog) -> Result<QueryPlan> {
        let plan = match intent.archetype {
            Archetype::LookupByAttribute => self.lookup(intent, catalog)?,
            Archetype::AggregateTopN => self.top_n(intent, catalog)?,
            Archetype::CrossFilterByModelOutput => self.grouped_template(intent, catalog)?,
            other => {
                return Err(AppError::Internal {
                    message: format!("{} has no structured plan", other),
                })
            }
        };
        plan.validate(catalog)?;
        Ok(plan)
    }

    /// Structured half of a cross-filter, bound later to the model's output
    pub fn generate_deferred(&self, intent: &Intent, catalog: &SchemaCatalog) -> Result<DeferredQuery> {
        let template = self.generate(intent, catalog)?;
        let model = catalog.model();
        let table = template.base_table().to_string();
        let key = catalog.require_column(&table, &model.entity_key)?;

        Ok(DeferredQuery {
            id_column: ColumnRef::new(table, &model.entity_key),
            numeric_ids: key.semantic_type.is_numeric(),
            template,
        })
    }

    /// Fetch an entity's row by id, or its candidates by display name
    pub fn entity_plan(&self, entity: &EntityReference, catalog: &SchemaCatalog) -> Result<QueryPlan> {
        self.entity_plan_with(entity, catalog, Operator::EqIgnoreCase)
    }

    /// Substring search over the display column, tried after an exact name finds nothing
    pub fn entity_fallback_plan(
        &self,
        entity: &EntityReference,
        catalog: &SchemaCatalog,
    ) -> Result<Option<QueryPlan>> {
        match (entity.resolved_id(), &entity.raw) {
            (None, EntityKey::Text(_)) => self
                .entity_plan_with(entity, catalog, Operator::Contains)
                .map(Some),
            _ => Ok(None),
        }
    }

    fn entity_plan_with(
        &self,
        entity: &EntityReference,
        catalog: &SchemaCatalog,
        name_op: Operator,
    ) -> Result<QueryPlan> {
        let table = catalog.require_table(&entity.table)?;
        let pk = ColumnRef::new(&table.name, &table.primary_key);

        let (filter, limit) = match (entity.resolved_id(), &entity.raw) {
            (Some(id), _) => (
                Predicate::new(pk.clone(), Operator::Eq, literal(catalog, &pk, id)?),
                1,
            ),
            (None, EntityKey::Text(name)) => {
                let display = table.display_column.as_ref().ok_or_else(|| AppError::Validation {
                    message: format!("{} cannot be looked up by name", table.name),
                    field: None,
                })?;
                (
                    Predicate::new(
                        ColumnRef::new(&table.name, display),
                        name_op,
                        name.trim(),
                    ),
                    RESOLUTION_CANDIDATE_LIMIT,
                )
            }
            (None, raw) => (
                Predicate::new(pk.clone(), Operator::Eq, literal(catalog, &pk, &raw.to_string())?),
                1,
            ),
        };

        let mut plan = QueryPlan::select(&table.name, all_columns(table), limit);
        plan.filters.push(filter);
        plan.order_by.push(SortKey::asc(SortTarget::Column(pk)));
        plan.validate(catalog)?;
        Ok(plan)
    }

    fn lookup(&self, intent: &Intent, catalog: &SchemaCatalog) -> Result<QueryPlan> {
        let table = require_table_slot(intent, catalog)?;
        let key_column = required_text(intent, slots::KEY_COLUMN)?;
        let key = catalog.require_column(&table.name, key_column)?;
        let key_ref = ColumnRef::new(&table.name, key_column);

        let filter = match intent.slot(slots::KEY_VALUE) {
            Some(SlotValue::Integer(n)) => Predicate::new(key_ref, Operator::Eq, *n),
            Some(SlotValue::Text(text)) if key.semantic_type == SemanticType::Text => {
                Predicate::new(key_ref, Operator::Contains, text.trim())
            }
            Some(SlotValue::Text(text)) => {
                let value = literal(catalog, &key_ref, text)?;
                Predicate::new(key_ref, Operator::Eq, value)
            }
            _ => {
                return Err(AppError::IntentUnresolved {
                    reason: "lookup has no usable key value".to_string(),
                })
            }
        };

        let pk = ColumnRef::new(&table.name, &table.primary_key);
        let projection = match intent.text(slots::ATTRIBUTE) {
            Some(attribute) => {
                catalog.require_column(&table.name, attribute)?;
                let mut columns = vec![pk.clone()];
                if let Some(display) = &table.display_column {
                    columns.push(ColumnRef::new(&table.name, display));
                }
                let wanted = ColumnRef::new(&table.name, attribute);
                if !columns.contains(&wanted) {
                    columns.push(wanted);
                }
                columns
            }
            None => all_columns(table),
        };

        let mut plan = QueryPlan::select(&table.name, projection, self.clamp_limit(intent.integer(slots::LIMIT)));
        plan.filters.push(filter);
        plan.order_by.push(SortKey::asc(SortTarget::Column(pk)));
        Ok(plan)
    }

    fn top_n(&self, intent: &Intent, catalog: &SchemaCatalog) -> Result<QueryPlan> {
        if intent.text(slots::GROUP_BY).is_some() {
            return self.grouped_template(intent, catalog);
        }

        let table = require_table_slot(intent, catalog)?;
        let sort = intent
            .slot(slots::SORT_KEY)
            .and_then(SlotValue::as_sort)
            .ok_or_else(|| AppError::IntentUnresolved {
                reason: "top-n has no sort key".to_string(),
            })?;
        if sort.column == COUNT_COLUMN {
            return Err(AppError::IntentUnresolved {
                reason: "counting needs a grouping column".to_string(),
            });
        }
        catalog.require_column(&table.name, &sort.column)?;

        let limit = self.clamp_limit(intent.integer(slots::LIMIT));
        let sort_ref = ColumnRef::new(&table.name, &sort.column);
        let pk = ColumnRef::new(&table.name, &table.primary_key);

        let mut plan = QueryPlan::select(&table.name, all_columns(table), limit);
        for column in table.column_names() {
            if let Some((join, label)) = label_join(catalog, table, column) {
                plan.add_join(join);
                plan.projection.push(label);
            }
        }
        plan.aggregation = Aggregation::TopN { n: limit, group_by: None };
        plan.order_by.push(SortKey {
            target: SortTarget::Column(sort_ref.clone()),
            descending: sort.descending,
        });
        // Equal sort values fall back to ascending primary key
        if sort_ref != pk {
            plan.order_by.push(SortKey::asc(SortTarget::Column(pk)));
        }
        Ok(plan)
    }

    /// Top-n groups by row count, ties broken by ascending group value
    fn grouped_template(&self, intent: &Intent, catalog: &SchemaCatalog) -> Result<QueryPlan> {
        let table = require_table_slot(intent, catalog)?;
        let group_column = required_text(intent, slots::GROUP_BY)?;
        catalog.require_column(&table.name, group_column)?;
        let group = ColumnRef::new(&table.name, group_column);

        let descending = intent
            .slot(slots::SORT_KEY)
            .and_then(SlotValue::as_sort)
            .map_or(true, |s| s.descending);
        let limit = self.clamp_limit(intent.integer(slots::LIMIT));

        let mut plan = QueryPlan::select(&table.name, Vec::new(), limit);
        if let Some((join, label)) = label_join(catalog, table, group_column) {
            plan.add_join(join);
            plan.projection.push(label);
        }
        plan.aggregation = Aggregation::TopN {
            n: limit,
            group_by: Some(group.clone()),
        };
        plan.order_by = vec![
            SortKey {
                target: SortTarget::Count,
                descending,
            },
            SortKey::asc(SortTarget::Column(group)),
        ];
        Ok(plan)
    }
}

impl Default for StructuredQueryGenerator {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

fn all_columns(table: &TableDef) -> Vec<ColumnRef> {
    table
        .column_names()
        .map(|c| ColumnRef::new(&table.name, c))
        .collect()
}

/// Join from a key column to the table it references, when that table has a display column
fn label_join(catalog: &SchemaCatalog, table: &TableDef, column: &str) -> Option<(JoinKey, ColumnRef)> {
    catalog
        .tables()
        .filter(|other| other.name != table.name)
        .find_map(|other| {
            let display = other.display_column.as_ref()?;
            let relation = catalog.relation_between(&table.name, &other.name)?;
            let (local, remote) = if relation.from_table == table.name {
                (&relation.from_column, &relation.to_column)
            } else {
                (&relation.to_column, &relation.from_column)
            };
            (local == column).then(|| {
                (
                    JoinKey {
                        left: ColumnRef::new(&table.name, local),
                        right: ColumnRef::new(&other.name, remote),
                    },
                    ColumnRef::new(&other.name, display),
                )
            })
        })
}

fn required_text<'a>(intent: &'a Intent, slot: &str) -> Result<&'a str> {
    intent.text(slot).ok_or_else(|| AppError::IntentUnresolved {
        reason: format!("{} needs a {} slot", intent.archetype, slot),
    })
}

fn require_table_slot<'c>(intent: &Intent, catalog: &'c SchemaCatalog) -> Result<&'c TableDef> {
    catalog.require_table(required_text(intent, slots::TABLE)?)
}

/// Typed literal for a column
fn literal(catalog: &SchemaCatalog, column: &ColumnRef, raw: &str) -> Result<Value> {
    let def = catalog.require_column(&column.table, &column.column)?;
    let invalid = || AppError::Validation {
        message: format!("'{}' is not a valid value for {}", raw, column),
        field: Some(column.column.clone()),
    };

    match def.semantic_type {
        SemanticType::Integer => raw.trim().parse::<i64>().map(Value::from).map_err(|_| invalid()),
        SemanticType::Decimal => raw
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(invalid),
        _ => Ok(Value::String(raw.trim().to_string())),
    }
}
