//! Fixture-backed services
//!
//! Interpret plans against JSON fixtures loaded at startup. Used for local
//! runs without PostgreSQL or model endpoints, and by the tests.

use crate::engine::{Aggregation, ColumnRef, InvocationShape, ModelInvocationPlan, Operator, Predicate, QueryPlan, SortKey, SortTarget};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::{cell_text, ModelPredictor, MultimodalDescriber, Predictions, ProductImage, Row, StructuredQueryExecutor};

/// Tables, model assignments, descriptions and reviews
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub tables: HashMap<String, Vec<Row>>,

    /// Entity id to cluster assignment
    #[serde(default)]
    pub clusters: Predictions,

    /// Product name (any case) to image description
    #[serde(default)]
    pub descriptions: HashMap<String, String>,

    /// Entity id to review texts
    #[serde(default)]
    pub reviews: HashMap<String, Vec<String>>,
}

impl Fixture {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| AppError::Configuration {
            message: format!("cannot read fixture {}: {}", path.display(), e),
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let mut fixture: Self = serde_json::from_str(raw)?;
        fixture.descriptions = fixture
            .descriptions
            .into_iter()
            .map(|(name, text)| (name.to_lowercase(), text))
            .collect();
        Ok(fixture)
    }
}

/// Row of joined tables keyed by `table.column`
type Joined = HashMap<String, Value>;

fn qualified(table: &str, column: &str) -> String {
    format!("{}.{}", table, column)
}

/// Executes query plans over fixture tables
pub struct InMemoryExecutor {
    fixture: Arc<Fixture>,
}

impl InMemoryExecutor {
    pub fn new(fixture: Arc<Fixture>) -> Self {
        Self { fixture }
    }

    fn table_rows(&self, table: &str) -> Result<Vec<Joined>> {
        let rows = self.fixture.tables.get(table).ok_or_else(|| {
            AppError::execution("structured_query", format!("table {} is not loaded", table))
        })?;
        Ok(rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|(column, value)| (qualified(table, column), value.clone()))
                    .collect()
            })
            .collect())
    }

    fn join(&self, plan: &QueryPlan) -> Result<Vec<Joined>> {
        let mut joined = self.table_rows(plan.base_table())?;
        let mut present = vec![plan.base_table().to_string()];

        for key in &plan.joins {
            let (inner, outer) = if present.contains(&key.left.table) {
                (&key.left, &key.right)
            } else {
                (&key.right, &key.left)
            };
            let other = self.table_rows(&outer.table)?;
            let inner_key = qualified(&inner.table, &inner.column);
            let outer_key = qualified(&outer.table, &outer.column);

            joined = joined
                .into_iter()
                .flat_map(|left| {
                    other
                        .iter()
                        .filter(|right| match (left.get(&inner_key), right.get(&outer_key)) {
                            (Some(a), Some(b)) => values_equal(a, b),
                            _ => false,
                        })
                        .map(|right| {
                            let mut row = left.clone();
                            row.extend(right.iter().map(|(k, v)| (k.clone(), v.clone())));
                            row
                        })
                        .collect::<Vec<_>>()
                })
                .collect();
            present.push(outer.table.clone());
        }
        Ok(joined)
    }
}

#[async_trait]
impl StructuredQueryExecutor for InMemoryExecutor {
    async fn execute(&self, plan: &QueryPlan) -> Result<Vec<Row>> {
        let rows: Vec<Joined> = self
            .join(plan)?
            .into_iter()
            .filter(|row| plan.filters.iter().all(|p| matches(row, p)))
            .collect();

        let limit = match &plan.aggregation {
            Aggregation::TopN { n, .. } => (*n).min(plan.limit),
            _ => plan.limit,
        };

        let output = if plan.aggregation.is_counting() {
            let mut grouped = count_groups(plan, &rows);
            grouped.sort_by(|a, b| compare_output(a, b, &plan.order_by));
            grouped
        } else {
            let mut rows = rows;
            rows.sort_by(|a, b| compare_joined(a, b, &plan.order_by));
            rows.iter()
                .map(|row| {
                    plan.projection
                        .iter()
                        .map(|c| (c.output_name().to_string(), cell(row, c)))
                        .collect()
                })
                .collect()
        };

        Ok(output.into_iter().take(limit).collect())
    }
}

/// Group rows and count them, keeping first-seen group order
///
/// Projected columns ride along from the first row of each group.
fn count_groups(plan: &QueryPlan, rows: &[Joined]) -> Vec<Row> {
    let group = plan.aggregation.group_by();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(&Joined, u64)> = Vec::new();

    for row in rows {
        let value = group.map_or(Value::Null, |g| cell(row, g));
        match index.entry(group_key(&value)) {
            Entry::Occupied(slot) => groups[*slot.get()].1 += 1,
            Entry::Vacant(slot) => {
                slot.insert(groups.len());
                groups.push((row, 1));
            }
        }
    }

    if group.is_none() && groups.is_empty() {
        let mut row = Row::new();
        row.insert(crate::engine::COUNT_COLUMN.to_string(), Value::from(0));
        return vec![row];
    }

    groups
        .into_iter()
        .map(|(first, count)| {
            let mut row = Row::new();
            for column in group.into_iter().chain(plan.projection.iter()) {
                row.insert(column.output_name().to_string(), cell(first, column));
            }
            row.insert(crate::engine::COUNT_COLUMN.to_string(), Value::from(count));
            row
        })
        .collect()
}

/// Hashable form of a group value; numbers group numerically
fn group_key(value: &Value) -> String {
    match (value, value.as_f64()) {
        (Value::Null, _) => "null".to_string(),
        (_, Some(n)) => format!("n:{}", n),
        _ => format!("s:{}", cell_text(value)),
    }
}

fn cell(row: &Joined, column: &ColumnRef) -> Value {
    row.get(&qualified(&column.table, &column.column))
        .cloned()
        .unwrap_or(Value::Null)
}

fn matches(row: &Joined, predicate: &Predicate) -> bool {
    let column = qualified(&predicate.column.table, &predicate.column.column);
    let value = row.get(&column).unwrap_or(&Value::Null);
    let wanted = &predicate.value;

    match predicate.op {
        Operator::Eq => values_equal(value, wanted),
        Operator::Ne => !values_equal(value, wanted),
        Operator::Gt => compare_values(value, wanted) == Ordering::Greater,
        Operator::Gte => compare_values(value, wanted) != Ordering::Less,
        Operator::Lt => compare_values(value, wanted) == Ordering::Less,
        Operator::Lte => compare_values(value, wanted) != Ordering::Greater,
        Operator::In => wanted
            .as_array()
            .map_or(false, |candidates| candidates.iter().any(|c| values_equal(value, c))),
        Operator::EqIgnoreCase => {
            !value.is_null() && cell_text(value).to_lowercase() == cell_text(wanted).to_lowercase()
        }
        Operator::Contains => cell_text(value)
            .to_lowercase()
            .contains(&cell_text(wanted).to_lowercase()),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => !a.is_null() && !b.is_null() && cell_text(a) == cell_text(b),
    }
}

/// Nulls first, numbers numerically, everything else as text
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => cell_text(a).cmp(&cell_text(b)),
        },
    }
}

fn directed(ordering: Ordering, key: &SortKey) -> Ordering {
    if key.descending {
        ordering.reverse()
    } else {
        ordering
    }
}

fn compare_joined(a: &Joined, b: &Joined, keys: &[SortKey]) -> Ordering {
    keys.iter()
        .map(|key| match &key.target {
            SortTarget::Column(c) => {
                let column = qualified(&c.table, &c.column);
                let ordering = compare_values(
                    a.get(&column).unwrap_or(&Value::Null),
                    b.get(&column).unwrap_or(&Value::Null),
                );
                directed(ordering, key)
            }
            SortTarget::Count => Ordering::Equal,
        })
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

fn compare_output(a: &Row, b: &Row, keys: &[SortKey]) -> Ordering {
    keys.iter()
        .map(|key| {
            let name = key.output_name();
            let ordering = compare_values(
                a.get(name).unwrap_or(&Value::Null),
                b.get(name).unwrap_or(&Value::Null),
            );
            directed(ordering, key)
        })
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// Serves cluster assignments from the fixture
pub struct InMemoryPredictor {
    fixture: Arc<Fixture>,
}

impl InMemoryPredictor {
    pub fn new(fixture: Arc<Fixture>) -> Self {
        Self { fixture }
    }
}

#[async_trait]
impl ModelPredictor for InMemoryPredictor {
    async fn predict(&self, plan: &ModelInvocationPlan) -> Result<Predictions> {
        let clusters = &self.fixture.clusters;
        Ok(match &plan.shape {
            InvocationShape::PredictForEntity { entity_id } => clusters
                .get(entity_id)
                .map(|p| Predictions::from([(entity_id.clone(), *p)]))
                .unwrap_or_default(),
            InvocationShape::FilterByCluster { cluster_id } => clusters
                .iter()
                .filter(|(_, p)| p.cluster_id == *cluster_id)
                .map(|(id, p)| (id.clone(), *p))
                .collect(),
        })
    }
}

/// Serves descriptions and reviews from the fixture
pub struct InMemoryDescriber {
    fixture: Arc<Fixture>,
}

impl InMemoryDescriber {
    pub fn new(fixture: Arc<Fixture>) -> Self {
        Self { fixture }
    }
}

#[async_trait]
impl MultimodalDescriber for InMemoryDescriber {
    async fn describe(&self, image: &ProductImage) -> Result<String> {
        self.fixture
            .descriptions
            .get(&image.name.to_lowercase())
            .cloned()
            .ok_or_else(|| {
                AppError::execution("image_describer", format!("no description for {}", image.name))
            })
    }

    async fn fetch_reviews(&self, entity_id: &str) -> Result<Vec<String>> {
        Ok(self.fixture.reviews.get(entity_id).cloned().unwrap_or_default())
    }
}
