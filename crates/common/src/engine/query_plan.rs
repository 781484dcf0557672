//! Structured query IR
//!
//! A backend-independent description of a read-only query. Executors
//! interpret it (in memory) or render it (SQL); nothing downstream sees
//! query text.

use crate::catalog::SchemaCatalog;
use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::intent::COUNT_COLUMN;

/// Fully qualified column reference
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Key used for this column in result rows
    pub fn output_name(&self) -> &str {
        &self.column
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Value is an array of candidates
    In,
    /// Case-insensitive equality on the text form
    EqIgnoreCase,
    /// Case-insensitive substring match
    Contains,
}

/// Filter predicate; values are literals, never query text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Predicate {
    pub column: ColumnRef,
    pub op: Operator,
    pub value: Value,
}

impl Predicate {
    pub fn new(column: ColumnRef, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            column,
            op,
            value: value.into(),
        }
    }
}

/// Equality join between two plan tables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinKey {
    pub left: ColumnRef,
    pub right: ColumnRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Aggregation {
    None,
    /// Count rows, optionally per group
    Count { group_by: Option<ColumnRef> },
    /// Keep the first `n` rows after ordering, optionally grouped by count
    TopN { n: usize, group_by: Option<ColumnRef> },
}

impl Aggregation {
    pub fn group_by(&self) -> Option<&ColumnRef> {
        match self {
            Aggregation::None => None,
            Aggregation::Count { group_by } | Aggregation::TopN { group_by, .. } => {
                group_by.as_ref()
            }
        }
    }

    /// Whether rows are collapsed into counts
    pub fn is_counting(&self) -> bool {
        match self {
            Aggregation::None => false,
            Aggregation::Count { .. } => true,
            Aggregation::TopN { group_by, .. } => group_by.is_some(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "column", rename_all = "snake_case")]
pub enum SortTarget {
    Column(ColumnRef),
    /// The grouped row count
    Count,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SortKey {
    pub target: SortTarget,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(target: SortTarget) -> Self {
        Self {
            target,
            descending: false,
        }
    }

    pub fn desc(target: SortTarget) -> Self {
        Self {
            target,
            descending: true,
        }
    }

    /// Output row key this sort reads
    pub fn output_name(&self) -> &str {
        match &self.target {
            SortTarget::Column(column) => column.output_name(),
            SortTarget::Count => COUNT_COLUMN,
        }
    }
}

/// Read-only structured query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryPlan {
    /// Base table first, then joined tables
    pub tables: Vec<String>,
    pub joins: Vec<JoinKey>,
    pub projection: Vec<ColumnRef>,
    pub filters: Vec<Predicate>,
    pub aggregation: Aggregation,
    pub order_by: Vec<SortKey>,
    pub limit: usize,
}

impl QueryPlan {
    /// Plain projection of one table
    pub fn select(table: impl Into<String>, projection: Vec<ColumnRef>, limit: usize) -> Self {
        Self {
            tables: vec![table.into()],
            joins: Vec::new(),
            projection,
            filters: Vec::new(),
            aggregation: Aggregation::None,
            order_by: Vec::new(),
            limit,
        }
    }

    /// Bring in the table on the right side of `join`
    pub fn add_join(&mut self, join: JoinKey) {
        self.tables.push(join.right.table.clone());
        self.joins.push(join);
    }

    pub fn base_table(&self) -> &str {
        self.tables.first().map(String::as_str).unwrap_or_default()
    }

    /// Keys of the produced rows, in order
    ///
    /// Grouped plans emit the group, then any projected label columns, then
    /// the count.
    pub fn output_columns(&self) -> Vec<String> {
        if self.aggregation.is_counting() {
            let mut columns: Vec<String> = self
                .aggregation
                .group_by()
                .into_iter()
                .chain(self.projection.iter())
                .map(|c| c.output_name().to_string())
                .collect();
            columns.push(COUNT_COLUMN.to_string());
            columns
        } else {
            self.projection
                .iter()
                .map(|c| c.output_name().to_string())
                .collect()
        }
    }

    /// Every column the plan touches
    pub fn referenced_columns(&self) -> Vec<&ColumnRef> {
        let mut refs: Vec<&ColumnRef> = Vec::new();
        refs.extend(self.projection.iter());
        refs.extend(self.filters.iter().map(|p| &p.column));
        for join in &self.joins {
            refs.push(&join.left);
            refs.push(&join.right);
        }
        if let Some(group) = self.aggregation.group_by() {
            refs.push(group);
        }
        for key in &self.order_by {
            if let SortTarget::Column(column) = &key.target {
                refs.push(column);
            }
        }
        refs
    }

    /// Check the plan against the catalog
    ///
    /// Every referenced table and column must exist, and the plan must be
    /// well formed for the executors.
    pub fn validate(&self, catalog: &SchemaCatalog) -> Result<()> {
        let malformed = |message: String| AppError::Internal {
            message: format!("malformed query plan: {}", message),
        };

        if self.tables.is_empty() {
            return Err(malformed("no tables".to_string()));
        }
        for table in &self.tables {
            catalog.require_table(table)?;
        }
        for column in self.referenced_columns() {
            if !self.tables.contains(&column.table) {
                return Err(malformed(format!("{} is outside the plan tables", column)));
            }
            catalog.require_column(&column.table, &column.column)?;
        }

        if self.joins.len() + 1 != self.tables.len() {
            return Err(malformed(format!(
                "{} tables need {} joins, found {}",
                self.tables.len(),
                self.tables.len() - 1,
                self.joins.len()
            )));
        }

        if self.limit == 0 {
            return Err(malformed("limit must be positive".to_string()));
        }

        if !self.aggregation.is_counting() && self.projection.is_empty() {
            return Err(malformed("empty projection".to_string()));
        }

        if let Aggregation::TopN { n, .. } = &self.aggregation {
            if *n == 0 || self.order_by.is_empty() {
                return Err(malformed("top-n needs a positive n and an ordering".to_string()));
            }
        }

        for key in &self.order_by {
            if matches!(key.target, SortTarget::Count) && !self.aggregation.is_counting() {
                return Err(malformed("count ordering without a grouped count".to_string()));
            }
            if let SortTarget::Column(column) = &key.target {
                if self.aggregation.is_counting()
                    && self.aggregation.group_by() != Some(column)
                {
                    return Err(malformed(format!("cannot order grouped rows by {}", column)));
                }
            }
        }

        for predicate in &self.filters {
            if predicate.op == Operator::In && !predicate.value.is_array() {
                return Err(malformed(format!("IN on {} needs an array", predicate.column)));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn top_countries() -> QueryPlan {
        let country = ColumnRef::new("customers", "country");
        QueryPlan {
            tables: vec!["customers".into()],
            joins: vec![],
            projection: vec![],
            filters: vec![Predicate::new(
                ColumnRef::new("customers", "customer_id"),
                Operator::In,
                json!([12347, 12348]),
            )],
            aggregation: Aggregation::TopN {
                n: 3,
                group_by: Some(country.clone()),
            },
            order_by: vec![
                SortKey::desc(SortTarget::Count),
                SortKey::asc(SortTarget::Column(country)),
            ],
            limit: 3,
        }
    }

    #[test]
    fn test_grouped_plan_validates() {
        let plan = top_countries();
        plan.validate(&SchemaCatalog::retail()).unwrap();
        assert_eq!(plan.output_columns(), vec!["country", "count"]);
    }

    #[test]
    fn test_unknown_column_is_schema_mismatch() {
        let mut plan = top_countries();
        plan.filters[0].column = ColumnRef::new("customers", "segment");
        let err = plan.validate(&SchemaCatalog::retail()).unwrap_err();
        assert!(matches!(err, AppError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_in_requires_array() {
        let mut plan = top_countries();
        plan.filters[0].value = json!(12347);
        assert!(plan.validate(&SchemaCatalog::retail()).is_err());
    }

    #[test]
    fn test_join_count_must_match_tables() {
        let mut plan = QueryPlan::select(
            "transactions",
            vec![ColumnRef::new("transactions", "invoice_no")],
            5,
        );
        plan.tables.push("products".into());
        assert!(plan.validate(&SchemaCatalog::retail()).is_err());

        plan.joins.push(JoinKey {
            left: ColumnRef::new("transactions", "stock_code"),
            right: ColumnRef::new("products", "stock_code"),
        });
        plan.validate(&SchemaCatalog::retail()).unwrap();
    }
}
