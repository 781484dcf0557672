//! PostgreSQL structured query executor
//!
//! Renders a `QueryPlan` into parameterised SQL. Identifiers come from the
//! validated plan and are quoted; every literal is a bind parameter.

use crate::config::ExecutorConfig;
use crate::engine::{Aggregation, ColumnRef, Operator, Predicate, QueryPlan, SortTarget, COUNT_COLUMN};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

use super::{Row, StructuredQueryExecutor};

/// SQL text and its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn column_sql(column: &ColumnRef) -> String {
    format!("{}.{}", quote(&column.table), quote(&column.column))
}

fn string_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

struct Renderer {
    params: Vec<Value>,
}

impl Renderer {
    fn param(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("${}", self.params.len())
    }

    fn predicate(&mut self, predicate: &Predicate) -> String {
        let column = column_sql(&predicate.column);
        let op = match predicate.op {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::In => {
                let values = predicate.value.as_array().cloned().unwrap_or_default();
                if values.is_empty() {
                    return "FALSE".to_string();
                }
                let placeholders: Vec<String> = values.into_iter().map(|v| self.param(v)).collect();
                return format!("{} IN ({})", column, placeholders.join(", "));
            }
            Operator::EqIgnoreCase => {
                let placeholder = self.param(Value::String(super::cell_text(&predicate.value)));
                return format!("LOWER(CAST({} AS TEXT)) = LOWER({})", column, placeholder);
            }
            Operator::Contains => {
                let text = super::cell_text(&predicate.value)
                    .replace('\\', "\\\\")
                    .replace('%', "\\%")
                    .replace('_', "\\_");
                let placeholder = self.param(Value::String(format!("%{}%", text)));
                return format!("CAST({} AS TEXT) ILIKE {}", column, placeholder);
            }
        };
        let placeholder = self.param(predicate.value.clone());
        format!("{} {} {}", column, op, placeholder)
    }
}

/// Render a plan as one query returning a JSON object per row
pub fn render(plan: &QueryPlan) -> RenderedQuery {
    let mut renderer = Renderer { params: Vec::new() };

    let fields: Vec<String> = if plan.aggregation.is_counting() {
        let mut fields: Vec<String> = plan
            .aggregation
            .group_by()
            .into_iter()
            .chain(plan.projection.iter())
            .map(|c| format!("{}, {}", string_literal(c.output_name()), column_sql(c)))
            .collect();
        fields.push(format!("{}, COUNT(*)", string_literal(COUNT_COLUMN)));
        fields
    } else {
        plan.projection
            .iter()
            .map(|c| format!("{}, {}", string_literal(c.output_name()), column_sql(c)))
            .collect()
    };

    let mut sql = format!(
        "SELECT jsonb_build_object({}) FROM {}",
        fields.join(", "),
        quote(plan.base_table())
    );

    // Join i brings in table i + 1
    for (i, join) in plan.joins.iter().enumerate() {
        let joined = plan
            .tables
            .get(i + 1)
            .map(String::as_str)
            .unwrap_or(&join.right.table);
        sql.push_str(&format!(
            " JOIN {} ON {} = {}",
            quote(joined),
            column_sql(&join.left),
            column_sql(&join.right)
        ));
    }

    if !plan.filters.is_empty() {
        let clauses: Vec<String> = plan.filters.iter().map(|p| renderer.predicate(p)).collect();
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    if let Some(group) = plan.aggregation.group_by() {
        let columns: Vec<String> = std::iter::once(group)
            .chain(plan.projection.iter())
            .map(column_sql)
            .collect();
        sql.push_str(&format!(" GROUP BY {}", columns.join(", ")));
    }

    if !plan.order_by.is_empty() {
        let keys: Vec<String> = plan
            .order_by
            .iter()
            .map(|key| {
                let target = match &key.target {
                    SortTarget::Column(c) => column_sql(c),
                    SortTarget::Count => "COUNT(*)".to_string(),
                };
                let direction = if key.descending { "DESC NULLS LAST" } else { "ASC NULLS FIRST" };
                format!("{} {}", target, direction)
            })
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&keys.join(", "));
    }

    let limit = match &plan.aggregation {
        Aggregation::TopN { n, .. } => (*n).min(plan.limit),
        _ => plan.limit,
    };
    sql.push_str(&format!(" LIMIT {}", limit));

    RenderedQuery {
        sql,
        params: renderer.params,
    }
}

/// Executes plans against PostgreSQL in read-only transactions
pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    pub async fn connect(config: &ExecutorConfig) -> Result<Self> {
        let url = config.database_url.as_deref().ok_or_else(|| AppError::Configuration {
            message: "executor.database_url is not set".to_string(),
        })?;

        info!("Connecting to structured store...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(url)
            .await?;
        info!("Structured store connection established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StructuredQueryExecutor for PgExecutor {
    async fn execute(&self, plan: &QueryPlan) -> Result<Vec<Row>> {
        let rendered = render(plan);
        tracing::debug!(sql = %rendered.sql, params = rendered.params.len(), "Executing structured query");

        let mut query = sqlx::query_scalar::<sqlx::Postgres, Value>(&rendered.sql);
        for param in &rendered.params {
            query = match param {
                Value::String(s) => query.bind(s.clone()),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64()),
                },
                Value::Null => query.bind(Option::<String>::None),
                other => query.bind(other.clone()),
            };
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;
        let values = query.fetch_all(&mut *tx).await?;
        tx.commit().await?;

        values
            .into_iter()
            .map(|value| match value {
                Value::Object(row) => Ok(row),
                other => Err(AppError::execution(
                    "structured_query",
                    format!("expected a JSON object per row, got {}", other),
                )),
            })
            .collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{JoinKey, SortKey};
    use serde_json::json;

    #[test]
    fn test_render_grouped_top_n() {
        let country = ColumnRef::new("customers", "country");
        let mut plan = QueryPlan::select("customers", vec![], 3);
        plan.aggregation = Aggregation::TopN {
            n: 3,
            group_by: Some(country.clone()),
        };
        plan.filters.push(Predicate::new(
            ColumnRef::new("customers", "customer_id"),
            Operator::In,
            json!([12347, 12350]),
        ));
        plan.order_by = vec![
            SortKey::desc(SortTarget::Count),
            SortKey::asc(SortTarget::Column(country)),
        ];

        let rendered = render(&plan);
        assert_eq!(
            rendered.sql,
            "SELECT jsonb_build_object('country', \"customers\".\"country\", 'count', COUNT(*)) \
             FROM \"customers\" WHERE \"customers\".\"customer_id\" IN ($1, $2) \
             GROUP BY \"customers\".\"country\" \
             ORDER BY COUNT(*) DESC NULLS LAST, \"customers\".\"country\" ASC NULLS FIRST LIMIT 3"
        );
        assert_eq!(rendered.params, vec![json!(12347), json!(12350)]);
    }

    #[test]
    fn test_render_contains_escapes_wildcards() {
        let description = ColumnRef::new("products", "description");
        let mut plan = QueryPlan::select("products", vec![description.clone()], 5);
        plan.filters
            .push(Predicate::new(description, Operator::Contains, "100%_cotton"));

        let rendered = render(&plan);
        assert!(rendered
            .sql
            .contains("CAST(\"products\".\"description\" AS TEXT) ILIKE $1"));
        assert_eq!(rendered.params, vec![json!("%100\\%\\_cotton%")]);
    }

    #[test]
    fn test_render_exact_name_ignores_case() {
        let description = ColumnRef::new("products", "description");
        let mut plan = QueryPlan::select("products", vec![description.clone()], 5);
        plan.filters
            .push(Predicate::new(description, Operator::EqIgnoreCase, "Red Heart"));

        let rendered = render(&plan);
        assert!(rendered
            .sql
            .contains("LOWER(CAST(\"products\".\"description\" AS TEXT)) = LOWER($1)"));
        assert_eq!(rendered.params, vec![json!("Red Heart")]);
    }

    #[test]
    fn test_render_grouped_label_is_grouped_too() {
        let stock_code = ColumnRef::new("transactions", "stock_code");
        let mut plan = QueryPlan::select("transactions", vec![ColumnRef::new("products", "description")], 3);
        plan.add_join(JoinKey {
            left: stock_code.clone(),
            right: ColumnRef::new("products", "stock_code"),
        });
        plan.aggregation = Aggregation::TopN {
            n: 3,
            group_by: Some(stock_code.clone()),
        };
        plan.order_by = vec![
            SortKey::desc(SortTarget::Count),
            SortKey::asc(SortTarget::Column(stock_code)),
        ];

        let rendered = render(&plan);
        assert!(rendered.sql.starts_with(
            "SELECT jsonb_build_object('stock_code', \"transactions\".\"stock_code\", \
             'description', \"products\".\"description\", 'count', COUNT(*))"
        ));
        assert!(rendered.sql.contains(
            "GROUP BY \"transactions\".\"stock_code\", \"products\".\"description\""
        ));
    }

    #[test]
    fn test_render_join_and_empty_in() {
        let mut plan = QueryPlan::select(
            "transactions",
            vec![ColumnRef::new("customers", "country")],
            10,
        );
        plan.tables.push("customers".into());
        plan.joins.push(JoinKey {
            left: ColumnRef::new("transactions", "customer_id"),
            right: ColumnRef::new("customers", "customer_id"),
        });
        plan.filters.push(Predicate::new(
            ColumnRef::new("customers", "customer_id"),
            Operator::In,
            json!([]),
        ));

        let rendered = render(&plan);
        assert!(rendered.sql.contains(
            "JOIN \"customers\" ON \"transactions\".\"customer_id\" = \"customers\".\"customer_id\""
        ));
        assert!(rendered.sql.contains("WHERE FALSE"));
        assert!(rendered.params.is_empty());
    }
}
