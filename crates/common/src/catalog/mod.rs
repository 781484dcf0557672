//! Schema Catalog
//!
//! Static description of the queryable tables and the segmentation model's
//! input/output contract. Built once at startup, validated, then shared
//! read-only (`Arc<SchemaCatalog>`) by every concurrent turn.

use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

/// Semantic type of a column
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    /// Opaque identifier (stock codes, invoice numbers)
    Identifier,
    Text,
    Integer,
    Decimal,
    Timestamp,
    Url,
}

impl SemanticType {
    /// Whether values of this type order numerically
    pub fn is_numeric(&self) -> bool {
        matches!(self, SemanticType::Integer | SemanticType::Decimal)
    }
}

/// Column definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub semantic_type: SemanticType,
}

/// Table definition with ordered columns
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableDef {
    pub name: String,

    /// Columns in declaration order
    pub columns: Vec<ColumnDef>,

    /// Primary key column, used for deterministic tie-breaks
    pub primary_key: String,

    /// Human-readable name column used to resolve entities by text
    #[serde(default)]
    pub display_column: Option<String>,
}

impl TableDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Equality join path between two tables
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relation {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

/// Output contract of the pre-trained clustering model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelContract {
    pub model_id: String,

    /// Table whose rows the model assigns to clusters
    pub entity_table: String,

    /// Key column of the entity table
    pub entity_key: String,

    /// Feature columns the model was trained on
    pub input_features: Vec<String>,

    /// Finite set of cluster ids the model can emit
    pub label_domain: BTreeSet<u32>,
}

impl ModelContract {
    pub fn has_cluster(&self, cluster_id: u32) -> bool {
        self.label_domain.contains(&cluster_id)
    }
}

/// Immutable schema catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaCatalog {
    tables: BTreeMap<String, TableDef>,

    #[serde(default)]
    relations: Vec<Relation>,

    model: ModelContract,
}

impl SchemaCatalog {
    /// Build and validate a catalog
    pub fn new(
        tables: Vec<TableDef>,
        relations: Vec<Relation>,
        model: ModelContract,
    ) -> Result<Self> {
        let tables = tables
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect::<BTreeMap<_, _>>();

        let catalog = Self {
            tables,
            relations,
            model,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Load a catalog from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| AppError::Configuration {
            message: format!("Failed to read catalog {}: {}", path.display(), e),
        })?;
        Self::from_json(&raw)
    }

    /// Parse a catalog from JSON text
    pub fn from_json(raw: &str) -> Result<Self> {
        let catalog: SchemaCatalog = serde_json::from_str(raw)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// The built-in online-retail catalog
    pub fn retail() -> Self {
        use SemanticType::*;

        fn table(name: &str, pk: &str, display: Option<&str>, cols: &[(&str, SemanticType)]) -> TableDef {
            TableDef {
                name: name.to_string(),
                columns: cols
                    .iter()
                    .map(|(n, t)| ColumnDef {
                        name: n.to_string(),
                        semantic_type: *t,
                    })
                    .collect(),
                primary_key: pk.to_string(),
                display_column: display.map(str::to_string),
            }
        }

        fn relation(from: (&str, &str), to: (&str, &str)) -> Relation {
            Relation {
                from_table: from.0.to_string(),
                from_column: from.1.to_string(),
                to_table: to.0.to_string(),
                to_column: to.1.to_string(),
            }
        }

        let tables = vec![
            table(
                "products",
                "stock_code",
                Some("description"),
                &[
                    ("stock_code", Identifier),
                    ("description", Text),
                    ("unit_price", Decimal),
                ],
            ),
            table(
                "customers",
                "customer_id",
                None,
                &[("customer_id", Integer), ("country", Text)],
            ),
            table(
                "transactions",
                "invoice_no",
                None,
                &[
                    ("invoice_no", Identifier),
                    ("stock_code", Identifier),
                    ("customer_id", Integer),
                    ("quantity", Integer),
                    ("invoice_date", Timestamp),
                    ("unit_price", Decimal),
                ],
            ),
            table(
                "reviews",
                "review_id",
                None,
                &[
                    ("review_id", Integer),
                    ("stock_code", Identifier),
                    ("rating", Integer),
                    ("review_text", Text),
                ],
            ),
            table(
                "product_images",
                "stock_code",
                None,
                &[
                    ("stock_code", Identifier),
                    ("image_url", Url),
                    ("source", Text),
                    ("alt_text", Text),
                ],
            ),
        ];

        let relations = vec![
            relation(("transactions", "stock_code"), ("products", "stock_code")),
            relation(("transactions", "customer_id"), ("customers", "customer_id")),
            relation(("reviews", "stock_code"), ("products", "stock_code")),
            relation(("product_images", "stock_code"), ("products", "stock_code")),
        ];

        let model = ModelContract {
            model_id: crate::DEFAULT_MODEL_ID.to_string(),
            entity_table: "customers".to_string(),
            entity_key: "customer_id".to_string(),
            input_features: vec![
                "recency".to_string(),
                "frequency".to_string(),
                "monetary".to_string(),
            ],
            label_domain: (0..=7).collect(),
        };

        // Covered by test_retail_catalog_is_valid
        Self {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
            relations,
            model,
        }
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| AppError::Configuration { message };

        if self.tables.is_empty() {
            return Err(invalid("catalog has no tables".to_string()));
        }

        for (name, table) in &self.tables {
            if name != &table.name {
                return Err(invalid(format!("table key '{}' does not match name '{}'", name, table.name)));
            }
            if table.columns.is_empty() {
                return Err(invalid(format!("table '{}' has no columns", name)));
            }
            let mut seen = HashSet::new();
            for column in &table.columns {
                if !seen.insert(column.name.as_str()) {
                    return Err(invalid(format!("duplicate column {}.{}", name, column.name)));
                }
            }
            if table.column(&table.primary_key).is_none() {
                return Err(invalid(format!(
                    "primary key {}.{} is not a column",
                    name, table.primary_key
                )));
            }
            if let Some(display) = &table.display_column {
                if table.column(display).is_none() {
                    return Err(invalid(format!("display column {}.{} is not a column", name, display)));
                }
            }
        }

        for rel in &self.relations {
            self.require_column(&rel.from_table, &rel.from_column)?;
            self.require_column(&rel.to_table, &rel.to_column)?;
        }

        self.require_column(&self.model.entity_table, &self.model.entity_key)?;
        if self.model.label_domain.is_empty() {
            return Err(invalid(format!("model '{}' has an empty label domain", self.model.model_id)));
        }

        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnDef> {
        self.tables.get(table).and_then(|t| t.column(column))
    }

    /// Look up a column or fail with `SchemaMismatch`
    pub fn require_column(&self, table: &str, column: &str) -> Result<&ColumnDef> {
        self.column(table, column).ok_or_else(|| AppError::SchemaMismatch {
            table: table.to_string(),
            column: column.to_string(),
        })
    }

    /// Look up a table or fail with `SchemaMismatch`
    pub fn require_table(&self, table: &str) -> Result<&TableDef> {
        self.tables.get(table).ok_or_else(|| AppError::SchemaMismatch {
            table: table.to_string(),
            column: "*".to_string(),
        })
    }

    /// Join path between two tables, in either direction
    pub fn relation_between(&self, a: &str, b: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| {
            (r.from_table == a && r.to_table == b) || (r.from_table == b && r.to_table == a)
        })
    }

    pub fn model(&self) -> &ModelContract {
        &self.model
    }
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self::retail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retail_catalog_is_valid() {
        let catalog = SchemaCatalog::retail();
        catalog.validate().unwrap();
        assert_eq!(catalog.table("products").unwrap().primary_key, "stock_code");
        assert!(catalog.model().has_cluster(5));
        assert!(!catalog.model().has_cluster(42));
    }

    #[test]
    fn test_require_column_mismatch() {
        let catalog = SchemaCatalog::retail();
        let err = catalog.require_column("products", "colour").unwrap_err();
        match err {
            AppError::SchemaMismatch { table, column } => {
                assert_eq!(table, "products");
                assert_eq!(column, "colour");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_columns_keep_declaration_order() {
        let catalog = SchemaCatalog::retail();
        let names: Vec<&str> = catalog.table("products").unwrap().column_names().collect();
        assert_eq!(names, vec!["stock_code", "description", "unit_price"]);
    }

    #[test]
    fn test_json_round_trip_validates() {
        let raw = serde_json::to_string(&SchemaCatalog::retail()).unwrap();
        let parsed = SchemaCatalog::from_json(&raw).unwrap();
        assert_eq!(parsed, SchemaCatalog::retail());

        let broken = raw.replace("\"primary_key\":\"stock_code\"", "\"primary_key\":\"sku\"");
        assert!(SchemaCatalog::from_json(&broken).is_err());
    }

    #[test]
    fn test_relation_lookup_is_symmetric() {
        let catalog = SchemaCatalog::retail();
        assert!(catalog.relation_between("customers", "transactions").is_some());
        assert!(catalog.relation_between("transactions", "customers").is_some());
        assert!(catalog.relation_between("reviews", "customers").is_none());
    }
}
