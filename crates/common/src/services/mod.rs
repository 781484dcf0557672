//! External collaborators of the orchestrator
//!
//! Provides:
//! - Capability traits for the four external services
//! - PostgreSQL, HTTP and in-memory implementations
//! - Product image location for the describer
//! - A factory wiring implementations from configuration

pub mod http;
pub mod images;
pub mod memory;
pub mod reasoning;
pub mod sql;

use crate::config::{AppConfig, BackendKind};
use crate::engine::{ModelInvocationPlan, QueryPlan};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use images::{ProductImage, ProductImageLocator};

/// One result row keyed by output column name
pub type Row = serde_json::Map<String, Value>;

/// Render a cell for display and id comparison
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Prompt for one stateless reasoning call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptContext {
    pub system: String,
    pub user: String,
}

impl PromptContext {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Generative text completion
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn complete(&self, prompt: &PromptContext) -> Result<String>;

    /// Model name, for logs
    fn model(&self) -> &str;
}

/// Runs read-only structured queries
#[async_trait]
pub trait StructuredQueryExecutor: Send + Sync {
    /// Rows in plan order, keyed by `QueryPlan::output_columns`
    async fn execute(&self, plan: &QueryPlan) -> Result<Vec<Row>>;

    /// Cheap readiness probe
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// One model assignment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    pub cluster_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

/// Entity id to assignment
pub type Predictions = BTreeMap<String, Prediction>;

/// Pre-trained segmentation model
#[async_trait]
pub trait ModelPredictor: Send + Sync {
    async fn predict(&self, plan: &ModelInvocationPlan) -> Result<Predictions>;
}

/// Image description and review text for products
#[async_trait]
pub trait MultimodalDescriber: Send + Sync {
    async fn describe(&self, image: &ProductImage) -> Result<String>;

    /// Reviews in the order the source returns them
    async fn fetch_reviews(&self, entity_id: &str) -> Result<Vec<String>>;
}

/// Everything the orchestrator calls out to
#[derive(Clone)]
pub struct Services {
    /// Absent when no credentials are configured
    pub reasoning: Option<Arc<dyn ReasoningService>>,
    pub executor: Arc<dyn StructuredQueryExecutor>,
    pub predictor: Arc<dyn ModelPredictor>,
    pub describer: Arc<dyn MultimodalDescriber>,
    pub images: Arc<ProductImageLocator>,
}

/// Wire services from configuration
pub async fn build_services(config: &AppConfig) -> Result<Services> {
    let reasoning = reasoning::create_reasoning_service(&config.reasoning)?;
    if reasoning.is_none() {
        tracing::warn!("Reasoning service not configured; rule-based classification and plain answers only");
    }

    let fixture = match (config.executor.kind, config.predictor.kind, config.describer.kind) {
        (BackendKind::Memory, _, _) | (_, BackendKind::Memory, _) | (_, _, BackendKind::Memory) => {
            Some(Arc::new(memory::Fixture::from_file(&config.executor.fixture_path)?))
        }
        _ => None,
    };
    let fixture_for = |component: &str| {
        fixture.clone().ok_or_else(|| AppError::Configuration {
            message: format!("{} fixture was not loaded", component),
        })
    };

    let executor: Arc<dyn StructuredQueryExecutor> = match config.executor.kind {
        BackendKind::Postgres => Arc::new(sql::PgExecutor::connect(&config.executor).await?),
        BackendKind::Memory => Arc::new(memory::InMemoryExecutor::new(fixture_for("executor")?)),
        BackendKind::Http => {
            return Err(AppError::Configuration {
                message: "executor.kind must be postgres or memory".to_string(),
            })
        }
    };

    let predictor: Arc<dyn ModelPredictor> = match config.predictor.kind {
        BackendKind::Http => Arc::new(http::HttpPredictor::new(&config.predictor)?),
        BackendKind::Memory => Arc::new(memory::InMemoryPredictor::new(fixture_for("predictor")?)),
        BackendKind::Postgres => {
            return Err(AppError::Configuration {
                message: "predictor.kind must be http or memory".to_string(),
            })
        }
    };

    let describer: Arc<dyn MultimodalDescriber> = match config.describer.kind {
        BackendKind::Http => Arc::new(http::HttpDescriber::new(&config.describer)?),
        BackendKind::Memory => Arc::new(memory::InMemoryDescriber::new(fixture_for("describer")?)),
        BackendKind::Postgres => {
            return Err(AppError::Configuration {
                message: "describer.kind must be http or memory".to_string(),
            })
        }
    };

    let images = Arc::new(ProductImageLocator::from_config(&config.images)?);

    tracing::info!(
        executor = ?config.executor.kind,
        predictor = ?config.predictor.kind,
        describer = ?config.describer.kind,
        image_sources = images.source_names().join(","),
        "Services initialized"
    );

    Ok(Services {
        reasoning,
        executor,
        predictor,
        describer,
        images,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cell_text() {
        assert_eq!(cell_text(&json!("85123A")), "85123A");
        assert_eq!(cell_text(&json!(17490)), "17490");
        assert_eq!(cell_text(&json!(2.55)), "2.55");
        assert_eq!(cell_text(&Value::Null), "");
    }

    #[tokio::test]
    async fn test_http_executor_is_rejected() {
        let mut config = AppConfig::default();
        config.executor.kind = BackendKind::Http;
        let err = build_services(&config).await.err().unwrap();
        assert!(matches!(err, AppError::Configuration { .. }));
    }
}
