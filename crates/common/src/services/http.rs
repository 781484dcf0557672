//! JSON-over-HTTP adapters for the model and describer services

use crate::config::{DescriberConfig, PredictorConfig};
use crate::engine::ModelInvocationPlan;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ModelPredictor, MultimodalDescriber, Predictions, ProductImage};

fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| AppError::Internal {
            message: format!("Failed to create HTTP client: {}", e),
        })
}

fn require_endpoint(endpoint: &Option<String>, section: &str) -> Result<String> {
    endpoint
        .as_deref()
        .map(|e| e.trim_end_matches('/').to_string())
        .filter(|e| !e.is_empty())
        .ok_or_else(|| AppError::Configuration {
            message: format!("{}.endpoint is required for the http backend", section),
        })
}

/// Map a non-success status to an execution failure carrying the body
async fn check_status(response: reqwest::Response, component: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(AppError::execution(component, format!("HTTP {}: {}", status, body)))
}

/// Segmentation model served over HTTP
///
/// `POST {endpoint}` with the invocation plan, answered by
/// `{"predictions": {"<entity id>": {"cluster_id": 5, ...}}}`.
pub struct HttpPredictor {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct PredictResponse {
    predictions: Predictions,
}

impl HttpPredictor {
    pub fn new(config: &PredictorConfig) -> Result<Self> {
        Ok(Self {
            endpoint: require_endpoint(&config.endpoint, "predictor")?,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl ModelPredictor for HttpPredictor {
    async fn predict(&self, plan: &ModelInvocationPlan) -> Result<Predictions> {
        let response = self.client.post(&self.endpoint).json(plan).send().await?;
        let response = check_status(response, "model_predictor").await?;
        let body: PredictResponse = response.json().await?;
        Ok(body.predictions)
    }
}

/// Vision and review service
///
/// `POST {endpoint}/describe` returns `{"description": "..."}` and
/// `GET {endpoint}/reviews/{id}` returns `{"reviews": ["..."]}`.
pub struct HttpDescriber {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct DescribeRequest<'a> {
    image_url: &'a str,
    product_name: &'a str,
}

#[derive(Deserialize)]
struct DescribeResponse {
    description: String,
}

#[derive(Deserialize)]
struct ReviewsResponse {
    #[serde(default)]
    reviews: Vec<String>,
}

impl HttpDescriber {
    pub fn new(config: &DescriberConfig) -> Result<Self> {
        Ok(Self {
            endpoint: require_endpoint(&config.endpoint, "describer")?,
            client: build_client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl MultimodalDescriber for HttpDescriber {
    async fn describe(&self, image: &ProductImage) -> Result<String> {
        let request = DescribeRequest {
            image_url: &image.image_url,
            product_name: &image.name,
        };
        let response = self
            .client
            .post(format!("{}/describe", self.endpoint))
            .json(&request)
            .send()
            .await?;
        let response = check_status(response, "image_describer").await?;
        let body: DescribeResponse = response.json().await?;

        let description = body.description.trim();
        if description.is_empty() {
            return Err(AppError::execution("image_describer", "empty description"));
        }
        Ok(description.to_string())
    }

    async fn fetch_reviews(&self, entity_id: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/reviews/{}", self.endpoint, entity_id))
            .send()
            .await?;
        let response = check_status(response, "review_fetcher").await?;
        let body: ReviewsResponse = response.json().await?;
        Ok(body.reviews)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    #[test]
    fn test_endpoint_is_required() {
        let config = PredictorConfig {
            kind: BackendKind::Http,
            endpoint: None,
            timeout_secs: 5,
        };
        let err = HttpPredictor::new(&config).err().unwrap();
        assert!(matches!(err, AppError::Configuration { .. }));
    }

    #[test]
    fn test_endpoint_trailing_slash_is_trimmed() {
        let endpoint = require_endpoint(&Some("http://describer:8000/".into()), "describer").unwrap();
        assert_eq!(endpoint, "http://describer:8000");
    }

    #[test]
    fn test_prediction_payload_parses() {
        let body: PredictResponse = serde_json::from_str(
            r#"{"predictions": {"17490": {"cluster_id": 3, "confidence": 0.91}}}"#,
        )
        .unwrap();
        assert_eq!(body.predictions["17490"].cluster_id, 3);
        assert_eq!(body.predictions["17490"].distance, None);
    }
}
