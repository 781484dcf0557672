//! Reasoning service client (OpenAI-compatible chat completions)

use crate::config::ReasoningConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{PromptContext, ReasoningService};

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

/// Chat completions over HTTP
pub struct OpenAiReasoning {
    config: ReasoningConfig,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiReasoning {
    pub fn new(config: ReasoningConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            config,
            api_key: api_key.into(),
            client,
        })
    }
}

#[async_trait]
impl ReasoningService for OpenAiReasoning {
    async fn complete(&self, prompt: &PromptContext) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::execution(
                "reasoning",
                format!("LLM API error {}: {}", status, body),
            ));
        }

        let chat_response: ChatResponse = response.json().await?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| AppError::execution("reasoning", "Empty response from LLM"))
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

/// Client for the configured endpoint, or `None` without an API key
pub fn create_reasoning_service(config: &ReasoningConfig) -> Result<Option<Arc<dyn ReasoningService>>> {
    let api_key = match config.api_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => return Ok(None),
    };

    let service = OpenAiReasoning::new(config.clone(), api_key)?;
    tracing::info!(model = %config.model, "Reasoning service configured");
    Ok(Some(Arc::new(service)))
}
