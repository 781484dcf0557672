//! Configuration management for StoreSage services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Schema catalog source
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Reasoning (LLM) service
    #[serde(default)]
    pub reasoning: ReasoningConfig,

    /// Structured query executor
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Segmentation model predictor
    #[serde(default)]
    pub predictor: PredictorConfig,

    /// Image and review describer
    #[serde(default)]
    pub describer: DescriberConfig,

    /// Product image location
    #[serde(default)]
    pub images: ImagesConfig,

    /// Turn orchestration limits
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log filter directive (e.g. "info", "storesage_common=debug")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second (global)
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CatalogConfig {
    /// JSON catalog file; the built-in retail catalog is used when absent
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReasoningConfig {
    /// Chat completions endpoint
    #[serde(default = "default_reasoning_endpoint")]
    pub endpoint: String,

    /// API key (service is treated as unavailable when empty)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model name
    #[serde(default = "default_reasoning_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_reasoning_timeout")]
    pub timeout_secs: u64,

    /// Maximum output tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

/// Backend selection shared by the executor, predictor and describer
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// PostgreSQL (executor only)
    Postgres,
    /// JSON over HTTP (predictor, describer)
    Http,
    /// Fixture-backed in-memory implementation
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_executor_kind")]
    pub kind: BackendKind,

    /// PostgreSQL URL
    #[serde(default)]
    pub database_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Fixture file for in-memory backends
    #[serde(default = "default_fixture_path")]
    pub fixture_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PredictorConfig {
    #[serde(default = "default_service_kind")]
    pub kind: BackendKind,

    /// Prediction endpoint (POST)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DescriberConfig {
    #[serde(default = "default_service_kind")]
    pub kind: BackendKind,

    /// Base URL exposing `/describe` and `/reviews/{id}`
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_describer_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImagesConfig {
    /// JSON file of previously located product images
    #[serde(default)]
    pub lookup_path: Option<String>,

    /// Image search endpoint returning `{"results": [{"image": url}]}`
    #[serde(default)]
    pub search_endpoint: Option<String>,

    /// Issue a HEAD request to confirm candidates are images
    #[serde(default = "default_validate_images")]
    pub validate: bool,

    /// Request timeout in seconds
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    /// Timeout applied to every external call, in milliseconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Row limit when the question does not ask for one
    #[serde(default = "default_row_limit")]
    pub default_row_limit: usize,

    /// Hard ceiling for any requested row limit
    #[serde(default = "default_max_row_limit")]
    pub max_row_limit: usize,

    /// Retry idempotent calls once on transient failure
    #[serde(default = "default_enabled")]
    pub retry_idempotent: bool,

    /// Let the reasoning service phrase the final answer
    #[serde(default = "default_enabled")]
    pub narrate: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 60 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "storesage".to_string() }
fn default_rate_limit() -> u32 { 20 }
fn default_burst() -> u32 { 40 }
fn default_enabled() -> bool { true }
fn default_reasoning_endpoint() -> String { "https://api.openai.com/v1/chat/completions".to_string() }
fn default_reasoning_model() -> String { "gpt-4o-mini".to_string() }
fn default_reasoning_timeout() -> u64 { 30 }
fn default_max_tokens() -> usize { 800 }
fn default_temperature() -> f32 { 0.2 }
fn default_executor_kind() -> BackendKind { BackendKind::Postgres }
fn default_service_kind() -> BackendKind { BackendKind::Http }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_fixture_path() -> String { "config/fixtures.json".to_string() }
fn default_service_timeout() -> u64 { 15 }
fn default_describer_timeout() -> u64 { 45 }
fn default_validate_images() -> bool { false }
fn default_call_timeout() -> u64 { 20_000 }
fn default_row_limit() -> usize { 10 }
fn default_max_row_limit() -> usize { 50 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            endpoint: default_reasoning_endpoint(),
            api_key: None,
            model: default_reasoning_model(),
            timeout_secs: default_reasoning_timeout(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: default_executor_kind(),
            database_url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            fixture_path: default_fixture_path(),
        }
    }
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            kind: default_service_kind(),
            endpoint: None,
            timeout_secs: default_service_timeout(),
        }
    }
}

impl Default for DescriberConfig {
    fn default() -> Self {
        Self {
            kind: default_service_kind(),
            endpoint: None,
            timeout_secs: default_describer_timeout(),
        }
    }
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            lookup_path: None,
            search_endpoint: None,
            validate: default_validate_images(),
            timeout_secs: default_service_timeout(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout(),
            default_row_limit: default_row_limit(),
            max_row_limit: default_max_row_limit(),
            retry_idempotent: default_enabled(),
            narrate: default_enabled(),
        }
    }
}

impl OrchestratorConfig {
    /// Per-call timeout as Duration
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__ORCHESTRATOR__CALL_TIMEOUT_MS=5000
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Load from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject settings the orchestrator cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = &self.orchestrator;
        if limits.default_row_limit == 0 || limits.max_row_limit == 0 {
            return Err(ConfigError::Message(
                "orchestrator row limits must be positive".to_string(),
            ));
        }
        if limits.default_row_limit > limits.max_row_limit {
            return Err(ConfigError::Message(format!(
                "orchestrator.default_row_limit ({}) exceeds max_row_limit ({})",
                limits.default_row_limit, limits.max_row_limit
            )));
        }
        if limits.call_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "orchestrator.call_timeout_ms must be positive".to_string(),
            ));
        }
        if self.executor.kind == BackendKind::Postgres && self.executor.database_url.is_none() {
            return Err(ConfigError::Message(
                "executor.database_url is required for the postgres executor".to_string(),
            ));
        }
        Ok(())
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Whether the reasoning service has credentials
    pub fn reasoning_enabled(&self) -> bool {
        self.reasoning
            .api_key
            .as_deref()
            .map_or(false, |key| !key.is_empty())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
            catalog: CatalogConfig::default(),
            reasoning: ReasoningConfig::default(),
            executor: ExecutorConfig::default(),
            predictor: PredictorConfig::default(),
            describer: DescriberConfig::default(),
            images: ImagesConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.orchestrator.default_row_limit, 10);
        assert_eq!(config.orchestrator.max_row_limit, 50);
        assert!(!config.reasoning_enabled());
    }

    #[test]
    fn test_postgres_requires_url() {
        let config = AppConfig::default();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.executor.kind = BackendKind::Memory;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_limit_cannot_exceed_ceiling() {
        let mut config = AppConfig::default();
        config.executor.kind = BackendKind::Memory;
        config.orchestrator.default_row_limit = 100;
        assert!(config.validate().is_err());
    }
}
