//! StoreSage Common Library
//!
//! Shared code for the StoreSage services including:
//! - Schema catalog for the retail tables and the segmentation model
//! - Hybrid query orchestration engine (one user turn at a time)
//! - External service ports and adapters
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod catalog;
pub mod config;
pub mod engine;
pub mod errors;
pub mod metrics;
pub mod services;

// Re-export commonly used types
pub use catalog::SchemaCatalog;
pub use config::AppConfig;
pub use engine::{Answer, ErrorReport, Orchestrator};
pub use errors::{AppError, Result};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default segmentation model identifier
pub const DEFAULT_MODEL_ID: &str = "customer_segments";
