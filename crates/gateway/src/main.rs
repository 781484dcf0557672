//! StoreSage API Gateway
//!
//! The entry point for questions about the retail store.
//! Handles:
//! - Turn requests routed to the hybrid query orchestrator
//! - Rate limiting
//! - Health, readiness and catalog endpoints
//! - Observability (logging, metrics)

mod handlers;
mod middleware;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use storesage_common::{
    config::AppConfig,
    metrics,
    services::build_services,
    Orchestrator, SchemaCatalog,
};
use tokio::signal;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use middleware::rate_limit::{rate_limit_middleware, TurnLimiter};

/// Maximum concurrent requests (backpressure control)
const MAX_CONCURRENT_REQUESTS: usize = 100;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub orchestrator: Arc<Orchestrator>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;
    init_tracing(&config);

    info!("Starting StoreSage API Gateway v{}", storesage_common::VERSION);

    let config = Arc::new(config);

    // Initialize metrics
    let handle = prometheus_builder()?.install_recorder()?;
    metrics::register_metrics();

    let catalog = match &config.catalog.path {
        Some(path) => SchemaCatalog::from_json_file(path)?,
        None => SchemaCatalog::retail(),
    };
    info!(tables = catalog.tables().count(), model = %catalog.model().model_id, "Schema catalog loaded");

    let services = build_services(&config).await?;
    let orchestrator = Orchestrator::new(Arc::new(catalog), services, config.orchestrator.clone())?;

    let state = AppState {
        config: config.clone(),
        orchestrator: Arc::new(orchestrator),
    };

    serve_metrics(handle, config.observability.metrics_port).await?;

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Exporter with the turn and call latency buckets
fn prometheus_builder() -> anyhow::Result<PrometheusBuilder> {
    let mut builder = PrometheusBuilder::new();
    for (name, buckets) in metrics::histogram_buckets() {
        builder = builder.set_buckets_for_metric(Matcher::Full(name), buckets)?;
    }
    Ok(builder)
}

/// Prometheus scrape endpoint on its own port
async fn serve_metrics(handle: PrometheusHandle, port: u16) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(move || async move { handle.render() }));
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    info!("Metrics listening on {}", port);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "Metrics server stopped");
        }
    });
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let mut turn_routes = Router::new().route("/turns", post(handlers::turns::handle_turn));
    if state.config.rate_limit.enabled {
        let limiter = TurnLimiter::new(
            state.config.rate_limit.requests_per_second,
            state.config.rate_limit.burst,
        );
        turn_routes = turn_routes.layer(axum::middleware::from_fn(
            move |request: axum::extract::Request, next: axum::middleware::Next| {
                rate_limit_middleware(limiter.clone(), request, next)
            },
        ));
    }

    // API routes
    let api_routes = Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        // Catalog
        .route("/catalog", get(handlers::catalog::get_catalog))
        .merge(turn_routes);

    let request_timeout = Duration::from_secs(state.config.server.request_timeout_secs);

    // Compose the app
    Router::new()
        .nest("/v1", api_routes)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use storesage_common::config::ImagesConfig;
    use storesage_common::services::memory::{
        Fixture, InMemoryDescriber, InMemoryExecutor, InMemoryPredictor,
    };
    use storesage_common::services::{ProductImageLocator, Services};
    use tokio_test::assert_ok;
    use tower::ServiceExt;

    fn test_state(config: AppConfig) -> AppState {
        let fixture =
            Arc::new(Fixture::from_json(include_str!("../../../config/fixtures.json")).unwrap());
        let services = Services {
            reasoning: None,
            executor: Arc::new(InMemoryExecutor::new(fixture.clone())),
            predictor: Arc::new(InMemoryPredictor::new(fixture.clone())),
            describer: Arc::new(InMemoryDescriber::new(fixture)),
            images: Arc::new(ProductImageLocator::from_config(&ImagesConfig::default()).unwrap()),
        };
        let orchestrator = Orchestrator::new(
            Arc::new(SchemaCatalog::retail()),
            services,
            config.orchestrator.clone(),
        )
        .unwrap();

        AppState {
            config: Arc::new(config),
            orchestrator: Arc::new(orchestrator),
        }
    }

    fn turn_request(question: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/turns")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({ "question": question }).to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_turn_latency_uses_turn_buckets() {
        let recorder = prometheus_builder().unwrap().build_recorder();
        let handle = recorder.handle();
        ::metrics::with_local_recorder(&recorder, || {
            metrics::record_turn(0.3, "aggregate_top_n", "done");
        });

        let rendered = handle.render();
        assert!(rendered.contains("storesage_turn_duration_seconds_bucket{"));
        assert!(rendered.contains("le=\"0.5\""));
        assert!(!rendered.contains("storesage_turn_duration_seconds{archetype=\"aggregate_top_n\",quantile"));
    }

    #[tokio::test]
    async fn test_turn_returns_answer() {
        let app = create_router(test_state(AppConfig::default()));
        let response = assert_ok!(
            app
                .oneshot(turn_request("Which cluster does customer 17490 belong to?"))
                .await
        );

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let body = json_body(response).await;
        assert_eq!(body["archetype"], "model_predict_lookup");
        assert_eq!(body["citations"][0]["component"], "model_predictor");
    }

    #[tokio::test]
    async fn test_ambiguous_turn_is_unprocessable() {
        let app = create_router(test_state(AppConfig::default()));
        let response = assert_ok!(
            app
                .oneshot(turn_request("Show me the reviews for 'CAKE TINS'"))
                .await
        );

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await;
        assert_eq!(body["needs_clarification"], true);
        assert_eq!(body["candidates"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_question_is_rejected() {
        let app = create_router(test_state(AppConfig::default()));
        let response = assert_ok!(app.oneshot(turn_request("")).await);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_rate_limit_applies_to_turns_only() {
        let mut config = AppConfig::default();
        config.rate_limit.requests_per_second = 1;
        config.rate_limit.burst = 1;
        let app = create_router(test_state(config));

        let first = assert_ok!(
            app
                .clone()
                .oneshot(turn_request("Tell me a joke about spreadsheets"))
                .await
        );
        assert_eq!(first.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let second = assert_ok!(
            app
                .clone()
                .oneshot(turn_request("Tell me a joke about spreadsheets"))
                .await
        );
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        let health = assert_ok!(
            app
                .oneshot(Request::builder().uri("/v1/health").body(Body::empty()).unwrap())
                .await
        );
        assert_eq!(health.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_and_catalog() {
        let app = create_router(test_state(AppConfig::default()));

        let ready = assert_ok!(
            app
                .clone()
                .oneshot(Request::builder().uri("/v1/ready").body(Body::empty()).unwrap())
                .await
        );
        assert_eq!(ready.status(), StatusCode::OK);
        assert_eq!(json_body(ready).await["checks"]["reasoning"]["status"], "disabled");

        let catalog = assert_ok!(
            app
                .oneshot(Request::builder().uri("/v1/catalog").body(Body::empty()).unwrap())
                .await
        );
        assert_eq!(catalog.status(), StatusCode::OK);
        let body = json_body(catalog).await;
        assert!(body["tables"]["products"].is_object());
        assert_eq!(body["model"]["model_id"], "customer_segments");
    }
}
