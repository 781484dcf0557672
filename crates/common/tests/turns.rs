//! End-to-end turns against the fixture-backed services

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use storesage_common::config::{ImagesConfig, OrchestratorConfig};
use storesage_common::engine::{
    Archetype, Component, ModelInvocationPlan, QueryPlan, StepOutcome, TurnState,
};
use storesage_common::errors::{ErrorKind, Result};
use storesage_common::services::images::ImageSource;
use storesage_common::services::memory::{Fixture, InMemoryDescriber, InMemoryExecutor, InMemoryPredictor};
use storesage_common::services::{
    ModelPredictor, MultimodalDescriber, Predictions, ProductImage, ProductImageLocator,
    PromptContext, ReasoningService, Row, Services, StructuredQueryExecutor,
};
use storesage_common::{AppError, Orchestrator, SchemaCatalog};
use tokio_test::{assert_err, assert_ok};

const MULTIMODAL_QUESTION: &str =
    "Show me the reviews and analyze the image for the 'SET OF 3 REGENCY CAKE TINS'.";

fn fixture() -> Arc<Fixture> {
    Arc::new(Fixture::from_json(include_str!("../../../config/fixtures.json")).unwrap())
}

fn services() -> Services {
    let fixture = fixture();
    Services {
        reasoning: None,
        executor: Arc::new(InMemoryExecutor::new(fixture.clone())),
        predictor: Arc::new(InMemoryPredictor::new(fixture.clone())),
        describer: Arc::new(InMemoryDescriber::new(fixture)),
        images: Arc::new(ProductImageLocator::from_config(&ImagesConfig::default()).unwrap()),
    }
}

fn orchestrator(services: Services) -> Orchestrator {
    orchestrator_with(services, OrchestratorConfig::default())
}

fn orchestrator_with(services: Services, config: OrchestratorConfig) -> Orchestrator {
    Orchestrator::new(Arc::new(SchemaCatalog::retail()), services, config).unwrap()
}

fn numbered_lines(text: &str) -> Vec<&str> {
    text.lines()
        .filter(|line| {
            line.split_once(". ")
                .map_or(false, |(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        })
        .collect()
}

fn markers(text: &str) -> Vec<usize> {
    text.split('[')
        .skip(1)
        .filter_map(|rest| rest.split_once(']'))
        .filter_map(|(n, _)| n.parse().ok())
        .collect()
}

struct SlowPredictor {
    delay: Duration,
}

#[async_trait]
impl ModelPredictor for SlowPredictor {
    async fn predict(&self, _plan: &ModelInvocationPlan) -> Result<Predictions> {
        tokio::time::sleep(self.delay).await;
        Ok(Predictions::new())
    }
}

struct BrokenCamera {
    inner: InMemoryDescriber,
}

#[async_trait]
impl MultimodalDescriber for BrokenCamera {
    async fn describe(&self, _image: &ProductImage) -> Result<String> {
        Err(AppError::execution("image_describer", "vision model unavailable"))
    }

    async fn fetch_reviews(&self, entity_id: &str) -> Result<Vec<String>> {
        self.inner.fetch_reviews(entity_id).await
    }
}

struct SlowImageSource;

#[async_trait]
impl ImageSource for SlowImageSource {
    fn name(&self) -> &str {
        "slow"
    }

    async fn find(&self, _product_name: &str) -> Result<Option<String>> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(None)
    }
}

struct FlakyExecutor {
    inner: InMemoryExecutor,
    calls: AtomicUsize,
    first_error: fn() -> AppError,
}

impl FlakyExecutor {
    fn new(first_error: fn() -> AppError) -> Self {
        Self {
            inner: InMemoryExecutor::new(fixture()),
            calls: AtomicUsize::new(0),
            first_error,
        }
    }
}

#[async_trait]
impl StructuredQueryExecutor for FlakyExecutor {
    async fn execute(&self, plan: &QueryPlan) -> Result<Vec<Row>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err((self.first_error)());
        }
        self.inner.execute(plan).await
    }
}

struct ScriptedReasoning {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedReasoning {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
        })
    }
}

#[async_trait]
impl ReasoningService for ScriptedReasoning {
    async fn complete(&self, _prompt: &PromptContext) -> Result<String> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AppError::execution("reasoning", "no scripted reply left"))
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

#[tokio::test]
async fn test_ten_most_expensive_products() {
    let answer = assert_ok!(
        orchestrator(services())
            .handle_turn("Show me the 10 most expensive products in the store.")
            .await
    );

    assert_eq!(answer.archetype, Archetype::AggregateTopN);
    let rows = numbered_lines(&answer.text);
    assert_eq!(rows.len(), 10);
    assert!(rows[0].contains("REGENCY CAKESTAND 3 TIER"));
    assert!(rows[1].contains("22752"));
    // Equal prices keep ascending stock code order
    assert!(rows[2].contains("22666"));
    assert!(rows[3].contains("22720"));
    assert!(!answer.text.contains("84879"));
    assert!(!answer.partial);
    assert_eq!(answer.trace.current(), TurnState::Done);
}

#[tokio::test]
async fn test_best_sellers_show_product_names() {
    let answer = assert_ok!(
        orchestrator(services())
            .handle_turn("What are the 3 best-selling products?")
            .await
    );

    assert_eq!(answer.archetype, Archetype::AggregateTopN);
    assert_eq!(
        numbered_lines(&answer.text),
        vec![
            "1. stock_code: 85123A, description: WHITE HANGING HEART T-LIGHT HOLDER, count: 3",
            "2. stock_code: 22720, description: SET OF 3 REGENCY CAKE TINS, count: 2",
            "3. stock_code: 22423, description: REGENCY CAKESTAND 3 TIER, count: 1",
        ]
    );
}

#[tokio::test]
async fn test_cluster_of_one_customer() {
    let answer = assert_ok!(
        orchestrator(services())
            .handle_turn("Which cluster does customer 17490 belong to?")
            .await
    );

    assert_eq!(answer.archetype, Archetype::ModelPredictLookup);
    assert!(answer.text.contains("customer 17490 is in cluster 3"));
    assert_eq!(answer.citations.len(), 1);
    assert_eq!(answer.citations[0].component, Component::ModelPredictor);
}

#[tokio::test]
async fn test_top_countries_in_cluster_run_in_order() {
    let answer = assert_ok!(
        orchestrator(services())
            .handle_turn("What are the top 3 countries for customers who are in cluster 5?")
            .await
    );

    assert_eq!(answer.archetype, Archetype::CrossFilterByModelOutput);
    assert_eq!(
        numbered_lines(&answer.text),
        vec![
            "1. country: United Kingdom, count: 3",
            "2. country: France, count: 2",
            "3. country: Germany, count: 2",
        ]
    );

    let model_step = answer
        .trace
        .steps
        .iter()
        .position(|s| s.component == Component::ModelPredictor)
        .unwrap();
    let query_step = answer
        .trace
        .steps
        .iter()
        .position(|s| s.component == Component::StructuredQuery)
        .unwrap();
    assert!(model_step < query_step);

    // Structured facts come before model facts
    assert_eq!(answer.citations[0].component, Component::StructuredQuery);
    assert_eq!(answer.citations[1].component, Component::ModelPredictor);
}

#[tokio::test]
async fn test_reviews_and_image_for_named_product() {
    let answer = assert_ok!(
        orchestrator(services())
            .handle_turn(MULTIMODAL_QUESTION)
            .await
    );

    assert_eq!(answer.archetype, Archetype::MultimodalEntityReport);
    assert!(answer.trace.states.contains(&TurnState::Fusing));

    let components: Vec<Component> = answer.citations.iter().map(|c| c.component).collect();
    assert_eq!(
        components,
        vec![
            Component::EntityResolution,
            Component::ReviewFetcher,
            Component::ImageDescriber,
        ]
    );
    assert!(answer
        .citations
        .iter()
        .all(|c| c.entity_id.as_deref() == Some("22720")));
    assert!(answer.text.contains("3 review(s) of SET OF 3 REGENCY CAKE TINS"));
    assert!(answer.text.contains("Regency floral border"));

    // Resolution happens before any fusion call
    let resolution = answer.trace.steps_of(Component::EntityResolution).count();
    assert_eq!(resolution, 1);
    assert_eq!(answer.trace.steps[0].component, Component::EntityResolution);
}

#[tokio::test]
async fn test_every_marker_is_cited_and_every_citation_used() {
    let answer = assert_ok!(
        orchestrator(services())
            .handle_turn(MULTIMODAL_QUESTION)
            .await
    );

    let used = markers(&answer.text);
    assert!(!used.is_empty());
    for index in &used {
        assert!(answer.citations.iter().any(|c| c.index == *index));
    }
    for citation in &answer.citations {
        assert!(used.contains(&citation.index));
    }
}

#[tokio::test]
async fn test_ambiguous_name_asks_for_clarification() {
    let report = assert_err!(
        orchestrator(services())
            .handle_turn("Show me the reviews for 'CAKE TINS'")
            .await
    );

    assert_eq!(report.kind, ErrorKind::AmbiguousEntity);
    assert!(report.needs_clarification);
    assert_eq!(report.candidates.len(), 2);
    assert!(report.candidates.iter().any(|c| c.contains("22666")));
    assert!(report.candidates.iter().any(|c| c.contains("22720")));
    assert_eq!(report.trace.current(), TurnState::Errored(ErrorKind::AmbiguousEntity));
    assert_eq!(report.trace.steps_of(Component::ReviewFetcher).count(), 0);
}

#[tokio::test]
async fn test_exact_name_beats_longer_matches() {
    let fixture = Arc::new(
        Fixture::from_json(
            r#"{
                "tables": {
                    "products": [
                        {"stock_code": "10000", "description": "RED HEART A BOX", "unit_price": 1.25},
                        {"stock_code": "10001", "description": "RED HEART B BOX", "unit_price": 1.25},
                        {"stock_code": "10002", "description": "RED HEART C BOX", "unit_price": 1.25},
                        {"stock_code": "10003", "description": "RED HEART D BOX", "unit_price": 1.25},
                        {"stock_code": "10004", "description": "RED HEART E BOX", "unit_price": 1.25},
                        {"stock_code": "20000", "description": "RED HEART", "unit_price": 2.10}
                    ]
                },
                "reviews": {"20000": ["Bright and sturdy."]}
            }"#,
        )
        .unwrap(),
    );
    let services = Services {
        reasoning: None,
        executor: Arc::new(InMemoryExecutor::new(fixture.clone())),
        predictor: Arc::new(InMemoryPredictor::new(fixture.clone())),
        describer: Arc::new(InMemoryDescriber::new(fixture)),
        images: Arc::new(ProductImageLocator::from_config(&ImagesConfig::default()).unwrap()),
    };

    let answer = assert_ok!(
        orchestrator(services)
            .handle_turn("Show me the reviews for 'RED HEART'")
            .await
    );

    assert!(!answer.partial);
    assert!(answer
        .citations
        .iter()
        .all(|c| c.entity_id.as_deref() == Some("20000")));
    assert!(answer.text.contains("Bright and sturdy."));
    assert_eq!(answer.trace.steps_of(Component::EntityResolution).count(), 1);
}

#[tokio::test]
async fn test_unknown_product_is_not_found() {
    let report = assert_err!(
        orchestrator(services())
            .handle_turn("Show me the reviews for 'FLYING TEAPOT'")
            .await
    );
    assert_eq!(report.kind, ErrorKind::EntityNotFound);
}

#[tokio::test]
async fn test_failed_image_gives_partial_answer() {
    let mut services = services();
    services.describer = Arc::new(BrokenCamera {
        inner: InMemoryDescriber::new(fixture()),
    });

    let answer = assert_ok!(
        orchestrator(services)
            .handle_turn(MULTIMODAL_QUESTION)
            .await
    );

    assert!(answer.partial);
    assert_eq!(answer.missing.len(), 1);
    assert_eq!(answer.missing[0].component, Component::ImageDescriber);
    assert!(answer.text.contains("Partial answer"));
    assert!(answer.text.contains("vision model unavailable"));
    assert!(answer
        .citations
        .iter()
        .any(|c| c.component == Component::ReviewFetcher));

    // The describer is not retried
    let describe = answer.trace.steps_of(Component::ImageDescriber).next().unwrap();
    assert_eq!(describe.attempts, 1);
    assert_eq!(describe.outcome, StepOutcome::Failed);
}

#[tokio::test]
async fn test_image_lookup_timeout_skips_description() {
    let mut services = services();
    services.images = Arc::new(
        ProductImageLocator::new(vec![Arc::new(SlowImageSource)], reqwest::Client::new(), false).unwrap(),
    );
    let config = OrchestratorConfig {
        call_timeout_ms: 200,
        ..OrchestratorConfig::default()
    };

    let answer = assert_ok!(
        orchestrator_with(services, config)
            .handle_turn(MULTIMODAL_QUESTION)
            .await
    );

    assert!(answer.partial);
    let missing: Vec<Component> = answer.missing.iter().map(|m| m.component).collect();
    assert!(missing.contains(&Component::ImageLocator));
    assert!(missing.contains(&Component::ImageDescriber));
    assert!(answer.text.contains("Partial answer"));
    assert!(answer
        .citations
        .iter()
        .any(|c| c.component == Component::ReviewFetcher));
    assert!(answer
        .citations
        .iter()
        .all(|c| c.component != Component::ImageDescriber));

    let locate = answer.trace.steps_of(Component::ImageLocator).next().unwrap();
    assert_eq!(locate.outcome, StepOutcome::Failed);
    let describe = answer.trace.steps_of(Component::ImageDescriber).next().unwrap();
    assert_eq!(describe.outcome, StepOutcome::NotStarted);
    assert_eq!(describe.attempts, 0);
}

#[tokio::test]
async fn test_model_timeout_fails_the_turn() {
    let mut services = services();
    services.predictor = Arc::new(SlowPredictor {
        delay: Duration::from_millis(500),
    });
    let config = OrchestratorConfig {
        call_timeout_ms: 50,
        retry_idempotent: false,
        ..OrchestratorConfig::default()
    };

    let report = assert_err!(
        orchestrator_with(services, config)
            .handle_turn("Which cluster does customer 17490 belong to?")
            .await
    );

    assert_eq!(report.kind, ErrorKind::ExecutionFailed);
    assert!(report.message.contains("timed out"));
    assert_eq!(report.trace.current(), TurnState::Errored(ErrorKind::ExecutionFailed));
}

#[tokio::test]
async fn test_dependent_query_not_started_after_model_timeout() {
    let mut services = services();
    services.predictor = Arc::new(SlowPredictor {
        delay: Duration::from_millis(500),
    });
    let config = OrchestratorConfig {
        call_timeout_ms: 50,
        ..OrchestratorConfig::default()
    };

    let report = assert_err!(
        orchestrator_with(services, config)
            .handle_turn("What are the top 3 countries for customers who are in cluster 5?")
            .await
    );

    assert_eq!(report.kind, ErrorKind::ExecutionFailed);
    let model = report.trace.steps_of(Component::ModelPredictor).next().unwrap();
    assert_eq!(model.attempts, 2);
    assert_eq!(report.trace.steps_of(Component::StructuredQuery).count(), 1);
    assert!(report
        .trace
        .steps_of(Component::StructuredQuery)
        .all(|s| s.outcome == StepOutcome::NotStarted));
}

#[tokio::test]
async fn test_transient_query_failure_is_retried_once() {
    let mut services = services();
    services.executor = Arc::new(FlakyExecutor::new(|| AppError::Database(sqlx::Error::PoolTimedOut)));

    let answer = assert_ok!(
        orchestrator(services)
            .handle_turn("Show me the 10 most expensive products in the store.")
            .await
    );

    let step = answer.trace.steps_of(Component::StructuredQuery).next().unwrap();
    assert_eq!(step.attempts, 2);
    assert_eq!(step.outcome, StepOutcome::Succeeded);
    assert!(!answer.partial);
}

#[tokio::test]
async fn test_rejected_query_is_not_retried() {
    let mut services = services();
    services.executor = Arc::new(FlakyExecutor::new(|| {
        AppError::execution("structured_query", "permission denied for table products")
    }));

    let report = assert_err!(
        orchestrator(services)
            .handle_turn("Show me the 10 most expensive products in the store.")
            .await
    );

    assert_eq!(report.kind, ErrorKind::ExecutionFailed);
    assert!(report.message.contains("permission denied"));
    let step = report.trace.steps_of(Component::StructuredQuery).next().unwrap();
    assert_eq!(step.attempts, 1);
    assert_eq!(step.outcome, StepOutcome::Failed);
}

#[tokio::test]
async fn test_unsupported_question_is_unresolved() {
    let report = assert_err!(
        orchestrator(services())
            .handle_turn("Tell me a joke about spreadsheets")
            .await
    );

    assert_eq!(report.kind, ErrorKind::IntentUnresolved);
    assert_eq!(report.status_code().as_u16(), 422);
    assert_eq!(report.trace.states.len(), 2);
}

#[tokio::test]
async fn test_empty_cluster_skips_structured_fetch() {
    let answer = assert_ok!(
        orchestrator(services())
            .handle_turn("What are the top 3 countries for customers who are in cluster 7?")
            .await
    );

    assert_eq!(answer.archetype, Archetype::CrossFilterByModelOutput);
    assert!(!answer.partial);
    assert!(answer.text.contains("No rows matched"));
    assert!(numbered_lines(&answer.text).is_empty());

    let query = answer.trace.steps_of(Component::StructuredQuery).next().unwrap();
    assert_eq!(query.outcome, StepOutcome::Skipped);
    assert_eq!(query.attempts, 0);
    assert!(answer
        .citations
        .iter()
        .any(|c| c.component == Component::StructuredQuery));
}

#[tokio::test]
async fn test_customer_and_cluster_together_is_ambiguous() {
    let report = assert_err!(
        orchestrator(services())
            .handle_turn("Is customer 17490 in cluster 5?")
            .await
    );

    assert_eq!(report.kind, ErrorKind::AmbiguousInvocation);
    assert!(report.needs_clarification);
    assert_eq!(
        report.trace.states,
        vec![
            TurnState::Classifying,
            TurnState::Planning,
            TurnState::Errored(ErrorKind::AmbiguousInvocation),
        ]
    );
    assert!(report.trace.steps.is_empty());
}

#[tokio::test]
async fn test_grouping_table_without_model_key_is_schema_mismatch() {
    let reasoning = ScriptedReasoning::new(&[r#"{"archetype": "cross_filter_by_model_output",
        "cluster_id": 5,
        "group_by": {"table": "products", "column": "description"}}"#]);
    let mut services = services();
    services.reasoning = Some(reasoning);

    let report = assert_err!(
        orchestrator(services)
            .handle_turn("Summarise what cluster 5 tends to buy")
            .await
    );

    assert_eq!(report.kind, ErrorKind::SchemaMismatch);
    assert!(!report.needs_clarification);
    assert_eq!(report.status_code().as_u16(), 500);
    assert_eq!(report.trace.current(), TurnState::Errored(ErrorKind::SchemaMismatch));
    assert_eq!(report.trace.steps_of(Component::Reasoning).count(), 1);
    assert_eq!(report.trace.steps_of(Component::ModelPredictor).count(), 0);
}

#[tokio::test]
async fn test_reasoning_fallback_and_narration() {
    let reasoning = ScriptedReasoning::new(&[
        r#"{"archetype": "aggregate_top_n",
            "sort": {"table": "products", "column": "unit_price", "descending": false},
            "limit": 4}"#,
        "The cheapest item is the bird ornament [1].",
    ]);
    let mut services = services();
    services.reasoning = Some(reasoning);

    let answer = assert_ok!(
        orchestrator(services)
            .handle_turn("Tell me a joke about spreadsheets")
            .await
    );

    assert_eq!(answer.archetype, Archetype::AggregateTopN);
    assert!(answer.narrated);
    assert_eq!(answer.text, "The cheapest item is the bird ornament [1].");
    assert_eq!(answer.trace.steps_of(Component::Reasoning).count(), 2);
}

#[tokio::test]
async fn test_narration_with_unknown_citation_is_discarded() {
    let reasoning = ScriptedReasoning::new(&["Customer 17490 is in cluster 3 [1], see also [4]."]);
    let mut services = services();
    services.reasoning = Some(reasoning);

    let answer = assert_ok!(
        orchestrator(services)
            .handle_turn("Which cluster does customer 17490 belong to?")
            .await
    );

    assert!(!answer.narrated);
    assert!(answer.text.contains("customer 17490 is in cluster 3 (confidence 0.87) [1]."));
}
