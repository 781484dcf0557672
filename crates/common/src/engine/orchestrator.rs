//! Orchestrator - drives one turn through the state machine
//!
//! Classifying, Planning, Executing, optional Fusing, Synthesizing, then
//! exactly one of Done or Errored. Every external call goes through
//! `Orchestrator::call`, which applies the per-call timeout, the single
//! retry for idempotent reads, metrics and the turn trace.

use crate::catalog::SchemaCatalog;
use crate::config::OrchestratorConfig;
use crate::errors::{AppError, ErrorCode, ErrorKind, Result};
use crate::metrics;
use crate::services::{cell_text, Predictions, Row, Services};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use super::bundle::{Component, ComponentOutput, ResultBundle};
use super::classifier::{ClassifierConfig, IntentClassifier};
use super::fusion::{FusionFetch, FusionResolver};
use super::intent::{Archetype, Intent};
use super::model_plan::{InvocationShape, ModelInvocationGenerator, ModelInvocationPlan};
use super::plan::{CrossFilterPlan, FusionTarget, PlannedStep, TurnPlan};
use super::query_generator::StructuredQueryGenerator;
use super::query_plan::{Aggregation, Operator, QueryPlan};
use super::state::{StepOutcome, StepRecord, TurnState, TurnTrace};
use super::synthesizer::{Answer, ResponseSynthesizer, SynthesisOptions};

/// Failed turn, returned instead of an answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub turn_id: Uuid,
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub message: String,

    /// The caller should rephrase or pick a candidate
    pub needs_clarification: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,

    pub trace: TurnTrace,
}

impl ErrorReport {
    pub fn status_code(&self) -> StatusCode {
        match self.kind {
            kind if kind.needs_clarification() => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::ExecutionFailed => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ErrorReport {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

/// Turn-local working state
struct Turn {
    id: Uuid,
    question: String,
    archetype: Option<Archetype>,
    trace: TurnTrace,
    bundle: ResultBundle,
}

impl Turn {
    fn new(question: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            question: question.trim().to_string(),
            archetype: None,
            trace: TurnTrace::new(),
            bundle: ResultBundle::new(),
        }
    }

    fn not_started(&mut self, component: Component, label: &str, prerequisite: Component) {
        self.bundle.record_not_started(component, label, prerequisite);
        self.trace.record_step(StepRecord {
            component,
            label: label.to_string(),
            outcome: StepOutcome::NotStarted,
            attempts: 0,
            elapsed_ms: 0,
        });
    }
}

pub struct Orchestrator {
    catalog: Arc<SchemaCatalog>,
    services: Services,
    config: OrchestratorConfig,
    classifier: IntentClassifier,
    queries: StructuredQueryGenerator,
    models: ModelInvocationGenerator,
    fusion: FusionResolver,
    synthesizer: ResponseSynthesizer,
}

impl Orchestrator {
    pub fn new(catalog: Arc<SchemaCatalog>, services: Services, config: OrchestratorConfig) -> Result<Self> {
        Ok(Self {
            classifier: IntentClassifier::new(ClassifierConfig::default())?,
            queries: StructuredQueryGenerator::from_config(&config),
            models: ModelInvocationGenerator::new(),
            fusion: FusionResolver::new(),
            synthesizer: ResponseSynthesizer::new(SynthesisOptions::default())?,
            catalog,
            services,
            config,
        })
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Answer one question; no state survives the call
    pub async fn handle_turn(&self, nl_text: &str) -> std::result::Result<Answer, ErrorReport> {
        let mut turn = Turn::new(nl_text);
        let span = tracing::info_span!("turn", turn_id = %turn.id);

        async move {
            let started = Instant::now();
            tracing::info!(question_len = turn.question.len(), "Turn started");

            let outcome = self.drive(&mut turn).await;
            let elapsed = started.elapsed();
            let archetype = turn.archetype.map_or("unclassified", |a| a.as_str());

            match outcome {
                Ok(answer) => {
                    let label = if answer.partial { "partial" } else { "done" };
                    metrics::record_turn(elapsed.as_secs_f64(), archetype, label);
                    tracing::info!(
                        archetype,
                        partial = answer.partial,
                        citations = answer.citations.len(),
                        narrated = answer.narrated,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Turn completed"
                    );
                    Ok(answer)
                }
                Err(error) => {
                    let report = self.fail(turn, error);
                    metrics::record_turn(elapsed.as_secs_f64(), archetype, report.kind.as_str());
                    Err(report)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, turn: &mut Turn) -> Result<Answer> {
        let intent = self.classify(turn).await?;
        turn.archetype = Some(intent.archetype);
        tracing::debug!(archetype = %intent.archetype, slots = ?intent.slots().keys().collect::<Vec<_>>(), "Intent classified");

        turn.trace.advance(TurnState::Planning)?;
        let TurnPlan { step, mut fusion } = self.plan(&intent)?;

        turn.trace.advance(TurnState::Executing)?;
        if let Some(entity) = intent.entity() {
            turn.bundle.add_entity(entity.clone());
        }
        self.execute(turn, step, fusion.as_mut()).await?;

        if let Some(target) = fusion {
            turn.trace.advance(TurnState::Fusing)?;
            self.fuse(turn, target).await?;
        }

        if turn.bundle.is_empty() {
            let causes: Vec<String> = turn
                .bundle
                .failures()
                .iter()
                .map(|f| format!("{} ({}): {}", f.component, f.label, f.message))
                .collect();
            return Err(AppError::execution(
                "orchestrator",
                format!("no step returned data; {}", causes.join("; ")),
            ));
        }

        turn.trace.advance(TurnState::Synthesizing)?;
        let mut answer = self
            .synthesizer
            .synthesize(turn.id, &turn.question, intent.archetype, &turn.bundle);

        if self.config.narrate {
            if let Some(reasoning) = self.services.reasoning.clone() {
                let prompt = self.synthesizer.narration_prompt(&answer);
                match self
                    .call(turn, Component::Reasoning, "narration", || reasoning.complete(&prompt))
                    .await
                {
                    Ok(text) => answer = self.synthesizer.accept_narration(answer, &text),
                    Err(e) => tracing::warn!(error = %e, "Narration failed, keeping drafted answer"),
                }
            }
        }

        turn.trace.advance(TurnState::Done)?;
        answer.trace = turn.trace.clone();
        Ok(answer)
    }

    fn fail(&self, mut turn: Turn, error: AppError) -> ErrorReport {
        let kind = error.kind();
        if let Err(e) = turn.trace.advance(TurnState::Errored(kind)) {
            tracing::error!(error = %e, "Turn already terminal when failing");
        }

        if kind.needs_clarification() {
            tracing::info!(kind = %kind, error = %error, "Turn needs clarification");
        } else if matches!(kind, ErrorKind::ExecutionFailed) {
            tracing::warn!(kind = %kind, error = %error, "Turn failed");
        } else {
            tracing::error!(kind = %kind, error = %error, "Turn failed");
        }

        ErrorReport {
            turn_id: turn.id,
            kind,
            code: error.code(),
            message: error.to_string(),
            needs_clarification: kind.needs_clarification(),
            candidates: error.candidates().to_vec(),
            trace: turn.trace,
        }
    }

    /// Rule-based classification, then one reasoning fallback
    async fn classify(&self, turn: &mut Turn) -> Result<Intent> {
        let reason = match self.classifier.classify(&turn.question, &self.catalog) {
            Ok(intent) => return Ok(intent),
            Err(AppError::IntentUnresolved { reason }) if !turn.question.is_empty() => reason,
            Err(e) => return Err(e),
        };

        let reasoning = match &self.services.reasoning {
            Some(r) if self.classifier.config().use_reasoning_fallback => r.clone(),
            _ => return Err(AppError::IntentUnresolved { reason }),
        };

        let prompt = self.classifier.fallback_prompt(&turn.question, &self.catalog);
        let reply = match self
            .call(turn, Component::Reasoning, "intent fallback", || reasoning.complete(&prompt))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "Reasoning fallback unavailable");
                return Err(AppError::IntentUnresolved { reason });
            }
        };

        self.classifier
            .interpret_fallback(&turn.question, &reply, &self.catalog)
    }

    fn plan(&self, intent: &Intent) -> Result<TurnPlan> {
        let fusion = FusionTarget::from_intent(intent, &self.catalog);

        let step = match intent.archetype {
            Archetype::LookupByAttribute | Archetype::AggregateTopN => {
                PlannedStep::Structured(self.queries.generate(intent, &self.catalog)?)
            }
            Archetype::ModelPredictLookup => {
                PlannedStep::Model(self.models.generate(intent, &self.catalog)?)
            }
            Archetype::CrossFilterByModelOutput => {
                let model_step = self.models.generate(intent, &self.catalog)?;
                let structured_step = self.queries.generate_deferred(intent, &self.catalog)?;
                PlannedStep::CrossFilter(CrossFilterPlan::new(model_step, structured_step)?)
            }
            Archetype::MultimodalEntityReport => {
                let target = fusion.as_ref().ok_or_else(|| AppError::IntentUnresolved {
                    reason: "no product named for the report".to_string(),
                })?;
                PlannedStep::EntityLookup(self.queries.entity_plan(&target.entity, &self.catalog)?)
            }
        };

        Ok(TurnPlan { step, fusion })
    }

    async fn execute(
        &self,
        turn: &mut Turn,
        step: PlannedStep,
        fusion: Option<&mut FusionTarget>,
    ) -> Result<()> {
        match step {
            PlannedStep::Structured(plan) => {
                let label = describe_query(&plan);
                self.run_query(turn, Component::StructuredQuery, &label, &plan)
                    .await;
            }

            PlannedStep::Model(plan) => {
                self.run_model(turn, &plan).await;
            }

            PlannedStep::CrossFilter(plan) => {
                let label = format!(
                    "{} in cluster {}",
                    describe_query(plan.structured_step().template()),
                    plan.model_step().cluster_id().unwrap_or_default()
                );

                // Phase one; the structured fetch does not exist until it succeeds
                let predictions = match self.run_model(turn, plan.model_step()).await {
                    Some(predictions) => predictions,
                    None => {
                        turn.not_started(Component::StructuredQuery, &label, Component::ModelPredictor);
                        return Ok(());
                    }
                };
                if plan.member_ids(&predictions).is_empty() {
                    tracing::info!(label = %label, "Cluster has no members, skipping the structured fetch");
                    turn.trace.record_step(StepRecord {
                        component: Component::StructuredQuery,
                        label: label.clone(),
                        outcome: StepOutcome::Skipped,
                        attempts: 0,
                        elapsed_ms: 0,
                    });
                    turn.bundle.record(
                        Component::StructuredQuery,
                        &label,
                        None,
                        ComponentOutput::Rows {
                            columns: plan.structured_step().template().output_columns(),
                            rows: Vec::new(),
                        },
                    );
                    return Ok(());
                }

                match plan.bind(&predictions, &self.catalog) {
                    Ok(bound) => {
                        self.run_query(turn, Component::StructuredQuery, &label, &bound)
                            .await;
                    }
                    Err(e) => turn.bundle.record_failure(Component::StructuredQuery, &label, &e),
                }
            }

            PlannedStep::EntityLookup(plan) => {
                let target = fusion.ok_or_else(|| AppError::Internal {
                    message: "entity lookup without a fusion target".to_string(),
                })?;
                self.look_up_entity(turn, target, &plan).await?;
            }
        }
        Ok(())
    }

    async fn fuse(&self, turn: &mut Turn, mut target: FusionTarget) -> Result<()> {
        let name = target.entity.display_name();

        if let Some(blocker) = target.blocked_by {
            for component in target.requested() {
                turn.not_started(component, &name, blocker);
            }
            return Ok(());
        }

        if target.entity.is_unresolved() {
            let plan = self.queries.entity_plan(&target.entity, &self.catalog)?;
            self.look_up_entity(turn, &mut target, &plan).await?;
            if let Some(blocker) = target.blocked_by {
                for component in target.requested() {
                    turn.not_started(component, &name, blocker);
                }
                return Ok(());
            }
        }

        let request = self
            .fusion
            .resolve(&target.entity, target.want_image, target.want_reviews)?;
        let name = request.entity.display_name();

        for fetch in &request.fetches {
            match fetch {
                FusionFetch::Reviews { entity_id } => {
                    let describer = &self.services.describer;
                    match self
                        .call(turn, Component::ReviewFetcher, &name, || describer.fetch_reviews(entity_id))
                        .await
                    {
                        Ok(reviews) => {
                            turn.bundle.record(
                                Component::ReviewFetcher,
                                &name,
                                Some(entity_id.clone()),
                                ComponentOutput::Reviews { reviews },
                            );
                        }
                        Err(e) => turn.bundle.record_failure(Component::ReviewFetcher, &name, &e),
                    }
                }

                FusionFetch::ImageDescription {
                    entity_id,
                    product_name,
                } => {
                    let images = &self.services.images;
                    let image = match self
                        .call(turn, Component::ImageLocator, &name, move || async move {
                            Ok(images.locate(product_name).await)
                        })
                        .await
                    {
                        Ok(image) => image,
                        Err(e) => {
                            turn.bundle.record_failure(Component::ImageLocator, &name, &e);
                            turn.not_started(Component::ImageDescriber, &name, Component::ImageLocator);
                            continue;
                        }
                    };

                    let describer = &self.services.describer;
                    match self
                        .call(turn, Component::ImageDescriber, &name, || describer.describe(&image))
                        .await
                    {
                        Ok(description) => {
                            turn.bundle.record(
                                Component::ImageDescriber,
                                &name,
                                Some(entity_id.clone()),
                                ComponentOutput::ImageDescription { image, description },
                            );
                        }
                        Err(e) => turn.bundle.record_failure(Component::ImageDescriber, &name, &e),
                    }
                }
            }
        }
        Ok(())
    }

    /// Fetch the entity row, resolving a name to an id on the way
    async fn look_up_entity(
        &self,
        turn: &mut Turn,
        target: &mut FusionTarget,
        plan: &QueryPlan,
    ) -> Result<()> {
        let label = format!("Catalog entry for {}", target.entity.display_name());

        let mut rows = match self.resolution_rows(turn, &label, plan).await {
            Some(rows) => rows,
            None => {
                target.blocked_by = Some(Component::EntityResolution);
                return Ok(());
            }
        };

        // An exact name wins over partial matches; only search wider when none exists
        let mut plan = plan;
        let fallback = if rows.is_empty() {
            self.queries.entity_fallback_plan(&target.entity, &self.catalog)?
        } else {
            None
        };
        if let Some(fallback) = &fallback {
            let label = format!("Catalog entries matching {}", target.entity.display_name());
            match self.resolution_rows(turn, &label, fallback).await {
                Some(found) => rows = found,
                None => {
                    target.blocked_by = Some(Component::EntityResolution);
                    return Ok(());
                }
            }
            plan = fallback;
        }

        self.fusion
            .apply_resolution(&mut target.entity, &rows, &self.catalog)?;
        turn.bundle.add_entity(target.entity.clone());

        // Ambiguous references record nothing; the resolver rejects them next
        if let Some(id) = target.entity.resolved_id() {
            let pk = self
                .catalog
                .require_table(&target.entity.table)?
                .primary_key
                .clone();
            let matching: Vec<Row> = rows
                .into_iter()
                .filter(|row| row.get(&pk).map(cell_text).as_deref() == Some(id))
                .collect();
            turn.bundle.record(
                Component::EntityResolution,
                format!("Catalog entry for {}", target.entity.display_name()),
                Some(id.to_string()),
                ComponentOutput::Rows {
                    columns: plan.output_columns(),
                    rows: matching,
                },
            );
        }
        Ok(())
    }

    async fn resolution_rows(&self, turn: &mut Turn, label: &str, plan: &QueryPlan) -> Option<Vec<Row>> {
        let executor = &self.services.executor;
        match self
            .call(turn, Component::EntityResolution, label, || executor.execute(plan))
            .await
        {
            Ok(rows) => Some(rows),
            Err(e) => {
                turn.bundle.record_failure(Component::EntityResolution, label, &e);
                None
            }
        }
    }

    async fn run_query(
        &self,
        turn: &mut Turn,
        component: Component,
        label: &str,
        plan: &QueryPlan,
    ) {
        let executor = &self.services.executor;
        match self.call(turn, component, label, || executor.execute(plan)).await {
            Ok(rows) => {
                turn.bundle.record(
                    component,
                    label,
                    None,
                    ComponentOutput::Rows {
                        columns: plan.output_columns(),
                        rows,
                    },
                );
            }
            Err(e) => turn.bundle.record_failure(component, label, &e),
        }
    }

    async fn run_model(&self, turn: &mut Turn, plan: &ModelInvocationPlan) -> Option<Predictions> {
        let label = match &plan.shape {
            InvocationShape::PredictForEntity { .. } => singular(&plan.entity_table).to_string(),
            InvocationShape::FilterByCluster { .. } => plan.entity_table.clone(),
        };
        let predictor = &self.services.predictor;

        let result = self
            .call(turn, Component::ModelPredictor, &label, || predictor.predict(plan))
            .await
            .and_then(|predictions| self.check_predictions(plan, predictions));

        match result {
            Ok(predictions) => {
                turn.bundle.record(
                    Component::ModelPredictor,
                    &label,
                    plan.entity_id().map(str::to_string),
                    ComponentOutput::Assignments {
                        model_id: plan.model_id.clone(),
                        cluster_filter: plan.cluster_id(),
                        predictions: predictions.clone(),
                    },
                );
                Some(predictions)
            }
            Err(e) => {
                turn.bundle.record_failure(Component::ModelPredictor, &label, &e);
                None
            }
        }
    }

    /// Keep the predictions the plan asked for, within the label domain
    fn check_predictions(&self, plan: &ModelInvocationPlan, mut predictions: Predictions) -> Result<Predictions> {
        let model = self.catalog.model();
        if let Some((id, p)) = predictions.iter().find(|(_, p)| !model.has_cluster(p.cluster_id)) {
            return Err(AppError::execution(
                Component::ModelPredictor.as_str(),
                format!("cluster {} for {} is outside the model's labels", p.cluster_id, id),
            ));
        }

        match &plan.shape {
            InvocationShape::PredictForEntity { entity_id } => {
                let prediction = predictions.remove(entity_id).ok_or_else(|| {
                    AppError::execution(
                        Component::ModelPredictor.as_str(),
                        format!("no assignment returned for {}", entity_id),
                    )
                })?;
                Ok(Predictions::from([(entity_id.clone(), prediction)]))
            }
            InvocationShape::FilterByCluster { cluster_id } => {
                predictions.retain(|_, p| p.cluster_id == *cluster_id);
                Ok(predictions)
            }
        }
    }

    /// Run one external call under the turn's timeout and retry policy
    async fn call<T, F, Fut>(&self, turn: &mut Turn, component: Component, label: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let allowed = if component.is_idempotent() && self.config.retry_idempotent {
            2
        } else {
            1
        };
        let started = Instant::now();
        let mut attempts = 0;

        let outcome = loop {
            attempts += 1;
            let attempt_started = Instant::now();
            let result = match tokio::time::timeout(self.config.call_timeout(), op()).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout {
                    component: component.to_string(),
                    timeout_ms: self.config.call_timeout_ms,
                }),
            };
            metrics::record_external_call(
                attempt_started.elapsed().as_secs_f64(),
                component.as_str(),
                result.is_ok(),
            );

            match result {
                Err(e) if attempts < allowed && e.is_transient() => {
                    tracing::warn!(component = %component, label, attempt = attempts, error = %e, "External call failed, retrying");
                    metrics::record_retry(component.as_str());
                }
                other => break other,
            }
        };

        if let Err(e) = &outcome {
            tracing::warn!(component = %component, label, attempts, error = %e, "External call failed");
        }
        turn.trace.record_step(StepRecord {
            component,
            label: label.to_string(),
            outcome: if outcome.is_ok() {
                StepOutcome::Succeeded
            } else {
                StepOutcome::Failed
            },
            attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        outcome
    }
}

/// Short human label for a structured fetch
fn describe_query(plan: &QueryPlan) -> String {
    let table = plan.base_table();
    let first = plan.order_by.first();

    match (&plan.aggregation, plan.aggregation.group_by()) {
        (Aggregation::TopN { n, .. }, Some(group)) => {
            let most = first.map_or(true, |key| key.descending);
            format!(
                "Top {} {} values by {} {}",
                n,
                group.column,
                if most { "most" } else { "fewest" },
                table
            )
        }
        (Aggregation::Count { .. }, Some(group)) => format!("{} per {}", capitalize(table), group.column),
        (Aggregation::Count { .. }, None) => format!("Number of {}", table),
        (Aggregation::TopN { n, .. }, None) => match first {
            Some(key) => format!(
                "Top {} {} by {} {}",
                n,
                table,
                key.output_name(),
                if key.descending { "descending" } else { "ascending" }
            ),
            None => format!("First {} {}", n, table),
        },
        (Aggregation::None, _) => {
            let filters: Vec<String> = plan
                .filters
                .iter()
                .map(|p| format!("{} {} {}", p.column.column, operator_text(p.op), cell_text(&p.value)))
                .collect();
            if filters.is_empty() {
                capitalize(table)
            } else {
                format!("{} where {}", capitalize(table), filters.join(" and "))
            }
        }
    }
}

fn operator_text(op: Operator) -> &'static str {
    match op {
        Operator::Eq => "=",
        Operator::Ne => "!=",
        Operator::Gt => ">",
        Operator::Gte => ">=",
        Operator::Lt => "<",
        Operator::Lte => "<=",
        Operator::In => "in",
        Operator::EqIgnoreCase => "is",
        Operator::Contains => "contains",
    }
}

fn singular(table: &str) -> &str {
    table.strip_suffix('s').unwrap_or(table)
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
