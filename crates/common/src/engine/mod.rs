//! Hybrid query orchestration engine
//!
//! One user turn flows through:
//! 1. Intent classification (rule-based, reasoning fallback)
//! 2. Planning (structured query, model invocation, or both)
//! 3. Execution against the external services
//! 4. Multimodal fusion for image and review requests
//! 5. Synthesis of a cited answer
//!
//! Nothing is kept between turns.

mod bundle;
mod classifier;
mod fusion;
mod intent;
mod model_plan;
mod orchestrator;
mod plan;
mod query_generator;
mod query_plan;
mod state;
mod synthesizer;

pub use bundle::{BundleEntry, Component, ComponentOutput, DataKind, ResultBundle, StepFailure};
pub use classifier::{Candidate, ClassifierConfig, Cues, IntentClassifier, SortCue};
pub use fusion::{FusionFetch, FusionRequest, FusionResolver};
pub use intent::{
    slots, Archetype, EntityCandidate, EntityKey, EntityReference, Intent, ResolutionStatus,
    SlotValue, SortSpec, COUNT_COLUMN,
};
pub use model_plan::{InvocationShape, ModelInvocationGenerator, ModelInvocationPlan, OutputField};
pub use orchestrator::{ErrorReport, Orchestrator};
pub use plan::{CrossFilterPlan, FusionTarget, PlannedStep, TurnPlan};
pub use query_generator::{DeferredQuery, StructuredQueryGenerator, RESOLUTION_CANDIDATE_LIMIT};
pub use query_plan::{
    Aggregation, ColumnRef, JoinKey, Operator, Predicate, QueryPlan, SortKey, SortTarget,
};
pub use state::{StepOutcome, StepRecord, TurnState, TurnTrace};
pub use synthesizer::{Answer, Citation, MissingPiece, ResponseSynthesizer, SynthesisOptions};
