//! Turn state machine and trace

use crate::errors::{AppError, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::bundle::Component;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "kind", rename_all = "snake_case")]
pub enum TurnState {
    Classifying,
    Planning,
    Executing,
    Fusing,
    Synthesizing,
    Done,
    Errored(ErrorKind),
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Done | TurnState::Errored(_))
    }

    /// Legal forward moves; nothing returns to `Classifying`
    pub fn can_transition_to(&self, next: TurnState) -> bool {
        use TurnState::*;
        match (self, next) {
            (Done, _) | (Errored(_), _) => false,
            (_, Errored(_)) => true,
            (Classifying, Planning) => true,
            (Planning, Executing) => true,
            (Executing, Fusing) | (Executing, Synthesizing) => true,
            (Fusing, Synthesizing) => true,
            (Synthesizing, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnState::Classifying => f.write_str("classifying"),
            TurnState::Planning => f.write_str("planning"),
            TurnState::Executing => f.write_str("executing"),
            TurnState::Fusing => f.write_str("fusing"),
            TurnState::Synthesizing => f.write_str("synthesizing"),
            TurnState::Done => f.write_str("done"),
            TurnState::Errored(kind) => write!(f, "errored({})", kind),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed,
    /// Skipped because a prerequisite failed
    NotStarted,
    /// Not needed; the prerequisite left nothing to fetch
    Skipped,
}

/// One external call made during the turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub component: Component,
    pub label: String,
    pub outcome: StepOutcome,
    pub attempts: u32,
    pub elapsed_ms: u64,
}

/// States visited and calls made, in order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnTrace {
    pub states: Vec<TurnState>,
    pub steps: Vec<StepRecord>,
}

impl TurnTrace {
    pub fn new() -> Self {
        Self {
            states: vec![TurnState::Classifying],
            steps: Vec::new(),
        }
    }

    pub fn current(&self) -> TurnState {
        self.states.last().copied().unwrap_or(TurnState::Classifying)
    }

    pub fn advance(&mut self, next: TurnState) -> Result<()> {
        let current = self.current();
        if !current.can_transition_to(next) {
            return Err(AppError::Internal {
                message: format!("illegal turn transition {} -> {}", current, next),
            });
        }
        self.states.push(next);
        Ok(())
    }

    pub fn record_step(&mut self, step: StepRecord) {
        self.steps.push(step);
    }

    /// Steps of one component, in call order
    pub fn steps_of(&self, component: Component) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(move |s| s.component == component)
    }
}

impl Default for TurnTrace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut trace = TurnTrace::new();
        for state in [
            TurnState::Planning,
            TurnState::Executing,
            TurnState::Fusing,
            TurnState::Synthesizing,
            TurnState::Done,
        ] {
            trace.advance(state).unwrap();
        }
        assert!(trace.current().is_terminal());
    }

    #[test]
    fn test_no_reentry_or_exit_from_terminal() {
        let mut trace = TurnTrace::new();
        trace.advance(TurnState::Planning).unwrap();
        assert!(trace.advance(TurnState::Classifying).is_err());

        trace
            .advance(TurnState::Errored(ErrorKind::SchemaMismatch))
            .unwrap();
        assert!(trace.advance(TurnState::Executing).is_err());
        assert!(trace
            .advance(TurnState::Errored(ErrorKind::Internal))
            .is_err());
    }

    #[test]
    fn test_fusing_is_optional() {
        assert!(TurnState::Executing.can_transition_to(TurnState::Synthesizing));
        assert!(!TurnState::Planning.can_transition_to(TurnState::Fusing));
    }
}
