//! Loop state and the typed deltas returned by each step.
//!
//! Steps never mutate the state they are given. They return a [`StateDelta`]
//! that the driver folds into a new [`LoopState`] with [`LoopState::apply`],
//! which also enforces the loop invariants.

use serde::Serialize;

use crate::core::transitions::validate_transition;
use crate::core::types::{AttemptRecord, Status};

/// Single source of truth consumed and produced by every loop step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopState {
    pub task: String,
    pub plan: Vec<String>,
    pub current_code: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub history: Vec<AttemptRecord>,
    pub retrieved_context: String,
    pub research_notes: Vec<String>,
    pub status: Status,
}

impl LoopState {
    pub fn new(task: impl Into<String>, max_iterations: u32) -> Self {
        Self {
            task: task.into(),
            plan: Vec::new(),
            current_code: String::new(),
            iteration: 0,
            max_iterations,
            history: Vec::new(),
            retrieved_context: String::new(),
            research_notes: Vec::new(),
            status: Status::Planning,
        }
    }

    pub fn last_attempt(&self) -> Option<&AttemptRecord> {
        self.history.last()
    }

    /// Reflection on the most recent attempt, if any.
    pub fn latest_reflection(&self) -> Option<&str> {
        self.last_attempt()
            .and_then(|attempt| attempt.reflection.as_deref())
            .filter(|r| !r.is_empty())
    }

    /// Error texts of every failed attempt so far, oldest first.
    pub fn prior_errors(&self) -> Vec<&str> {
        self.history.iter().filter_map(|a| a.failure()).collect()
    }

    pub fn iterations_exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }

    /// Fold `delta` into a new state value.
    ///
    /// Rejects deltas that would break the loop invariants: invalid status
    /// edges, iteration jumps, or reflections on a successful attempt.
    pub fn apply(mut self, delta: StateDelta) -> Result<Self, String> {
        if let Some(iteration) = delta.iteration {
            if iteration != self.iteration + 1 {
                return Err(format!(
                    "iteration must advance by one (current={}, next={})",
                    self.iteration, iteration
                ));
            }
            if iteration > self.max_iterations {
                return Err(format!(
                    "iteration {} exceeds max_iterations {}",
                    iteration, self.max_iterations
                ));
            }
            self.iteration = iteration;
        }

        match delta.history {
            Some(HistoryChange::Append(attempt)) => self.history.push(attempt),
            Some(HistoryChange::ReplaceLast(attempt)) => {
                let last = self
                    .history
                    .last_mut()
                    .ok_or_else(|| "cannot attach reflection: history is empty".to_string())?;
                if !last.failed() {
                    return Err("cannot attach reflection to a successful attempt".to_string());
                }
                if last.code != attempt.code || last.error != attempt.error {
                    return Err("reflection must replace the latest attempt only".to_string());
                }
                *last = attempt;
            }
            None => {}
        }

        if let Some(plan) = delta.plan {
            self.plan = plan;
        }
        if let Some(code) = delta.current_code {
            self.current_code = code;
        }
        if let Some(context) = delta.retrieved_context {
            self.retrieved_context = context;
        }
        if let Some(notes) = delta.research_notes {
            self.research_notes = notes;
        }
        if let Some(status) = delta.status {
            validate_transition(self.status, status)?;
            self.status = status;
        }

        Ok(self)
    }
}

/// Change to the attempt history. History is append-only apart from
/// attaching a reflection to the latest record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "attempt", rename_all = "snake_case")]
pub enum HistoryChange {
    Append(AttemptRecord),
    ReplaceLast(AttemptRecord),
}

/// Partial update returned by one loop step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieved_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub research_notes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl StateDelta {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}
