//! The repair loop driver.
//!
//! [`RepairLoop::steps`] yields one [`StepUpdate`] per completed step, so
//! callers can observe progress; [`RepairLoop::run`] drains it and returns the
//! [`LoopOutcome`]. Routing:
//!
//! ```text
//! retrieve_memory -> [research ->] plan -> code -> execute
//! execute --finished--> save_memory -> end
//! execute --failed, iterations left--> reflect -> code
//! execute --failed, iterations exhausted--> give_up -> end
//! ```
//!
//! Iteration exhaustion is a normal `failed` outcome. Completion and memory
//! errors end the stream with an `Err`.

use std::fmt;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::{info, warn};

use crate::agents::Agents;
use crate::core::safety::SafetyPolicy;
use crate::core::state::{LoopState, StateDelta};
use crate::core::types::Status;
use crate::io::completion::Completion;
use crate::io::memory_store::EpisodicMemory;
use crate::io::research::Researcher;
use crate::io::sandbox::Sandbox;
use crate::step;

const DEFAULT_PROMPT_BUDGET_BYTES: usize = 40_000;

/// Loop step identifiers, in the order they can first occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    RetrieveMemory,
    Research,
    Plan,
    Code,
    Execute,
    Reflect,
    GiveUp,
    SaveMemory,
}

impl StepName {
    pub fn as_str(self) -> &'static str {
        match self {
            StepName::RetrieveMemory => "retrieve_memory",
            StepName::Research => "research",
            StepName::Plan => "plan",
            StepName::Code => "code",
            StepName::Execute => "execute",
            StepName::Reflect => "reflect",
            StepName::GiveUp => "give_up",
            StepName::SaveMemory => "save_memory",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed step: its delta and the state after applying it.
#[derive(Debug, Clone, Serialize)]
pub struct StepUpdate {
    pub step: StepName,
    pub delta: StateDelta,
    pub state: LoopState,
}

/// Final result of a loop run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopOutcome {
    pub status: Status,
    pub iterations: u32,
    pub final_code: String,
    pub state: LoopState,
}

impl LoopOutcome {
    fn from_state(state: LoopState) -> Self {
        Self {
            status: state.status,
            iterations: state.iteration,
            final_code: state.current_code.clone(),
            state,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Finished
    }
}

/// A step returned a delta that breaks the loop invariants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub step: StepName,
    pub from: Status,
    pub to: Status,
    pub reason: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {} produced an invalid update ({} -> {}): {}",
            self.step, self.from, self.to, self.reason
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Plan, code, execute, reflect until the program works or iterations run out.
pub struct RepairLoop<C, M, S> {
    completion: C,
    memory: M,
    sandbox: S,
    researcher: Option<Box<dyn Researcher>>,
    policy: SafetyPolicy,
    agents: Agents,
}

impl<C, M, S> RepairLoop<C, M, S>
where
    C: Completion,
    M: EpisodicMemory,
    S: Sandbox,
{
    pub fn new(completion: C, memory: M, sandbox: S) -> Self {
        Self {
            completion,
            memory,
            sandbox,
            researcher: None,
            policy: SafetyPolicy::default(),
            agents: Agents::new(DEFAULT_PROMPT_BUDGET_BYTES),
        }
    }

    /// Enable the research step before planning.
    pub fn with_researcher(mut self, researcher: Box<dyn Researcher>) -> Self {
        self.researcher = Some(researcher);
        self
    }

    pub fn with_safety_policy(mut self, policy: SafetyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_prompt_budget(mut self, budget_bytes: usize) -> Self {
        self.agents = Agents::new(budget_bytes);
        self
    }

    pub fn sandbox(&self) -> &S {
        &self.sandbox
    }

    /// Stream the loop one step at a time.
    pub fn steps(&self, task: &str, max_iterations: u32) -> Steps<'_, C, M, S> {
        Steps {
            driver: self,
            state: LoopState::new(task, max_iterations),
            next: if max_iterations == 0 {
                Pending::Rejected
            } else {
                Pending::RetrieveMemory
            },
        }
    }

    /// Run the loop to completion.
    pub fn run(&self, task: &str, max_iterations: u32) -> Result<LoopOutcome> {
        self.run_with(task, max_iterations, |_| {})
    }

    /// Run the loop to completion, calling `on_step` after every step.
    pub fn run_with<F: FnMut(&StepUpdate)>(
        &self,
        task: &str,
        max_iterations: u32,
        mut on_step: F,
    ) -> Result<LoopOutcome> {
        let mut steps = self.steps(task, max_iterations);
        for update in steps.by_ref() {
            on_step(&update?);
        }
        steps
            .outcome()
            .ok_or_else(|| anyhow!("repair loop stopped before reaching a terminal status"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    RetrieveMemory,
    Research,
    Plan,
    Code,
    Execute,
    Reflect,
    GiveUp,
    SaveMemory,
    Rejected,
    Done,
}

/// Iterator over loop steps. Ends after a terminal step or the first error.
pub struct Steps<'a, C, M, S> {
    driver: &'a RepairLoop<C, M, S>,
    state: LoopState,
    next: Pending,
}

impl<C, M, S> Steps<'_, C, M, S>
where
    C: Completion,
    M: EpisodicMemory,
    S: Sandbox,
{
    /// Current state (the initial state before the first step).
    pub fn state(&self) -> &LoopState {
        &self.state
    }

    /// Final outcome, once the stream reached a terminal status.
    pub fn outcome(&self) -> Option<LoopOutcome> {
        (self.next == Pending::Done && self.state.status.is_terminal())
            .then(|| LoopOutcome::from_state(self.state.clone()))
    }

    fn advance(&mut self) -> Result<Option<StepUpdate>> {
        let driver = self.driver;
        let (name, delta) = match self.next {
            Pending::Done => return Ok(None),
            Pending::Rejected => {
                return Err(anyhow!("max_iterations must be >= 1"));
            }
            Pending::RetrieveMemory => (
                StepName::RetrieveMemory,
                step::retrieve_memory(&self.state, &driver.memory)?,
            ),
            Pending::Research => {
                let researcher = driver
                    .researcher
                    .as_deref()
                    .ok_or_else(|| anyhow!("research step without a researcher"))?;
                self.fold(StepName::Research, StateDelta::status(Status::Researching))?;
                (
                    StepName::Research,
                    step::research(&self.state, &driver.agents, &driver.completion, researcher)?,
                )
            }
            Pending::Plan => (
                StepName::Plan,
                step::plan(&self.state, &driver.agents, &driver.completion)?,
            ),
            Pending::Code => (
                StepName::Code,
                step::code(&self.state, &driver.agents, &driver.completion)?,
            ),
            Pending::Execute => (
                StepName::Execute,
                step::execute(&self.state, &driver.policy, &driver.sandbox),
            ),
            Pending::Reflect => (
                StepName::Reflect,
                step::reflect(&self.state, &driver.agents, &driver.completion)?,
            ),
            Pending::GiveUp => {
                warn!(
                    iterations = self.state.iteration,
                    "iterations exhausted without a working program"
                );
                (StepName::GiveUp, StateDelta::status(Status::Failed))
            }
            Pending::SaveMemory => (
                StepName::SaveMemory,
                step::save_memory(&self.state, &driver.memory)?,
            ),
        };

        self.fold(name, delta.clone())?;
        self.next = self.route(name);
        if self.next == Pending::Done {
            info!(status = %self.state.status, iterations = self.state.iteration, "repair loop finished");
        }
        Ok(Some(StepUpdate {
            step: name,
            delta,
            state: self.state.clone(),
        }))
    }

    fn fold(&mut self, step: StepName, delta: StateDelta) -> Result<()> {
        let from = self.state.status;
        let to = delta.status.unwrap_or(from);
        self.state = self
            .state
            .clone()
            .apply(delta)
            .map_err(|reason| InvalidTransition {
                step,
                from,
                to,
                reason,
            })?;
        Ok(())
    }

    fn route(&self, finished: StepName) -> Pending {
        match finished {
            StepName::RetrieveMemory if self.driver.researcher.is_some() => Pending::Research,
            StepName::RetrieveMemory | StepName::Research => Pending::Plan,
            StepName::Plan | StepName::Reflect => Pending::Code,
            StepName::Code => Pending::Execute,
            StepName::Execute if self.state.status == Status::Finished => Pending::SaveMemory,
            StepName::Execute if self.state.iterations_exhausted() => Pending::GiveUp,
            StepName::Execute => Pending::Reflect,
            StepName::GiveUp | StepName::SaveMemory => Pending::Done,
        }
    }
}

impl<C, M, S> Iterator for Steps<'_, C, M, S>
where
    C: Completion,
    M: EpisodicMemory,
    S: Sandbox,
{
    type Item = Result<StepUpdate>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(update)) => Some(Ok(update)),
            Ok(None) => None,
            Err(err) => {
                // Errors are terminal for the stream.
                self.next = Pending::Done;
                Some(Err(err))
            }
        }
    }
}
