//! The individual repair-loop steps.
//!
//! Each step reads the current [`LoopState`] and returns a [`StateDelta`]; the
//! driver in [`crate::repair`] folds deltas into new states and routes between
//! steps. Steps never mutate their input.

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::agents::Agents;
use crate::core::safety::SafetyPolicy;
use crate::core::state::{HistoryChange, LoopState, StateDelta};
use crate::core::types::{AttemptRecord, FailureRecord, Status};
use crate::io::completion::Completion;
use crate::io::memory_store::EpisodicMemory;
use crate::io::research::Researcher;
use crate::io::sandbox::Sandbox;

/// Heading of the retrieved-context block.
pub const LESSONS_HEADING: &str = "Past Failures/Lessons:";

/// Prefix of the error recorded for a program the safety gate rejected.
pub const SAFETY_VIOLATION_PREFIX: &str = "Safety Violation: ";

/// Query memory for similar past failures and render them as context.
#[instrument(skip_all)]
pub fn retrieve_memory<M: EpisodicMemory + ?Sized>(
    state: &LoopState,
    memory: &M,
) -> Result<StateDelta> {
    let failures = memory
        .retrieve_similar_failures(&state.task, "")
        .context("retrieve similar failures")?;
    debug!(found = failures.len(), "retrieved lessons");
    Ok(StateDelta {
        retrieved_context: Some(render_lessons(&failures)),
        ..StateDelta::default()
    })
}

/// `Past Failures/Lessons:` block, or empty when there are no records.
pub fn render_lessons(failures: &[FailureRecord]) -> String {
    if failures.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = failures
        .iter()
        .map(|f| format!("- Error: {}\n  Fix: {}", f.error, f.fix))
        .collect();
    format!("{LESSONS_HEADING}\n{}", lines.join("\n"))
}

/// Optional web research; expects the state to be `researching`.
#[instrument(skip_all)]
pub fn research<C, R>(
    state: &LoopState,
    agents: &Agents,
    completion: &C,
    researcher: &R,
) -> Result<StateDelta>
where
    C: Completion + ?Sized,
    R: Researcher + ?Sized,
{
    let notes = agents
        .research
        .run(completion, researcher, &state.task, &state.retrieved_context)?;
    Ok(StateDelta {
        research_notes: Some(notes),
        status: Some(Status::Planning),
        ..StateDelta::default()
    })
}

#[instrument(skip_all)]
pub fn plan<C: Completion + ?Sized>(
    state: &LoopState,
    agents: &Agents,
    completion: &C,
) -> Result<StateDelta> {
    let plan = agents.planner.run(
        completion,
        &state.task,
        &state.retrieved_context,
        &state.research_notes,
    )?;
    info!(steps = plan.len(), "planned");
    Ok(StateDelta {
        plan: Some(plan),
        status: Some(Status::Coding),
        ..StateDelta::default()
    })
}

#[instrument(skip_all, fields(iteration = state.iteration + 1))]
pub fn code<C: Completion + ?Sized>(
    state: &LoopState,
    agents: &Agents,
    completion: &C,
) -> Result<StateDelta> {
    let code = agents.coder.run(completion, state)?;
    Ok(StateDelta {
        current_code: Some(code),
        iteration: Some(state.iteration + 1),
        status: Some(Status::Executing),
        ..StateDelta::default()
    })
}

/// Gate the current program, run it if approved, and record the attempt.
#[instrument(skip_all, fields(iteration = state.iteration))]
pub fn execute<S: Sandbox + ?Sized>(
    state: &LoopState,
    policy: &SafetyPolicy,
    sandbox: &S,
) -> StateDelta {
    let verdict = policy.check(&state.current_code);
    let attempt = if verdict.is_safe {
        let result = sandbox.run(&state.current_code);
        AttemptRecord::new(state.current_code.as_str(), result.output, &result.error)
    } else {
        warn!(reason = %verdict.reason, "program rejected by safety gate");
        AttemptRecord::new(
            state.current_code.as_str(),
            "",
            &format!("{SAFETY_VIOLATION_PREFIX}{}", verdict.reason),
        )
    };

    let status = if attempt.failed() {
        Status::Reflecting
    } else {
        Status::Finished
    };
    info!(%status, "attempt recorded");
    StateDelta {
        history: Some(HistoryChange::Append(attempt)),
        status: Some(status),
        ..StateDelta::default()
    }
}

/// Attach a diagnosis to the latest failed attempt.
#[instrument(skip_all, fields(iteration = state.iteration))]
pub fn reflect<C: Completion + ?Sized>(
    state: &LoopState,
    agents: &Agents,
    completion: &C,
) -> Result<StateDelta> {
    let last = state
        .last_attempt()
        .ok_or_else(|| anyhow!("nothing to reflect on: history is empty"))?;
    let reflection = agents.reflector.run(completion, last)?;
    let mut updated = last.clone();
    updated.reflection = Some(reflection);
    Ok(StateDelta {
        history: Some(HistoryChange::ReplaceLast(updated)),
        status: Some(Status::Coding),
        ..StateDelta::default()
    })
}

/// Persist the solved task and every failure it took to get there.
#[instrument(skip_all)]
pub fn save_memory<M: EpisodicMemory + ?Sized>(
    state: &LoopState,
    memory: &M,
) -> Result<StateDelta> {
    memory
        .store_success(&state.task, &state.current_code)
        .context("store success")?;
    let mut stored = 0usize;
    for attempt in &state.history {
        if let Some(error) = attempt.failure() {
            memory
                .store_failure(error, &attempt.code, &state.current_code, &state.task)
                .context("store failure")?;
            stored += 1;
        }
    }
    info!(failures = stored, "saved episodic memory");
    Ok(StateDelta::status(Status::Finished))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SandboxResult;
    use crate::io::memory_store::MemoryStore;
    use crate::io::config::MemoryConfig;
    use crate::test_support::{RecordingMemory, ScriptedCompletion, ScriptedSandbox};

    fn executing(code: &str) -> LoopState {
        let mut state = LoopState::new("task", 3);
        state.status = Status::Executing;
        state.iteration = 1;
        state.current_code = code.to_string();
        state
    }

    #[test]
    fn lessons_render_error_and_fix() {
        let text = render_lessons(&[FailureRecord::new("KeyError", "d['k']", "d.get('k')", "t")]);
        assert_eq!(text, "Past Failures/Lessons:\n- Error: KeyError\n  Fix: d.get('k')");
        assert_eq!(render_lessons(&[]), "");
    }

    #[test]
    fn retrieve_memory_on_empty_store_gives_empty_context() {
        let memory = MemoryStore::in_memory(&MemoryConfig::default());
        let delta = retrieve_memory(&LoopState::new("task", 1), &memory).expect("retrieve");
        assert_eq!(delta.retrieved_context.as_deref(), Some(""));
        assert_eq!(delta.status, None);
    }

    #[test]
    fn unsafe_program_is_recorded_without_running() {
        let sandbox = ScriptedSandbox::new(vec![]);
        let delta = execute(
            &executing("import os\nos.system('ls')"),
            &SafetyPolicy::default(),
            &sandbox,
        );

        let Some(HistoryChange::Append(attempt)) = delta.history else {
            panic!("expected appended attempt");
        };
        assert_eq!(attempt.output, "");
        assert_eq!(
            attempt.failure(),
            Some("Safety Violation: Importing 'os' is not allowed.")
        );
        assert_eq!(delta.status, Some(Status::Reflecting));
        assert_eq!(sandbox.runs(), 0);
    }

    #[test]
    fn successful_run_finishes() {
        let sandbox = ScriptedSandbox::new(vec![SandboxResult::success("3")]);
        let delta = execute(&executing("print(1 + 2)"), &SafetyPolicy::default(), &sandbox);
        assert_eq!(delta.status, Some(Status::Finished));
        sandbox.assert_drained().expect("sandbox drained");
    }

    #[test]
    fn code_step_advances_iteration_and_strips_fences() {
        let completion = ScriptedCompletion::new(vec!["```python\nprint(1)\n```"]);
        let mut state = LoopState::new("task", 3);
        state.status = Status::Coding;
        let delta = code(&state, &Agents::new(10_000), &completion).expect("code");
        assert_eq!(delta.current_code.as_deref(), Some("print(1)"));
        assert_eq!(delta.iteration, Some(1));
        assert_eq!(delta.status, Some(Status::Executing));
        completion.assert_drained().expect("completion drained");
    }

    #[test]
    fn save_memory_links_every_failure_to_the_final_code() {
        let memory = RecordingMemory::default();
        let mut state = LoopState::new("task", 3);
        state.status = Status::Finished;
        state.current_code = "print('ok')".to_string();
        state.history = vec![
            AttemptRecord::new("a", "", "E1"),
            AttemptRecord::new("b", "", "E2"),
            AttemptRecord::new("print('ok')", "ok", ""),
        ];

        let delta = save_memory(&state, &memory).expect("save");
        assert_eq!(delta.status, Some(Status::Finished));

        let failures = memory.failures();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f.fix == "print('ok')"));
        assert_eq!(failures[0].failed_code, "a");
        assert_eq!(memory.successes().len(), 1);
    }
}
