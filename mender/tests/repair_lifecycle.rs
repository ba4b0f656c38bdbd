//! End-to-end repair loop scenarios with scripted completion and sandbox.
//!
//! These drive `RepairLoop` from the initial state to a terminal status and
//! check history, termination and what ends up in episodic memory.

use mender::core::types::{FailureRecord, SandboxResult, Status};
use mender::io::config::MemoryConfig;
use mender::io::memory_store::{EpisodicMemory, MemoryStore};
use mender::io::research::Researcher;
use mender::repair::{RepairLoop, StepName};
use mender::test_support::{RecordingMemory, ScriptedCompletion, ScriptedSandbox};

const WORKING: &str = "print(sum([1, 2, 3]))";
const CRASHING: &str = "raise ValueError('bad input')";

/// A: working code on the first attempt.
#[test]
fn first_attempt_success_finishes_at_iteration_one() {
    let completion = ScriptedCompletion::new(vec!["1. add the numbers\n2. print", WORKING]);
    let memory = RecordingMemory::default();
    let sandbox = ScriptedSandbox::new(vec![SandboxResult::success("6")]);

    let repair = RepairLoop::new(&completion, &memory, &sandbox);
    let outcome = repair.run("sum 1, 2 and 3", 5).expect("run");

    assert_eq!(outcome.status, Status::Finished);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.final_code, WORKING);
    assert_eq!(outcome.state.history.len(), 1);
    assert_eq!(outcome.state.history[0].error, None);
    assert_eq!(outcome.state.history[0].output, "6");
    assert_eq!(
        outcome.state.plan,
        vec!["1. add the numbers".to_string(), "2. print".to_string()]
    );

    assert_eq!(memory.successes().len(), 1);
    assert!(memory.failures().is_empty());
    completion.assert_drained().expect("completion drained");
    sandbox.assert_drained().expect("sandbox drained");
}

/// B: a denylisted import is rejected, reflected on, and fixed.
#[test]
fn unsafe_then_fixed_persists_one_failure_and_one_success() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = MemoryStore::open(temp.path(), &MemoryConfig::default()).expect("open");
    let completion = ScriptedCompletion::new(vec![
        "1. list files",
        "import os\nprint(os.listdir('.'))",
        "Do not import os; compute the answer directly.",
        WORKING,
    ]);
    let sandbox = ScriptedSandbox::new(vec![SandboxResult::success("6")]);

    let repair = RepairLoop::new(&completion, &store, &sandbox);
    let outcome = repair.run("sum a list", 5).expect("run");

    assert_eq!(outcome.status, Status::Finished);
    let history = &outcome.state.history;
    assert_eq!(history.len(), 2);
    let first_error = history[0].failure().expect("first attempt failed");
    assert!(first_error.starts_with("Safety Violation: "));
    assert!(first_error.contains("not allowed"));
    assert_eq!(
        history[0].reflection.as_deref(),
        Some("Do not import os; compute the answer directly.")
    );
    assert!(!history[1].failed());
    // The unsafe program never reached the sandbox.
    assert_eq!(sandbox.programs(), vec![WORKING.to_string()]);

    assert_eq!(store.failure_count(), 1);
    assert_eq!(store.success_count(), 1);
    let lessons = store
        .retrieve_similar_failures("sum a list", first_error)
        .expect("retrieve");
    assert_eq!(lessons[0].fix, WORKING);
    assert_eq!(lessons[0].failed_code, "import os\nprint(os.listdir('.'))");
    completion.assert_drained().expect("completion drained");
}

/// C: every attempt crashes; the loop stops after the iteration budget.
#[test]
fn exhausted_iterations_fail_without_saving_memory() {
    let completion = ScriptedCompletion::new(vec![
        "1. parse",
        CRASHING,
        "validate the input first",
        CRASHING,
    ]);
    let memory = RecordingMemory::default();
    let sandbox = ScriptedSandbox::new(vec![
        SandboxResult::failure("", "ValueError: bad input"),
        SandboxResult::failure("", "ValueError: bad input"),
    ]);

    let repair = RepairLoop::new(&completion, &memory, &sandbox);
    let mut steps = Vec::new();
    let outcome = repair
        .run_with("parse the input", 2, |update| steps.push(update.step))
        .expect("run");

    assert_eq!(outcome.status, Status::Failed);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.state.history.len(), 2);
    assert!(outcome.state.history.iter().all(|a| a.failed()));
    assert_eq!(steps.iter().filter(|s| **s == StepName::Code).count(), 2);
    assert_eq!(steps.last(), Some(&StepName::GiveUp));
    assert!(!steps.contains(&StepName::SaveMemory));

    assert!(memory.successes().is_empty());
    assert!(memory.failures().is_empty());
    completion.assert_drained().expect("completion drained");
    sandbox.assert_drained().expect("sandbox drained");
}

#[test]
fn coding_steps_never_exceed_the_budget() {
    for max in 1..=4u32 {
        let mut replies = vec!["1. try".to_string()];
        for _ in 0..max {
            replies.push(CRASHING.to_string());
            replies.push("try again".to_string());
        }
        let completion = ScriptedCompletion::new(replies);
        let results = (0..max)
            .map(|_| SandboxResult::failure("", "ValueError"))
            .collect();
        let sandbox = ScriptedSandbox::new(results);
        let memory = RecordingMemory::default();

        let outcome = RepairLoop::new(&completion, &memory, &sandbox)
            .run("task", max)
            .expect("run");

        assert_eq!(outcome.status, Status::Failed);
        assert_eq!(outcome.iterations, max);
        assert_eq!(sandbox.runs(), max as usize);
    }
}

#[test]
fn every_failure_is_linked_to_the_final_fix() {
    let completion = ScriptedCompletion::new(vec![
        "1. go",
        "print(x)",
        "define x",
        "x = []\nprint(x[1])",
        "index carefully",
        WORKING,
    ]);
    let sandbox = ScriptedSandbox::new(vec![
        SandboxResult::failure("", "NameError: name 'x' is not defined"),
        SandboxResult::failure("", "IndexError: list index out of range"),
        SandboxResult::success("6"),
    ]);
    let memory = RecordingMemory::default();

    let outcome = RepairLoop::new(&completion, &memory, &sandbox)
        .run("task", 5)
        .expect("run");

    assert!(outcome.is_success());
    let failures = memory.failures();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|f| f.fix == WORKING));
    assert_eq!(failures[0].failed_code, "print(x)");
    assert_eq!(failures[1].error, "IndexError: list index out of range");
    assert_eq!(memory.successes()[0].code, WORKING);
}

#[test]
fn stored_lessons_reach_the_next_plan_prompt() {
    let memory = RecordingMemory::with_failures(vec![FailureRecord::new(
        "KeyError: 'name'",
        "d['name']",
        "d.get('name')",
        "read a name",
    )]);
    let completion = ScriptedCompletion::new(vec!["1. read", WORKING]);
    let sandbox = ScriptedSandbox::new(vec![SandboxResult::success("6")]);

    let outcome = RepairLoop::new(&completion, &memory, &sandbox)
        .run("read a name", 3)
        .expect("run");

    assert_eq!(
        outcome.state.retrieved_context,
        "Past Failures/Lessons:\n- Error: KeyError: 'name'\n  Fix: d.get('name')"
    );
    assert_eq!(memory.retrievals(), 1);
    let plan_prompt = &completion.prompts()[0];
    assert!(plan_prompt.user.contains("Fix: d.get('name')"));
}

#[test]
fn reflection_and_errors_reach_the_next_code_prompt() {
    let completion = ScriptedCompletion::new(vec![
        "1. go",
        CRASHING,
        "stop raising",
        WORKING,
    ]);
    let sandbox = ScriptedSandbox::new(vec![
        SandboxResult::failure("", "ValueError: bad input"),
        SandboxResult::success("6"),
    ]);
    let memory = RecordingMemory::default();

    RepairLoop::new(&completion, &memory, &sandbox)
        .run("task", 3)
        .expect("run");

    let prompts = completion.prompts();
    let second_code_prompt = &prompts[3].user;
    assert!(second_code_prompt.contains("stop raising"));
    assert!(second_code_prompt.contains("- ValueError: bad input"));
    assert!(second_code_prompt.contains(CRASHING));
}

#[test]
fn completion_errors_propagate() {
    let completion = ScriptedCompletion::new(vec!["1. go"]).then_fail("provider unavailable");
    let memory = RecordingMemory::default();
    let sandbox = ScriptedSandbox::new(vec![]);

    let err = RepairLoop::new(&completion, &memory, &sandbox)
        .run("task", 3)
        .expect_err("completion failure");
    assert!(format!("{err:#}").contains("provider unavailable"));
    assert_eq!(sandbox.runs(), 0);
}

#[test]
fn memory_write_errors_propagate() {
    let completion = ScriptedCompletion::new(vec!["1. go", WORKING]);
    let memory = RecordingMemory::failing_writes();
    let sandbox = ScriptedSandbox::new(vec![SandboxResult::success("6")]);

    let repair = RepairLoop::new(&completion, &memory, &sandbox);
    let mut steps = repair.steps("task", 3);
    let results: Vec<_> = steps.by_ref().collect();

    assert!(results.last().expect("last").is_err());
    assert!(results[..results.len() - 1].iter().all(Result::is_ok));
    assert!(steps.outcome().is_none());
}

struct FixedResearcher;

impl Researcher for FixedResearcher {
    fn search(&self, query: &str) -> String {
        format!("Title: {query}\nLink: https://docs.python.org\nSnippet: use sum()")
    }
}

#[test]
fn research_notes_feed_planning() {
    let completion = ScriptedCompletion::new(vec![
        "python sum builtin",
        "Use the built-in sum().",
        "1. call sum",
        WORKING,
    ]);
    let memory = RecordingMemory::default();
    let sandbox = ScriptedSandbox::new(vec![SandboxResult::success("6")]);

    let repair = RepairLoop::new(&completion, &memory, &sandbox)
        .with_researcher(Box::new(FixedResearcher));
    let updates: Vec<_> = repair
        .steps("sum a list", 3)
        .map(|u| u.expect("step"))
        .collect();

    assert_eq!(updates[1].step, StepName::Research);
    assert_eq!(updates[1].state.status, Status::Planning);
    assert_eq!(
        updates[1].state.research_notes,
        vec!["Use the built-in sum().".to_string()]
    );
    let prompts = completion.prompts();
    assert!(prompts[1].user.contains("Snippet: use sum()"));
    assert!(prompts[2].user.contains("Use the built-in sum()."));
    assert_eq!(updates.last().expect("last").state.status, Status::Finished);
}

#[test]
fn repeated_retrieval_is_stable() {
    let store = MemoryStore::in_memory(&MemoryConfig::default());
    store
        .store_failure("TypeError: unsupported operand", "1 + 'a'", "1 + 1", "add values")
        .expect("store");
    let first = store
        .retrieve_similar_failures("add values", "TypeError")
        .expect("first");
    let second = store
        .retrieve_similar_failures("add values", "TypeError")
        .expect("second");
    assert_eq!(first, second);
}
