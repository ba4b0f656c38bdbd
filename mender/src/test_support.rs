//! Scripted collaborators for exercising the repair loop without a model,
//! a container runtime or a memory directory.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use anyhow::{Result, anyhow};

use crate::core::types::{FailureRecord, SandboxResult, SuccessRecord};
use crate::io::completion::{Completion, Prompt};
use crate::io::memory_store::EpisodicMemory;
use crate::io::sandbox::{Sandbox, SandboxMode};

/// Completion that replays queued replies in order and records every prompt.
pub struct ScriptedCompletion {
    replies: RefCell<VecDeque<Result<String, String>>>,
    prompts: RefCell<Vec<Prompt>>,
}

impl ScriptedCompletion {
    pub fn new<S: Into<String>>(replies: Vec<S>) -> Self {
        Self {
            replies: RefCell::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Queue a provider failure after the current replies.
    pub fn then_fail(self, message: &str) -> Self {
        self.replies.borrow_mut().push_back(Err(message.to_string()));
        self
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.borrow().clone()
    }

    pub fn assert_drained(&self) -> Result<()> {
        let remaining = self.replies.borrow().len();
        if remaining > 0 {
            return Err(anyhow!("scripted completion has {remaining} unused replies"));
        }
        Ok(())
    }
}

impl Completion for ScriptedCompletion {
    fn complete(&self, prompt: &Prompt) -> Result<String> {
        self.prompts.borrow_mut().push(prompt.clone());
        match self.replies.borrow_mut().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted completion exhausted")),
        }
    }
}

/// Sandbox that returns queued results and records the programs it was given.
pub struct ScriptedSandbox {
    results: RefCell<VecDeque<SandboxResult>>,
    programs: RefCell<Vec<String>>,
    mode: SandboxMode,
}

impl ScriptedSandbox {
    pub fn new(results: Vec<SandboxResult>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            programs: RefCell::new(Vec::new()),
            mode: SandboxMode::Isolated,
        }
    }

    pub fn runs(&self) -> usize {
        self.programs.borrow().len()
    }

    pub fn programs(&self) -> Vec<String> {
        self.programs.borrow().clone()
    }

    pub fn assert_drained(&self) -> Result<()> {
        let remaining = self.results.borrow().len();
        if remaining > 0 {
            return Err(anyhow!("scripted sandbox has {remaining} unused results"));
        }
        Ok(())
    }
}

impl Sandbox for ScriptedSandbox {
    fn run(&self, program: &str) -> SandboxResult {
        self.programs.borrow_mut().push(program.to_string());
        self.results
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| SandboxResult::failure("", "scripted sandbox exhausted"))
    }

    fn mode(&self) -> SandboxMode {
        self.mode
    }
}

/// Memory that records writes and answers retrievals from a fixed list.
#[derive(Default)]
pub struct RecordingMemory {
    seeded: Vec<FailureRecord>,
    failures: RefCell<Vec<FailureRecord>>,
    successes: RefCell<Vec<SuccessRecord>>,
    retrievals: Cell<usize>,
    fail_writes: bool,
}

impl RecordingMemory {
    /// Memory whose failure retrievals always return `seeded`.
    pub fn with_failures(seeded: Vec<FailureRecord>) -> Self {
        Self {
            seeded,
            ..Self::default()
        }
    }

    /// Memory whose writes all fail.
    pub fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.failures.borrow().clone()
    }

    pub fn successes(&self) -> Vec<SuccessRecord> {
        self.successes.borrow().clone()
    }

    pub fn retrievals(&self) -> usize {
        self.retrievals.get()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes {
            return Err(anyhow!("memory store unavailable"));
        }
        Ok(())
    }
}

impl EpisodicMemory for RecordingMemory {
    fn retrieve_similar_failures(&self, _task: &str, _error: &str) -> Result<Vec<FailureRecord>> {
        self.retrievals.set(self.retrievals.get() + 1);
        Ok(self.seeded.clone())
    }

    fn store_failure(&self, error: &str, failed_code: &str, fix: &str, task: &str) -> Result<()> {
        self.check_writable()?;
        self.failures
            .borrow_mut()
            .push(FailureRecord::new(error, failed_code, fix, task));
        Ok(())
    }

    fn store_success(&self, task: &str, code: &str) -> Result<()> {
        self.check_writable()?;
        self.successes
            .borrow_mut()
            .push(SuccessRecord::new(task, code));
        Ok(())
    }

    fn retrieve_similar_successes(&self, _task: &str) -> Result<Vec<SuccessRecord>> {
        Ok(self.successes())
    }
}
