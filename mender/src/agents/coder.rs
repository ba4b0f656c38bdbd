//! Coder agent: produces the next program from plan, errors and reflection.

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::extract::strip_code_fences;
use crate::core::state::LoopState;
use crate::io::completion::Completion;
use crate::io::prompt::{CodeInputs, PromptBuilder};

#[derive(Debug, Clone)]
pub struct CoderAgent {
    prompts: PromptBuilder,
}

impl CoderAgent {
    pub fn new(prompt_budget_bytes: usize) -> Self {
        Self {
            prompts: PromptBuilder::new(prompt_budget_bytes),
        }
    }

    pub fn run<C: Completion + ?Sized>(&self, completion: &C, state: &LoopState) -> Result<String> {
        let prior_errors = state.prior_errors();
        let prompt = self.prompts.code(&CodeInputs {
            task: &state.task,
            plan: &state.plan,
            research_notes: &state.research_notes,
            previous_code: &state.current_code,
            prior_errors: &prior_errors,
            latest_reflection: state.latest_reflection(),
        })?;
        let reply = completion.complete(&prompt).context("coder completion")?;
        let code = strip_code_fences(&reply);
        debug!(code_len = code.len(), "generated program");
        Ok(code)
    }
}
