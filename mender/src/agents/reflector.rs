//! Reflector agent: diagnoses the latest failed attempt.

use anyhow::{Context, Result, anyhow};

use crate::core::types::AttemptRecord;
use crate::io::completion::Completion;
use crate::io::prompt::PromptBuilder;

#[derive(Debug, Clone)]
pub struct ReflectorAgent {
    prompts: PromptBuilder,
}

impl ReflectorAgent {
    pub fn new(prompt_budget_bytes: usize) -> Self {
        Self {
            prompts: PromptBuilder::new(prompt_budget_bytes),
        }
    }

    /// Diagnosis text for a failed attempt.
    pub fn run<C: Completion + ?Sized>(&self, completion: &C, attempt: &AttemptRecord) -> Result<String> {
        let error = attempt
            .failure()
            .ok_or_else(|| anyhow!("cannot reflect on a successful attempt"))?;
        let prompt = self.prompts.reflect(&attempt.code, error, &attempt.output)?;
        let reply = completion.complete(&prompt).context("reflector completion")?;
        Ok(reply.trim().to_string())
    }
}
