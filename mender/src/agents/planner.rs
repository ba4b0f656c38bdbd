//! Planner agent: turns the task and retrieved lessons into a step list.

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::extract::parse_plan;
use crate::io::completion::Completion;
use crate::io::prompt::PromptBuilder;

#[derive(Debug, Clone)]
pub struct PlannerAgent {
    prompts: PromptBuilder,
}

impl PlannerAgent {
    pub fn new(prompt_budget_bytes: usize) -> Self {
        Self {
            prompts: PromptBuilder::new(prompt_budget_bytes),
        }
    }

    pub fn run<C: Completion + ?Sized>(
        &self,
        completion: &C,
        task: &str,
        retrieved_context: &str,
        research_notes: &[String],
    ) -> Result<Vec<String>> {
        let prompt = self.prompts.plan(task, retrieved_context, research_notes)?;
        let reply = completion.complete(&prompt).context("planner completion")?;
        let plan = parse_plan(&reply);
        debug!(steps = plan.len(), "parsed plan");
        Ok(plan)
    }
}
