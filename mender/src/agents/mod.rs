//! Prompted completion calls used by the repair loop.
//!
//! Each agent owns its prompt settings, renders a prompt from loop state and
//! post-processes the reply. None of them touch the filesystem.

pub mod coder;
pub mod planner;
pub mod reflector;
pub mod researcher;

use coder::CoderAgent;
use planner::PlannerAgent;
use reflector::ReflectorAgent;
use researcher::ResearchAgent;

/// The four prompted roles, sharing one prompt budget.
#[derive(Debug, Clone)]
pub struct Agents {
    pub planner: PlannerAgent,
    pub coder: CoderAgent,
    pub reflector: ReflectorAgent,
    pub research: ResearchAgent,
}

impl Agents {
    pub fn new(prompt_budget_bytes: usize) -> Self {
        Self {
            planner: PlannerAgent::new(prompt_budget_bytes),
            coder: CoderAgent::new(prompt_budget_bytes),
            reflector: ReflectorAgent::new(prompt_budget_bytes),
            research: ResearchAgent::new(prompt_budget_bytes),
        }
    }
}

#[cfg(test)]
pub(crate) mod capture {
    use std::cell::RefCell;

    use anyhow::Result;

    use crate::io::completion::{Completion, Prompt};

    /// Completion that records the last prompt and returns a fixed reply.
    pub struct CapturingCompletion {
        reply: String,
        pub last_prompt: RefCell<Option<Prompt>>,
    }

    impl CapturingCompletion {
        pub fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                last_prompt: RefCell::new(None),
            }
        }

        pub fn prompt(&self) -> Prompt {
            self.last_prompt.borrow().clone().expect("prompt captured")
        }
    }

    impl Completion for CapturingCompletion {
        fn complete(&self, prompt: &Prompt) -> Result<String> {
            *self.last_prompt.borrow_mut() = Some(prompt.clone());
            Ok(self.reply.clone())
        }
    }
}
