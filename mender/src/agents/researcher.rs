//! Research agent: decides whether to search, then summarizes the results.

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::io::completion::Completion;
use crate::io::prompt::PromptBuilder;
use crate::io::research::Researcher;

/// Reply token meaning no search is needed.
pub const NO_SEARCH: &str = "NO_SEARCH";

#[derive(Debug, Clone)]
pub struct ResearchAgent {
    prompts: PromptBuilder,
}

impl ResearchAgent {
    pub fn new(prompt_budget_bytes: usize) -> Self {
        Self {
            prompts: PromptBuilder::new(prompt_budget_bytes),
        }
    }

    /// Research notes for the task; empty when the model declines to search.
    pub fn run<C, R>(
        &self,
        completion: &C,
        researcher: &R,
        task: &str,
        retrieved_context: &str,
    ) -> Result<Vec<String>>
    where
        C: Completion + ?Sized,
        R: Researcher + ?Sized,
    {
        let prompt = self.prompts.research_query(task, retrieved_context)?;
        let reply = completion
            .complete(&prompt)
            .context("research query completion")?;
        let query = reply.trim();
        if query.is_empty() || query.contains(NO_SEARCH) {
            debug!("research skipped");
            return Ok(Vec::new());
        }

        info!(%query, "searching");
        let results = researcher.search(query);
        let prompt = self.prompts.research_summary(task, &results)?;
        let summary = completion
            .complete(&prompt)
            .context("research summary completion")?;
        Ok(vec![summary.trim().to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::capture::CapturingCompletion;
    use std::cell::RefCell;

    struct FixedResearcher {
        queries: RefCell<Vec<String>>,
    }

    impl Researcher for FixedResearcher {
        fn search(&self, query: &str) -> String {
            self.queries.borrow_mut().push(query.to_string());
            "Title: t\nLink: l\nSnippet: s".to_string()
        }
    }

    fn researcher() -> FixedResearcher {
        FixedResearcher {
            queries: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn no_search_reply_skips_research() {
        let completion = CapturingCompletion::new("NO_SEARCH");
        let researcher = researcher();
        let notes = ResearchAgent::new(10_000)
            .run(&completion, &researcher, "print 1", "")
            .expect("research");
        assert!(notes.is_empty());
        assert!(researcher.queries.borrow().is_empty());
    }

    #[test]
    fn query_is_searched_and_summarized() {
        // The same reply serves as both query and summary.
        let completion = CapturingCompletion::new("python dateutil parse");
        let researcher = researcher();
        let notes = ResearchAgent::new(10_000)
            .run(&completion, &researcher, "parse dates", "")
            .expect("research");
        assert_eq!(notes, vec!["python dateutil parse"]);
        assert_eq!(*researcher.queries.borrow(), vec!["python dateutil parse"]);
        assert!(completion.prompt().user.contains("Snippet: s"));
    }
}
