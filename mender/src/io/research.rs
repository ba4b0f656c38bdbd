//! Web research backend.
//!
//! Search never fails the loop: problems come back as a `"Search failed: ..."`
//! string the planner can read.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::io::config::ResearchConfig;
use crate::io::process::run_command_with_timeout;

const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
const SEARCH_OUTPUT_LIMIT: usize = 256 * 1024;

/// Maximum results included in the formatted text.
pub const MAX_RESULTS: usize = 5;

pub const NO_RESULTS: &str = "No results found.";

/// Returns formatted search results for a query.
pub trait Researcher {
    fn search(&self, query: &str) -> String;
}

impl<R: Researcher + ?Sized> Researcher for &R {
    fn search(&self, query: &str) -> String {
        (**self).search(query)
    }
}

/// One search hit as emitted by the search command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub href: String,
    #[serde(default)]
    pub body: String,
}

/// Runs a search CLI that prints a JSON array of `{title, href, body}`.
pub struct CommandResearcher {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandResearcher {
    pub fn new(config: &ResearchConfig) -> Result<Self> {
        if config.command.is_empty() {
            bail!("research.command must be a non-empty array");
        }
        Ok(Self {
            argv: config.command.clone(),
            timeout: config
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_SEARCH_TIMEOUT),
        })
    }

    fn run(&self, query: &str) -> Result<Vec<SearchHit>> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("research command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).arg(query);

        let output = run_command_with_timeout(cmd, None, self.timeout, SEARCH_OUTPUT_LIMIT)
            .context("spawn search command")?;
        if output.timed_out {
            bail!("search timed out after {:?}", self.timeout);
        }
        if !output.status.success() {
            bail!(
                "search command exited with {:?}: {}",
                output.status.code(),
                output.stderr_text()
            );
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(stdout.trim()).context("parse search results")
    }
}

impl Researcher for CommandResearcher {
    #[instrument(skip_all, fields(query_len = query.len()))]
    fn search(&self, query: &str) -> String {
        match self.run(query) {
            Ok(hits) => {
                debug!(hits = hits.len(), "search finished");
                format_results(&hits)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "search failed");
                format!("Search failed: {err:#}")
            }
        }
    }
}

/// Render hits as `Title/Link/Snippet` blocks separated by blank lines.
pub fn format_results(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return NO_RESULTS.to_string();
    }
    hits.iter()
        .take(MAX_RESULTS)
        .map(|hit| {
            format!(
                "Title: {}\nLink: {}\nSnippet: {}",
                hit.title, hit.href, hit.body
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
