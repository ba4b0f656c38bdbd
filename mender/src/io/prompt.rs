//! Prompt builder for the planner, coder, reflector and researcher calls.
//!
//! Templates mark their sections with `<!-- section:KEY required|droppable -->`.
//! When a rendered prompt exceeds the byte budget, droppable sections are removed
//! in a fixed order and the largest remaining section is truncated as a last resort.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::io::completion::Prompt;

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const CODE_TEMPLATE: &str = include_str!("prompts/code.md");
const REFLECT_TEMPLATE: &str = include_str!("prompts/reflect.md");
const RESEARCH_QUERY_TEMPLATE: &str = include_str!("prompts/research_query.md");
const RESEARCH_SUMMARY_TEMPLATE: &str = include_str!("prompts/research_summary.md");

const PLAN_SYSTEM: &str = "You are a senior Python engineer. Create a step-by-step implementation plan for the task, using the lessons from past failures when they apply.";
const CODE_SYSTEM: &str = "You write a single self-contained Python 3 program that solves the task by following the plan. The program runs without network access and must print its result to stdout. Avoid os, subprocess, sys, shutil, requests, socket, exec, eval, open and compile.";
const REFLECT_SYSTEM: &str = "Analyze the error and the code that produced it. Explain the root cause and give a concrete fix strategy for the next attempt.";
const RESEARCH_QUERY_SYSTEM: &str = "Analyze the task and context. If web research is needed, output a concise search query. Otherwise output NO_SEARCH.";
const RESEARCH_SUMMARY_SYSTEM: &str = "Summarize the search results into actionable notes for coding.";

/// Droppable sections in the order they are removed when over budget.
const DROP_ORDER: [&str; 6] = [
    "research",
    "errors",
    "previous_code",
    "output",
    "context",
    "reflection",
];

const TRUNCATION_MARKER: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
        .expect("section regex should be valid")
});

static ENGINE: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    for (name, source) in [
        ("plan", PLAN_TEMPLATE),
        ("code", CODE_TEMPLATE),
        ("reflect", REFLECT_TEMPLATE),
        ("research_query", RESEARCH_QUERY_TEMPLATE),
        ("research_summary", RESEARCH_SUMMARY_TEMPLATE),
    ] {
        env.add_template(name, source)
            .expect("embedded prompt template should be valid");
    }
    env
});

/// Inputs for the coding prompt.
#[derive(Debug, Clone, Default)]
pub struct CodeInputs<'a> {
    pub task: &'a str,
    pub plan: &'a [String],
    pub research_notes: &'a [String],
    pub previous_code: &'a str,
    pub prior_errors: &'a [&'a str],
    pub latest_reflection: Option<&'a str>,
}

/// Builds prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn plan(&self, task: &str, context: &str, research_notes: &[String]) -> Result<Prompt> {
        let rendered = render(
            "plan",
            context! {
                task => task.trim(),
                context => non_empty(context),
                research => research_notes,
            },
        )?;
        Ok(Prompt::new(PLAN_SYSTEM, self.fit(&rendered)))
    }

    pub fn code(&self, input: &CodeInputs<'_>) -> Result<Prompt> {
        let rendered = render(
            "code",
            context! {
                task => input.task.trim(),
                plan => input.plan,
                research => input.research_notes,
                previous_code => non_empty(input.previous_code),
                errors => input.prior_errors,
                reflection => input.latest_reflection.and_then(non_empty),
            },
        )?;
        Ok(Prompt::new(CODE_SYSTEM, self.fit(&rendered)))
    }

    pub fn reflect(&self, code: &str, error: &str, output: &str) -> Result<Prompt> {
        let rendered = render(
            "reflect",
            context! {
                code => code,
                error => error.trim(),
                output => non_empty(output),
            },
        )?;
        Ok(Prompt::new(REFLECT_SYSTEM, self.fit(&rendered)))
    }

    pub fn research_query(&self, task: &str, context: &str) -> Result<Prompt> {
        let rendered = render(
            "research_query",
            context! {
                task => task.trim(),
                context => non_empty(context),
            },
        )?;
        Ok(Prompt::new(RESEARCH_QUERY_SYSTEM, self.fit(&rendered)))
    }

    pub fn research_summary(&self, task: &str, results: &str) -> Result<Prompt> {
        let rendered = render(
            "research_summary",
            context! {
                task => task.trim(),
                results => results.trim(),
            },
        )?;
        Ok(Prompt::new(RESEARCH_SUMMARY_SYSTEM, self.fit(&rendered)))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget(&mut sections, self.budget_bytes);
        join_sections(&sections)
    }
}

fn non_empty(text: &str) -> Option<&str> {
    Some(text.trim()).filter(|t| !t.is_empty())
}

fn render(name: &str, ctx: minijinja::Value) -> Result<String> {
    ENGINE
        .get_template(name)
        .and_then(|template| template.render(ctx))
        .with_context(|| format!("render {name} prompt"))
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                caps.get(1)?.as_str().to_string(),
                caps.get(2)?.as_str() == "required",
                whole.start(),
                whole.end(),
            ))
        })
        .collect();

    let mut sections = Vec::with_capacity(markers.len());
    for (i, (key, required, _, body_start)) in markers.iter().enumerate() {
        let body_end = markers
            .get(i + 1)
            .map(|next| next.2)
            .unwrap_or(rendered.len());
        let content = rendered[*body_start..body_end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(Section {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

/// Rendered length, counting the blank-line separators.
fn total_len(sections: &[Section]) -> usize {
    let body: usize = sections.iter().map(|s| s.content.len()).sum();
    body + 2 * sections.len().saturating_sub(1)
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            let dropped = sections.remove(idx);
            debug!(
                section = key,
                bytes_dropped = dropped.content.len(),
                "dropped prompt section for budget"
            );
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let Some(idx) = (0..sections.len()).max_by_key(|&i| sections[i].content.len()) else {
        return;
    };
    let allowed = budget.saturating_sub(total_len(sections) - sections[idx].content.len());
    let section = &mut sections[idx];
    let before_len = section.content.len();
    let keep = allowed.saturating_sub(TRUNCATION_MARKER.len());
    truncate_at_char_boundary(&mut section.content, keep);
    if allowed > TRUNCATION_MARKER.len() {
        section.content.push_str(TRUNCATION_MARKER);
    }
    debug!(
        section = %section.key,
        before_len,
        after_len = section.content.len(),
        "truncated prompt section for budget"
    );
}

fn truncate_at_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

fn join_sections(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
