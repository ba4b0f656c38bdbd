//! Post-processing of completion text into plans and programs.

use std::sync::LazyLock;

use regex::Regex;

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)```").expect("fence regex should be valid")
});

/// Split a plan reply into its non-empty, trimmed lines.
pub fn parse_plan(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Strip Markdown code fences from a generated program.
///
/// When the reply contains fenced blocks, their bodies are kept and any prose
/// around them is dropped. Stray fence markers are removed otherwise.
pub fn strip_code_fences(text: &str) -> String {
    let blocks: Vec<&str> = FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim_end()))
        .collect();
    if !blocks.is_empty() {
        return blocks.join("\n\n").trim().to_string();
    }
    text.replace("```python", "")
        .replace("```", "")
        .trim()
        .to_string()
}
