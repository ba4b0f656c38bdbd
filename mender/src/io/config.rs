//! Agent configuration stored under `.mender/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::safety::SafetyPolicy;

/// Default location of the config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = ".mender/config.toml";

/// Agent configuration (TOML).
///
/// Missing fields default to values that work with a local `docker` daemon
/// and the `codex` CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MenderConfig {
    /// Maximum coding steps per run.
    pub max_iterations: u32,

    /// Directory holding the episodic memory collections.
    pub memory_dir: PathBuf,

    /// Directory receiving per-run artifacts.
    pub runs_dir: PathBuf,

    pub sandbox: SandboxConfig,
    pub completion: CompletionConfig,
    pub memory: MemoryConfig,
    pub safety: SafetyConfig,
    pub research: ResearchConfig,
}

impl Default for MenderConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            memory_dir: PathBuf::from(".mender/memory"),
            runs_dir: PathBuf::from(".mender/runs"),
            sandbox: SandboxConfig::default(),
            completion: CompletionConfig::default(),
            memory: MemoryConfig::default(),
            safety: SafetyConfig::default(),
            research: ResearchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container image for isolated runs.
    pub image: String,
    /// Interpreter used inside the container and by the local fallback.
    pub interpreter: String,
    /// Hard wall-clock limit for one program run.
    pub timeout_secs: u64,
    pub memory_limit_mb: u64,
    pub pids_limit: u32,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Limit for the backend health check and container housekeeping calls.
    pub probe_timeout_secs: u64,
    /// Skip the isolation probe and always run locally (NOT isolated).
    pub force_local: bool,
    /// Container control CLI (`["docker"]`, `["podman"]`, `["sudo", "docker"]`).
    pub docker_command: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "python:3.10-slim".to_string(),
            interpreter: "python3".to_string(),
            timeout_secs: 10,
            memory_limit_mb: 128,
            pids_limit: 20,
            output_limit_bytes: 100_000,
            probe_timeout_secs: 5,
            force_local: false,
            docker_command: vec!["docker".to_string()],
        }
    }
}

/// Which completion backend to construct.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Pipe the prompt to a CLI on stdin and read the reply from stdout.
    Command,
    /// OpenAI-compatible Chat Completions API (also OpenRouter).
    OpenAi,
    /// Anthropic Messages API.
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompletionConfig {
    pub provider: ProviderKind,
    /// Model name for HTTP providers.
    pub model: String,
    /// Command line for the `command` provider.
    pub command: Vec<String>,
    /// Base URL override for HTTP providers.
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    /// Prompt size budget before droppable sections are removed.
    pub prompt_budget_bytes: usize,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Command,
            model: "gpt-4-turbo".to_string(),
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            base_url: None,
            api_key_env: None,
            timeout_secs: 10 * 60,
            max_tokens: 4096,
            prompt_budget_bytes: 40_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    /// Number of neighbors returned by similarity search.
    pub top_k: usize,
    /// Neighbors scoring at or below this cosine similarity are ignored.
    pub min_similarity: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            min_similarity: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SafetyConfig {
    /// Modules denied in addition to the built-in list.
    pub extra_imports: Vec<String>,
    /// Call targets denied in addition to the built-in list.
    pub extra_calls: Vec<String>,
}

impl SafetyConfig {
    pub fn policy(&self) -> SafetyPolicy {
        SafetyPolicy::with_extra(self.extra_imports.clone(), self.extra_calls.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResearchConfig {
    pub enabled: bool,
    /// Search command; the query is appended as the last argument.
    pub command: Vec<String>,
    pub timeout_secs: Option<u64>,
}

impl MenderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.sandbox.memory_limit_mb == 0 || self.sandbox.pids_limit == 0 {
            return Err(anyhow!("sandbox memory and pids limits must be > 0"));
        }
        if self.sandbox.interpreter.trim().is_empty() {
            return Err(anyhow!("sandbox.interpreter must be non-empty"));
        }
        if self.sandbox.docker_command.is_empty() {
            return Err(anyhow!("sandbox.docker_command must be a non-empty array"));
        }
        if self.completion.timeout_secs == 0 {
            return Err(anyhow!("completion.timeout_secs must be > 0"));
        }
        if self.completion.provider == ProviderKind::Command
            && (self.completion.command.is_empty() || self.completion.command[0].trim().is_empty())
        {
            return Err(anyhow!("completion.command must be a non-empty array"));
        }
        if self.memory.top_k == 0 {
            return Err(anyhow!("memory.top_k must be > 0"));
        }
        if self.research.enabled && self.research.command.is_empty() {
            return Err(anyhow!("research.command is required when research is enabled"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `MenderConfig::default()`.
pub fn load_config(path: &Path) -> Result<MenderConfig> {
    if !path.exists() {
        let cfg = MenderConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: MenderConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &MenderConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
