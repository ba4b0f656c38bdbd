//! Completion backends.
//!
//! The [`Completion`] trait decouples the repair loop from the model provider.
//! The provider is chosen once from config by [`build_completion`]; tests use
//! scripted completions that return predetermined replies.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::io::config::{CompletionConfig, ProviderKind};
use crate::io::process::run_command_with_timeout;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Replies larger than this from the command provider are truncated.
const COMMAND_OUTPUT_LIMIT: usize = 1024 * 1024;

/// A system instruction plus the user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }

    /// Single-text rendering for backends without a system channel.
    pub fn flatten(&self) -> String {
        if self.system.trim().is_empty() {
            return self.user.clone();
        }
        format!("{}\n\n{}", self.system.trim(), self.user)
    }
}

/// Text-in, text-out model call.
pub trait Completion {
    fn complete(&self, prompt: &Prompt) -> Result<String>;
}

impl<C: Completion + ?Sized> Completion for &C {
    fn complete(&self, prompt: &Prompt) -> Result<String> {
        (**self).complete(prompt)
    }
}

impl<C: Completion + ?Sized> Completion for Box<C> {
    fn complete(&self, prompt: &Prompt) -> Result<String> {
        (**self).complete(prompt)
    }
}

/// Construct the configured provider.
pub fn build_completion(config: &CompletionConfig) -> Result<Box<dyn Completion>> {
    info!(provider = ?config.provider, model = %config.model, "using completion provider");
    Ok(match config.provider {
        ProviderKind::Command => Box::new(CommandCompletion::new(config)?),
        ProviderKind::OpenAi => Box::new(OpenAiCompletion::new(config)?),
        ProviderKind::Anthropic => Box::new(AnthropicCompletion::new(config)?),
    })
}

/// Pipes the flattened prompt to a CLI on stdin and returns its stdout.
pub struct CommandCompletion {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandCompletion {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        if config.command.is_empty() {
            bail!("completion.command must be a non-empty array");
        }
        Ok(Self {
            argv: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

impl Completion for CommandCompletion {
    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs()))]
    fn complete(&self, prompt: &Prompt) -> Result<String> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("completion command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);

        let text = prompt.flatten();
        let output = run_command_with_timeout(
            cmd,
            Some(text.as_bytes()),
            self.timeout,
            COMMAND_OUTPUT_LIMIT,
        )
        .context("spawn completion command")?;

        if output.timed_out {
            warn!("completion command timed out");
            return Err(anyhow!(
                "completion command timed out after {:?}",
                self.timeout
            ));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "completion command failed");
            return Err(anyhow!(
                "completion command failed with status {:?}: {}",
                output.status.code(),
                output.stderr_text()
            ));
        }

        let reply = output.stdout_text();
        debug!(reply_len = reply.len(), "completion command finished");
        Ok(reply)
    }
}

fn api_key(config: &CompletionConfig, default_env: &str) -> Result<String> {
    let name = config.api_key_env.as_deref().unwrap_or(default_env);
    std::env::var(name).with_context(|| format!("{name} not set"))
}

fn http_client(timeout_secs: u64) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("build http client")
}

/// OpenAI-compatible Chat Completions client (also OpenRouter via `base_url`).
pub struct OpenAiCompletion {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiCompletion {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            api_key: api_key(config, "OPENAI_API_KEY")?,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

impl Completion for OpenAiCompletion {
    #[instrument(skip_all, fields(model = %self.model))]
    fn complete(&self, prompt: &Prompt) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if !prompt.system.trim().is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &prompt.system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &prompt.user,
        });
        let body = ChatRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages,
        };

        debug!(prompt_len = prompt.user.len(), "invoking chat completions API");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .context("send chat completions request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("chat completions API error ({status}): {body}");
        }

        let parsed: ChatResponse = response
            .json()
            .context("parse chat completions response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("chat completions response had no content"))
    }
}

/// Anthropic Messages API client.
pub struct AnthropicCompletion {
    client: reqwest::blocking::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicCompletion {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string()),
            api_key: api_key(config, "ANTHROPIC_API_KEY")?,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

impl Completion for AnthropicCompletion {
    #[instrument(skip_all, fields(model = %self.model))]
    fn complete(&self, prompt: &Prompt) -> Result<String> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: Some(prompt.system.as_str()).filter(|s| !s.trim().is_empty()),
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt.user,
            }],
        };

        debug!(prompt_len = prompt.user.len(), "invoking messages API");
        let response = self
            .client
            .post(format!("{}/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .context("send messages request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("messages API error ({status}): {body}");
        }

        let parsed: MessagesResponse = response.json().context("parse messages response")?;
        Ok(collect_text(&parsed.content))
    }
}

fn collect_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter(|block| block.block_type == "text")
        .filter_map(|block| block.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n")
}
