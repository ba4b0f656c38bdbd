//! `mender`: a self-repairing coding agent.
//!
//! Plans a Python program for a task, runs it in a sandbox, reflects on
//! failures and retries. Lessons are stored under `.mender/memory/` and every
//! run leaves artifacts under `.mender/runs/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mender::exit_codes;
use mender::io::completion::build_completion;
use mender::io::config::{DEFAULT_CONFIG_PATH, MenderConfig, load_config, write_config};
use mender::io::memory_store::{EpisodicMemory, MemoryStore};
use mender::io::research::CommandResearcher;
use mender::io::run_log::{run_id, write_run};
use mender::io::sandbox::{ProcessSandbox, Sandbox, SandboxMode};
use mender::logging;
use mender::repair::{RepairLoop, StepName, StepUpdate};

#[derive(Parser)]
#[command(
    name = "mender",
    version,
    about = "Self-repairing coding agent: plan, code, run sandboxed, reflect, remember"
)]
struct Cli {
    /// Config file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file and create the memory directory.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Solve a task with the repair loop.
    Run {
        /// Natural-language task description.
        task: String,
        /// Override `max_iterations` from the config.
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Use a throwaway in-memory store (nothing read or saved).
        #[arg(long)]
        no_memory: bool,
    },
    /// Run the safety gate on a Python file.
    Check {
        /// Python source file.
        file: PathBuf,
    },
    /// Show remembered solutions and lessons similar to a task.
    Recall {
        /// Natural-language task description.
        task: String,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Run {
            task,
            max_iterations,
            no_memory,
        } => cmd_run(&cli.config, &task, max_iterations, no_memory),
        Command::Check { file } => cmd_check(&cli.config, &file),
        Command::Recall { task } => cmd_recall(&cli.config, &task),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    let cfg = if config_path.exists() && !force {
        println!("config exists: {}", config_path.display());
        load_config(config_path)?
    } else {
        let cfg = MenderConfig::default();
        write_config(config_path, &cfg)?;
        println!("wrote {}", config_path.display());
        cfg
    };
    fs::create_dir_all(&cfg.memory_dir)
        .with_context(|| format!("create memory dir {}", cfg.memory_dir.display()))?;
    Ok(exit_codes::OK)
}

fn cmd_run(
    config_path: &Path,
    task: &str,
    max_iterations: Option<u32>,
    no_memory: bool,
) -> Result<i32> {
    let mut cfg = load_config(config_path)?;
    if let Some(max) = max_iterations {
        cfg.max_iterations = max;
    }
    cfg.validate()?;

    let completion = build_completion(&cfg.completion)?;
    let sandbox = ProcessSandbox::connect(&cfg.sandbox);
    if sandbox.mode() == SandboxMode::Local {
        println!("sandbox: LOCAL fallback (generated code is NOT isolated)");
    } else {
        println!("sandbox: isolated container ({})", cfg.sandbox.image);
    }
    let store = if no_memory {
        MemoryStore::in_memory(&cfg.memory)
    } else {
        MemoryStore::open(&cfg.memory_dir, &cfg.memory)?
    };

    let mut repair = RepairLoop::new(completion, &store, sandbox)
        .with_safety_policy(cfg.safety.policy())
        .with_prompt_budget(cfg.completion.prompt_budget_bytes);
    if cfg.research.enabled {
        repair = repair.with_researcher(Box::new(CommandResearcher::new(&cfg.research)?));
    }

    println!("task: {task}");
    let outcome = repair.run_with(task, cfg.max_iterations, print_progress)?;

    let id = run_id(task, SystemTime::now());
    let dir = write_run(&cfg.runs_dir, &id, &outcome.state, repair.sandbox().mode())?;

    if outcome.is_success() {
        println!(
            "solved in {} iteration(s); artifacts in {}",
            outcome.iterations,
            dir.display()
        );
        println!("--- final code ---\n{}", outcome.final_code);
        Ok(exit_codes::OK)
    } else {
        println!(
            "not solved after {} iteration(s); artifacts in {}",
            outcome.iterations,
            dir.display()
        );
        Ok(exit_codes::FAILED)
    }
}

fn cmd_check(config_path: &Path, file: &Path) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let code =
        fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    let verdict = cfg.safety.policy().check(&code);
    println!("{}", verdict.reason);
    Ok(if verdict.is_safe {
        exit_codes::OK
    } else {
        exit_codes::UNSAFE
    })
}

fn cmd_recall(config_path: &Path, task: &str) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let store = MemoryStore::open(&cfg.memory_dir, &cfg.memory)?;

    let successes = store.retrieve_similar_successes(task)?;
    println!("similar solved tasks: {}", successes.len());
    for (idx, record) in successes.iter().enumerate() {
        println!("{}. {}\n{}\n", idx + 1, record.task, indent(&record.code));
    }

    let failures = store.retrieve_similar_failures(task, "")?;
    println!("related lessons: {}", failures.len());
    for record in &failures {
        println!(
            "- [{}] Error: {}\n  Fix:\n{}",
            record.task,
            summary_line(&record.error),
            indent(&record.fix)
        );
    }
    Ok(exit_codes::OK)
}

fn print_progress(update: &StepUpdate) {
    let state = &update.state;
    match update.step {
        StepName::RetrieveMemory => {
            let lessons = state
                .retrieved_context
                .lines()
                .filter(|line| line.starts_with("- Error:"))
                .count();
            if lessons > 0 {
                println!("[memory] {lessons} related lesson(s)");
            } else {
                println!("[memory] no related lessons");
            }
        }
        StepName::Research => {
            println!("[research] {} note(s)", state.research_notes.len());
        }
        StepName::Plan => {
            println!("[plan]");
            for step in &state.plan {
                println!("  {step}");
            }
        }
        StepName::Code => {
            println!(
                "[code] iteration {}/{}: {} chars",
                state.iteration,
                state.max_iterations,
                state.current_code.len()
            );
        }
        StepName::Execute => match state.last_attempt().and_then(|a| a.failure()) {
            Some(error) => println!("[execute] failed: {}", summary_line(error)),
            None => println!("[execute] ok"),
        },
        StepName::Reflect => {
            if let Some(reflection) = state.latest_reflection() {
                println!("[reflect] {}", summary_line(reflection));
            }
        }
        StepName::GiveUp => println!("[done] iterations exhausted"),
        StepName::SaveMemory => println!("[memory] saved solution and lessons"),
    }
}

/// Last non-empty line; for tracebacks that is the exception message.
fn summary_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_default()
        .trim()
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "mender",
            "run",
            "print primes",
            "--max-iterations",
            "4",
            "--no-memory",
            "--config",
            "alt.toml",
        ]);
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
        assert!(matches!(
            cli.command,
            Command::Run {
                max_iterations: Some(4),
                no_memory: true,
                ..
            }
        ));
    }

    #[test]
    fn parse_check_defaults_config_path() {
        let cli = Cli::parse_from(["mender", "check", "prog.py"]);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(matches!(cli.command, Command::Check { .. }));
    }

    #[test]
    fn summary_line_prefers_last_traceback_line() {
        let error = "Traceback (most recent call last):\n  File \"x\"\nValueError: bad\n";
        assert_eq!(summary_line(error), "ValueError: bad");
    }
}
