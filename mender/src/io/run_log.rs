//! Run artifacts under `.mender/runs/<run-id>/`.
//!
//! Product output of `mender run`: always written, independent of `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::core::state::LoopState;
use crate::core::types::Status;
use crate::io::sandbox::SandboxMode;

/// `<unix-seconds>-<first 8 hex chars of sha256(task)>`.
pub fn run_id(task: &str, now: SystemTime) -> String {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let digest = hex::encode(Sha256::digest(task.as_bytes()));
    format!("{secs}-{}", &digest[..8])
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptSummary<'a> {
    pub iteration: usize,
    pub file: String,
    pub output: &'a str,
    pub error: Option<&'a str>,
    pub reflection: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary<'a> {
    pub run_id: &'a str,
    pub task: &'a str,
    pub status: Status,
    pub iterations: u32,
    pub max_iterations: u32,
    pub sandbox: SandboxMode,
    pub plan: &'a [String],
    pub research_notes: &'a [String],
    pub final_code: &'a str,
    pub attempts: Vec<AttemptSummary<'a>>,
}

/// Write `outcome.json` plus one `attempt-<n>.py` per attempt. Returns the run directory.
pub fn write_run(
    runs_dir: &Path,
    run_id: &str,
    state: &LoopState,
    sandbox: SandboxMode,
) -> Result<PathBuf> {
    let dir = runs_dir.join(run_id);
    fs::create_dir_all(&dir).with_context(|| format!("create run dir {}", dir.display()))?;

    let mut attempts = Vec::with_capacity(state.history.len());
    for (idx, attempt) in state.history.iter().enumerate() {
        let file = attempt_file_name(idx + 1);
        write_text(&dir.join(&file), &attempt.code)?;
        attempts.push(AttemptSummary {
            iteration: idx + 1,
            file,
            output: &attempt.output,
            error: attempt.failure(),
            reflection: attempt.reflection.as_deref(),
        });
    }

    let summary = RunSummary {
        run_id,
        task: &state.task,
        status: state.status,
        iterations: state.iteration,
        max_iterations: state.max_iterations,
        sandbox,
        plan: &state.plan,
        research_notes: &state.research_notes,
        final_code: &state.current_code,
        attempts,
    };
    let mut buf = serde_json::to_string_pretty(&summary).context("serialize run outcome")?;
    buf.push('\n');
    write_text(&dir.join("outcome.json"), &buf)?;
    Ok(dir)
}

fn attempt_file_name(n: usize) -> String {
    format!("attempt-{n}.py")
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::types::AttemptRecord;

    #[test]
    fn run_id_is_time_and_task_digest() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let id = run_id("add two numbers", now);
        assert!(id.starts_with("1700000000-"));
        assert_eq!(id.len(), "1700000000-".len() + 8);
        assert_eq!(id, run_id("add two numbers", now));
        assert_ne!(id, run_id("add three numbers", now));
    }

    #[test]
    fn writes_outcome_and_attempt_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut state = LoopState::new("print hi", 3);
        state.iteration = 2;
        state.status = Status::Finished;
        state.current_code = "print('hi')".to_string();
        let mut failed = AttemptRecord::new("prnt('hi')", "", "NameError: prnt");
        failed.reflection = Some("typo".to_string());
        state.history = vec![failed, AttemptRecord::new("print('hi')", "hi", "")];

        let dir = write_run(temp.path(), "run-1", &state, SandboxMode::Local).expect("write");

        assert_eq!(
            fs::read_to_string(dir.join("attempt-1.py")).expect("attempt 1"),
            "prnt('hi')"
        );
        assert!(dir.join("attempt-2.py").exists());

        let outcome: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.join("outcome.json")).expect("read"))
                .expect("json");
        assert_eq!(outcome["status"], "finished");
        assert_eq!(outcome["sandbox"], "local");
        assert_eq!(outcome["attempts"][0]["error"], "NameError: prnt");
        assert_eq!(outcome["attempts"][0]["reflection"], "typo");
        assert!(outcome["attempts"][1]["error"].is_null());
    }
}
