//! Shared deterministic types for the repair loop.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Loop status tag. Terminal statuses are `Finished` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Planning,
    Researching,
    Coding,
    Executing,
    Reflecting,
    Finished,
    Failed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Planning => "planning",
            Status::Researching => "researching",
            Status::Coding => "coding",
            Status::Executing => "executing",
            Status::Reflecting => "reflecting",
            Status::Finished => "finished",
            Status::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Finished | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution cycle: the program that ran and what it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub code: String,
    pub output: String,
    /// `None` (or empty) on success.
    pub error: Option<String>,
    /// Diagnosis attached after a failure.
    pub reflection: Option<String>,
}

impl AttemptRecord {
    pub fn new(code: impl Into<String>, output: impl Into<String>, error: &str) -> Self {
        Self {
            code: code.into(),
            output: output.into(),
            error: (!error.is_empty()).then(|| error.to_string()),
            reflection: None,
        }
    }

    /// Error text if this attempt failed.
    pub fn failure(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }

    pub fn failed(&self) -> bool {
        self.failure().is_some()
    }
}

/// Outcome of the static policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyVerdict {
    pub is_safe: bool,
    pub reason: String,
}

impl SafetyVerdict {
    pub fn safe() -> Self {
        Self {
            is_safe: true,
            reason: "Safe".to_string(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            is_safe: false,
            reason: reason.into(),
        }
    }
}

/// Captured result of running a program.
///
/// A non-empty `error` means failure regardless of `output`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxResult {
    pub output: String,
    pub error: String,
}

impl SandboxResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: String::new(),
        }
    }

    pub fn failure(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}

/// A past failure paired with the code that eventually fixed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub task: String,
    pub error: String,
    pub failed_code: String,
    pub fix: String,
    /// Searchable text (task + error).
    pub document: String,
}

impl FailureRecord {
    pub fn new(error: &str, failed_code: &str, fix: &str, task: &str) -> Self {
        Self {
            task: task.to_string(),
            error: error.to_string(),
            failed_code: failed_code.to_string(),
            fix: fix.to_string(),
            document: failure_document(task, error),
        }
    }
}

/// A solved task and its final program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessRecord {
    pub task: String,
    pub code: String,
    pub document: String,
}

impl SuccessRecord {
    pub fn new(task: &str, code: &str) -> Self {
        Self {
            task: task.to_string(),
            code: code.to_string(),
            document: task.to_string(),
        }
    }
}

/// Text indexed for failure similarity search.
pub fn failure_document(task: &str, error: &str) -> String {
    format!("Task: {task}\nError: {error}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_error_is_success() {
        let attempt = AttemptRecord::new("print(1)", "1", "");
        assert_eq!(attempt.error, None);
        assert!(!attempt.failed());

        let attempt = AttemptRecord::new("boom()", "", "NameError");
        assert_eq!(attempt.failure(), Some("NameError"));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&Status::Reflecting).expect("serialize");
        assert_eq!(json, "\"reflecting\"");
        assert!(Status::Failed.is_terminal());
        assert!(!Status::Coding.is_terminal());
    }

    #[test]
    fn failure_document_combines_task_and_error() {
        let record = FailureRecord::new("KeyError: 'x'", "d['x']", "d.get('x')", "read a key");
        assert_eq!(record.document, "Task: read a key\nError: KeyError: 'x'");
        assert_eq!(SuccessRecord::new("sum", "print(3)").document, "sum");
    }
}
