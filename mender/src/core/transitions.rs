//! Loop status transition rules.
//!
//! Valid cycle: `planning -> coding -> executing -> (reflecting -> coding)* ->
//! finished | failed`, with an optional `planning -> researching -> planning`
//! prefix and the `finished -> finished` edge taken by save-memory.

use crate::core::types::Status;

/// Returns `true` when `from -> to` is an allowed edge.
pub fn is_valid_transition(from: Status, to: Status) -> bool {
    use Status::{Coding, Executing, Failed, Finished, Planning, Reflecting, Researching};

    matches!(
        (from, to),
        (Planning, Researching)
            | (Researching, Planning)
            | (Planning, Coding)
            | (Coding, Executing)
            | (Executing, Reflecting)
            | (Executing, Finished)
            | (Reflecting, Coding)
            | (Reflecting, Failed)
            | (Finished, Finished)
    )
}

/// Validate a transition, returning a stable error message on failure.
pub fn validate_transition(from: Status, to: Status) -> Result<(), String> {
    if is_valid_transition(from, to) {
        Ok(())
    } else {
        Err(format!("invalid status transition {from} -> {to}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Status; 7] = [
        Status::Planning,
        Status::Researching,
        Status::Coding,
        Status::Executing,
        Status::Reflecting,
        Status::Finished,
        Status::Failed,
    ];

    #[test]
    fn main_cycle_is_valid() {
        let path = [
            Status::Planning,
            Status::Coding,
            Status::Executing,
            Status::Reflecting,
            Status::Coding,
            Status::Executing,
            Status::Finished,
            Status::Finished,
        ];
        for pair in path.windows(2) {
            assert!(
                is_valid_transition(pair[0], pair[1]),
                "{} -> {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn failed_is_terminal() {
        for to in ALL {
            assert!(!is_valid_transition(Status::Failed, to), "failed -> {to}");
        }
    }

    #[test]
    fn cannot_skip_execution() {
        let err = validate_transition(Status::Coding, Status::Finished).expect_err("invalid");
        assert_eq!(err, "invalid status transition coding -> finished");
        assert!(!is_valid_transition(Status::Executing, Status::Failed));
        assert!(!is_valid_transition(Status::Planning, Status::Executing));
    }

    #[test]
    fn self_loops_are_rejected_except_save_memory() {
        for status in ALL {
            assert_eq!(
                is_valid_transition(status, status),
                status == Status::Finished,
                "{status} -> {status}"
            );
        }
    }
}
