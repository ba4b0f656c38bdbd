//! Stable exit codes for mender CLI commands.

/// Command succeeded, the task was solved, or `check` found the program safe.
pub const OK: i32 = 0;
/// Invalid config or arguments, or an infrastructure error (completion, memory, filesystem).
pub const INVALID: i32 = 1;
/// `mender run` used every iteration without producing a working program.
pub const FAILED: i32 = 2;
/// `mender check` rejected the program.
pub const UNSAFE: i32 = 3;
