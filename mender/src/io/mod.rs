//! Side-effecting operations used by the repair loop and the CLI.

pub mod completion;
pub mod config;
pub mod memory_store;
pub mod process;
pub mod prompt;
pub mod research;
pub mod run_log;
pub mod sandbox;
