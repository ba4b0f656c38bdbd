//! Self-repairing coding agent.
//!
//! Given a natural-language task, the agent plans, writes a Python program,
//! gates it through a static safety check, runs it in a sandbox, reflects on
//! failures, and retries until the program works or the iteration budget is
//! spent. Failures and their fixes are remembered across runs.
//!
//! - **[`core`]**: Pure, deterministic logic (state, transitions, safety gate,
//!   embeddings, reply parsing). No I/O.
//! - **[`io`]**: Side effects (sandbox, memory files, completion providers,
//!   search, config, run artifacts). Behind traits so tests can script them.
//! - **[`agents`]**: Prompted completion calls (planner, coder, reflector, research).
//!
//! [`step`] holds the individual loop steps; [`repair`] drives them.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod repair;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
