//! Deterministic, pure logic shared by the repair loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod embedding;
pub mod extract;
pub mod safety;
pub mod state;
pub mod transitions;
pub mod types;
