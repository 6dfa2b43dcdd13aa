//! Deterministic, pure logic shared by the execution engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod classifier;
pub mod failure;
pub mod interview;
pub mod log;
pub mod plan;
pub mod retry;
pub mod transitions;
pub mod types;
