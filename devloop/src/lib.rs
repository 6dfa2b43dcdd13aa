//! Agent-driven development loop.
//!
//! A run clarifies requirements with the agent, has it write a task plan, then
//! drives every task through implement, commit, review, commit, and optional
//! test-writing steps. The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (phase table, retry/backoff,
//!   failure escalation, context budget). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting collaborators (agent CLI, git, plan files,
//!   gates, config) behind traits so tests can script them.
//!
//! [`engine`] composes both into a pausable, resumable state machine per
//! workspace; [`workspace`] manages many of them side by side.

pub mod core;
pub mod engine;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workspace;
