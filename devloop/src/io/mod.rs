//! Side-effecting adapters: agent CLI, git, plan files, gates, config.
//!
//! Each collaborator the engine depends on sits behind a trait here so tests
//! can swap in scripted doubles.

pub mod agent;
pub mod config;
pub mod gates;
pub mod git;
pub mod isolation;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod stream;
