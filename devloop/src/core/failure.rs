//! Escalation policy for tasks whose retries are exhausted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::types::FailurePolicy;

/// Autonomous-mode settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomousConfiguration {
    pub enabled: bool,
    pub failure_policy: FailurePolicy,
    /// Automatic task retries before the policy applies.
    pub max_task_retries: u32,
    pub run_build_after_commit: bool,
    pub build_command: Vec<String>,
    pub run_tests_after_commit: bool,
    pub test_command: Vec<String>,
    pub gate_timeout_secs: u64,
}

impl Default for AutonomousConfiguration {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_policy: FailurePolicy::PauseForUser,
            max_task_retries: 2,
            run_build_after_commit: false,
            build_command: vec!["cargo".to_string(), "build".to_string()],
            run_tests_after_commit: false,
            test_command: vec!["cargo".to_string(), "test".to_string()],
            gate_timeout_secs: 15 * 60,
        }
    }
}

/// What the engine must do with a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Record a pending failure and wait for the user's retry/skip/stop.
    AskUser,
    /// Retry the task immediately. `failures` is the running count.
    Retry { failures: u32, max_retries: u32 },
    /// Mark the task skipped and move on.
    Skip { failures: u32 },
    /// Mark the task failed and fail the run.
    Stop { failures: u32 },
}

/// Per-run failure bookkeeping keyed by task number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailureHandler {
    failures: HashMap<u32, u32>,
}

impl TaskFailureHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures_for(&self, task_number: u32) -> u32 {
        self.failures.get(&task_number).copied().unwrap_or(0)
    }

    pub fn on_failure(
        &mut self,
        task_number: u32,
        config: &AutonomousConfiguration,
    ) -> FailureDecision {
        if !config.enabled || config.failure_policy == FailurePolicy::PauseForUser {
            return FailureDecision::AskUser;
        }
        let count = self.failures.entry(task_number).or_insert(0);
        *count += 1;
        let failures = *count;
        if failures <= config.max_task_retries {
            return FailureDecision::Retry {
                failures,
                max_retries: config.max_task_retries,
            };
        }
        match config.failure_policy {
            FailurePolicy::RetryThenSkip => FailureDecision::Skip { failures },
            FailurePolicy::RetryThenStop | FailurePolicy::PauseForUser => {
                FailureDecision::Stop { failures }
            }
        }
    }

    /// The counter restarts whenever the task later succeeds.
    pub fn on_success(&mut self, task_number: u32) {
        self.failures.remove(&task_number);
    }

    pub fn reset(&mut self) {
        self.failures.clear();
    }
}
