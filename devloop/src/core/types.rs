//! Shared deterministic types for the execution engine.
//!
//! These types define stable contracts between core components, the engine,
//! and its drivers. They hold no I/O handles and serialize to stable
//! snake_case names.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A named stage of the execution loop. Exactly one is active per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    ConductingInterview,
    GeneratingInitialPlan,
    RewritingPlan,
    ExecutingTask,
    CommittingImplementation,
    ReviewingCode,
    CommittingReview,
    WritingTests,
    CommittingTests,
    ClearingContext,
    WaitingForUser,
    Paused,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// True for phases that issue work (the loop is making progress).
    pub fn is_in_progress(self) -> bool {
        !matches!(
            self,
            Phase::Idle | Phase::WaitingForUser | Phase::Paused | Phase::Completed | Phase::Failed
        )
    }

    /// Phases whose work belongs to the current task. Failures here are
    /// routed through the task failure policy instead of failing the run.
    pub fn is_task_scoped(self) -> bool {
        matches!(
            self,
            Phase::ExecutingTask | Phase::ReviewingCode | Phase::WritingTests
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::ConductingInterview => "Interview",
            Phase::GeneratingInitialPlan => "Plan generation",
            Phase::RewritingPlan => "Plan rewrite",
            Phase::ExecutingTask => "Task execution",
            Phase::CommittingImplementation => "Implementation commit",
            Phase::ReviewingCode => "Code review",
            Phase::CommittingReview => "Review commit",
            Phase::WritingTests => "Test writing",
            Phase::CommittingTests => "Test commit",
            Phase::ClearingContext => "Context clearing",
            Phase::WaitingForUser => "Waiting for user",
            Phase::Paused => "Paused",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Completed and skipped tasks are never selected again.
    pub fn is_settled(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Skipped)
    }
}

/// Capability granted to the agent for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Read-only analysis (`plan` on the agent CLI).
    ReadOnly,
    /// File edits are applied without prompting.
    AcceptEdits,
    Default,
}

impl PermissionMode {
    pub fn as_cli_arg(self) -> &'static str {
        match self {
            PermissionMode::ReadOnly => "plan",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Default => "default",
        }
    }
}

/// Why the engine is calling the agent. Determines permission mode and
/// timeout, and is reported to agent clients for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPurpose {
    Interview,
    PlanGeneration,
    PlanRewrite,
    Implementation,
    ReviewAnalysis,
    ReviewFix,
    TestWriting,
    HandoffCommit,
    HandoffSummary,
}

impl CallPurpose {
    pub fn label(self) -> &'static str {
        match self {
            CallPurpose::Interview => "Interview",
            CallPurpose::PlanGeneration => "Plan generation",
            CallPurpose::PlanRewrite => "Plan rewrite",
            CallPurpose::Implementation => "Implementation",
            CallPurpose::ReviewAnalysis => "Review analysis",
            CallPurpose::ReviewFix => "Review fix",
            CallPurpose::TestWriting => "Test writing",
            CallPurpose::HandoffCommit => "Checkpoint commit",
            CallPurpose::HandoffSummary => "Continuation summary",
        }
    }

    pub fn permission_mode(self) -> PermissionMode {
        match self {
            CallPurpose::Interview
            | CallPurpose::PlanGeneration
            | CallPurpose::PlanRewrite
            | CallPurpose::ReviewAnalysis
            | CallPurpose::HandoffSummary => PermissionMode::ReadOnly,
            CallPurpose::Implementation
            | CallPurpose::ReviewFix
            | CallPurpose::TestWriting
            | CallPurpose::HandoffCommit => PermissionMode::AcceptEdits,
        }
    }
}

/// Policy applied once a task keeps failing in autonomous mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    PauseForUser,
    RetryThenSkip,
    RetryThenStop,
}

/// User decision for a pending task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureResponse {
    Retry,
    Skip,
    Stop,
}

/// Outcome of a build or test gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateOutcome {
    Pass,
    Fail,
}

/// Token usage reported by the agent for one call or message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub cache_creation_input_tokens: u64,
}

impl TokenUsage {
    /// Tokens occupying the conversation window for this exchange.
    pub fn context_tokens(&self) -> u64 {
        self.input_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens
            + self.output_tokens
    }
}
