//! Fixed phase transition table.
//!
//! interview → plan generation → plan rewrite → per task
//! [execute → commit → review → commit → (tests → commit)] → clear → next task or complete.

use crate::core::types::Phase;

/// Facts about the context that select between table branches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionInputs {
    pub interview_complete: bool,
    pub write_tests: bool,
    pub ui_task: bool,
    /// Another open task remains after the current one.
    pub has_next_task: bool,
}

/// Phase following a successful step of `current`.
///
/// Resting phases (idle, waiting, paused, terminal) map to themselves.
pub fn next_phase(current: Phase, inputs: &TransitionInputs) -> Phase {
    match current {
        Phase::ConductingInterview if inputs.interview_complete => Phase::GeneratingInitialPlan,
        Phase::ConductingInterview => Phase::ConductingInterview,
        Phase::GeneratingInitialPlan => Phase::RewritingPlan,
        Phase::RewritingPlan => Phase::ExecutingTask,
        Phase::ExecutingTask => Phase::CommittingImplementation,
        Phase::CommittingImplementation => Phase::ReviewingCode,
        Phase::ReviewingCode => Phase::CommittingReview,
        Phase::CommittingReview if inputs.write_tests && !inputs.ui_task => Phase::WritingTests,
        Phase::CommittingReview => Phase::ClearingContext,
        Phase::WritingTests => Phase::CommittingTests,
        Phase::CommittingTests => Phase::ClearingContext,
        Phase::ClearingContext if inputs.has_next_task => Phase::ExecutingTask,
        Phase::ClearingContext => Phase::Completed,
        Phase::Idle
        | Phase::WaitingForUser
        | Phase::Paused
        | Phase::Completed
        | Phase::Failed => current,
    }
}
