//! Notifications emitted by an engine as its context changes.
//!
//! Consumers subscribe through [`crate::engine::ExecutionEngine::subscribe`].
//! Slow subscribers lag and miss events; the context snapshot stays the
//! source of truth.

use serde::Serialize;

use crate::core::log::LogEntry;
use crate::core::types::{Phase, TaskStatus};
use crate::engine::context::{PendingQuestion, PendingTaskFailure};

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    PhaseChanged {
        from: Phase,
        to: Phase,
    },
    LogAppended {
        entry: LogEntry,
    },
    ErrorRecorded {
        entry: LogEntry,
    },
    QuestionPending {
        question: PendingQuestion,
    },
    TaskFailurePending {
        failure: PendingTaskFailure,
    },
    TaskStatusChanged {
        number: u32,
        status: TaskStatus,
    },
    UsageUpdated {
        total_cost_usd: f64,
        input_tokens: u64,
        output_tokens: u64,
        remaining_budget_percent: f64,
    },
    /// The phase loop yielded (resting, waiting, paused, or terminal).
    Settled {
        phase: Phase,
    },
}
