//! State container for one workflow instance.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::core::interview::{Exchange, InterviewSession};
use crate::core::log::{BoundedLog, LogEntry};
use crate::core::plan::{Plan, Task};
use crate::core::types::Phase;
use crate::io::agent::QuestionSpec;
use crate::io::config::DevloopConfig;
use crate::io::isolation::WorkspaceInfo;

/// A question raised by the agent through the ask-user tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingQuestion {
    pub id: Uuid,
    pub question: String,
    pub header: String,
    /// Empty means a freeform answer is expected.
    pub options: Vec<String>,
    pub multi_select: bool,
}

impl From<QuestionSpec> for PendingQuestion {
    fn from(spec: QuestionSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            question: spec.question,
            header: spec.header,
            options: spec.options,
            multi_select: spec.multi_select,
        }
    }
}

/// A task failure awaiting the user's retry/skip/stop decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingTaskFailure {
    pub id: Uuid,
    pub task_number: u32,
    pub task_title: String,
    pub error: String,
}

/// Progress snapshot produced during a context handoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContinuationSummary {
    pub task_number: u32,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

/// Mutable state of one workflow instance.
///
/// Mutated only by the engine's loop and its control entry points, always
/// under the engine's per-context lock. Drivers read clones.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionContext {
    pub phase: Phase,
    /// Phase to restore on resume; set only while paused.
    pub paused_from: Option<Phase>,
    pub target_path: Option<PathBuf>,
    pub feature_description: String,
    pub plan: Option<Plan>,
    pub current_task_index: Option<usize>,

    pub interview: Option<InterviewSession>,
    pub current_interview_question: Option<String>,
    /// Front is the current question; the rest queue behind it.
    pub pending_questions: VecDeque<PendingQuestion>,
    /// Phase that raised the pending questions.
    pub question_origin: Option<Phase>,
    pub collected_answers: Vec<Exchange>,
    /// Answers to hand to the next call of the origin phase.
    pub pending_input: Option<String>,

    pub pending_task_failure: Option<PendingTaskFailure>,
    /// Error of the last failed attempt at the current task.
    pub last_task_error: Option<String>,

    pub session_id: Option<String>,
    pub logs: BoundedLog<LogEntry>,
    pub errors: BoundedLog<LogEntry>,
    pub total_cost_usd: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub remaining_budget_percent: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub continuation: Option<ContinuationSummary>,
    /// Phase a context handoff interrupted; set while `clearing_context` hands off.
    pub handoff_resume_phase: Option<Phase>,

    #[serde(skip)]
    pub config: Arc<DevloopConfig>,
    pub workspace_info: Option<WorkspaceInfo>,
}

impl ExecutionContext {
    pub fn new(config: Arc<DevloopConfig>) -> Self {
        let capacity = config.logs.capacity;
        Self {
            phase: Phase::Idle,
            paused_from: None,
            target_path: None,
            feature_description: String::new(),
            plan: None,
            current_task_index: None,
            interview: None,
            current_interview_question: None,
            pending_questions: VecDeque::new(),
            question_origin: None,
            collected_answers: Vec::new(),
            pending_input: None,
            pending_task_failure: None,
            last_task_error: None,
            session_id: None,
            logs: BoundedLog::with_capacity(capacity),
            errors: BoundedLog::with_capacity(capacity),
            total_cost_usd: 0.0,
            input_tokens: 0,
            output_tokens: 0,
            remaining_budget_percent: 100.0,
            started_at: None,
            finished_at: None,
            continuation: None,
            handoff_resume_phase: None,
            config,
            workspace_info: None,
        }
    }

    pub fn pending_question(&self) -> Option<&PendingQuestion> {
        self.pending_questions.front()
    }

    pub fn current_task(&self) -> Option<&Task> {
        let idx = self.current_task_index?;
        self.plan.as_ref()?.tasks.get(idx)
    }

    pub fn current_task_mut(&mut self) -> Option<&mut Task> {
        let idx = self.current_task_index?;
        self.plan.as_mut()?.tasks.get_mut(idx)
    }

    /// Plan file inside the target directory.
    pub fn plan_path(&self) -> Option<PathBuf> {
        self.target_path
            .as_ref()
            .map(|target| target.join(&self.config.plan_file))
    }

    /// Clear everything tied to a run, keeping logs, target, and workspace info.
    pub(crate) fn reset_run(&mut self, config: Arc<DevloopConfig>) {
        self.logs.set_capacity(config.logs.capacity);
        self.errors.set_capacity(config.logs.capacity);
        self.config = config;
        self.paused_from = None;
        self.current_task_index = None;
        self.interview = None;
        self.current_interview_question = None;
        self.pending_questions.clear();
        self.question_origin = None;
        self.collected_answers.clear();
        self.pending_input = None;
        self.pending_task_failure = None;
        self.last_task_error = None;
        self.session_id = None;
        self.total_cost_usd = 0.0;
        self.input_tokens = 0;
        self.output_tokens = 0;
        self.remaining_budget_percent = 100.0;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.continuation = None;
        self.handoff_resume_phase = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_context_is_idle_and_bounded() {
        let mut config = DevloopConfig::default();
        config.logs.capacity = 3;
        let ctx = ExecutionContext::new(Arc::new(config));
        assert_eq!(ctx.phase, Phase::Idle);
        assert_eq!(ctx.logs.capacity(), 3);
        assert!(ctx.current_task().is_none());
        assert!(ctx.plan_path().is_none());
    }

    #[test]
    fn plan_path_uses_configured_file_name() {
        let mut config = DevloopConfig::default();
        config.plan_file = "TASKS.md".into();
        let mut ctx = ExecutionContext::new(Arc::new(config));
        ctx.target_path = Some(PathBuf::from("/work/app"));
        assert_eq!(ctx.plan_path(), Some(PathBuf::from("/work/app/TASKS.md")));
    }

    #[test]
    fn current_task_follows_index() {
        let mut ctx = ExecutionContext::new(Arc::new(DevloopConfig::default()));
        ctx.plan = Some(Plan::new(
            "",
            vec![Task::new(1, "One", ""), Task::new(2, "Two", "")],
        ));
        ctx.current_task_index = Some(1);
        assert_eq!(ctx.current_task().map(|t| t.number), Some(2));
    }
}
