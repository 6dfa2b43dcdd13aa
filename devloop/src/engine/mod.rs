//! Orchestrating state machine for one workspace.
//!
//! An [`ExecutionEngine`] owns one [`ExecutionContext`] behind a mutex. The
//! phase loop runs as a single tokio task per engine; control entry points
//! validate and mutate under the same mutex and (re)schedule the loop. The
//! mutex is never held across an await, so a pause/stop/answer can never
//! interleave with half a transition.

pub mod context;
mod handoff;
mod messages;
mod phases;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use context::{ContinuationSummary, ExecutionContext, PendingQuestion, PendingTaskFailure};

use crate::core::budget::ContextBudgetMonitor;
use crate::core::failure::TaskFailureHandler;
use crate::core::interview::{Exchange, InterviewSession};
use crate::core::log::{LogEntry, LogLevel};
use crate::core::plan::Plan;
use crate::core::types::{FailureResponse, Phase, TaskStatus};
use crate::events::{EVENT_CHANNEL_CAPACITY, EngineEvent};
use crate::io::agent::{AgentClient, ClaudeCliClient};
use crate::io::config::DevloopConfig;
use crate::io::gates::{CommandGateRunner, GateRunner};
use crate::io::git::{GitVersionControl, VersionControl};
use crate::io::isolation::WorkspaceInfo;
use crate::io::plan_store::{MarkdownPlanParser, PlanParser, load_plan, save_plan};
use crate::io::prompt::PromptBuilder;

/// Error text recorded when the user stops a run.
pub const STOPPED_BY_USER: &str = "Execution stopped by user";

/// Validation failures of the control entry points. None of them mutate state.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no target path set")]
    MissingTargetPath,
    #[error("feature description is empty")]
    EmptyFeatureDescription,
    #[error("execution is not paused")]
    NotPaused,
    #[error("no active agent session")]
    NoSessionId,
    #[error("no existing plan loaded")]
    NoExistingPlan,
    #[error("no task failure is awaiting a decision")]
    NoPendingTaskFailure,
    #[error("a run is already in progress ({0})")]
    AlreadyRunning(Phase),
    #[error("failed to load plan: {0:#}")]
    PlanLoad(anyhow::Error),
}

/// External services an engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub agent: Arc<dyn AgentClient>,
    pub version_control: Arc<dyn VersionControl>,
    pub plan_parser: Arc<dyn PlanParser>,
    pub gates: Arc<dyn GateRunner>,
}

impl Collaborators {
    /// Claude CLI, git, markdown plans, and command gates.
    pub fn production(config: &DevloopConfig) -> Self {
        Self {
            agent: Arc::new(ClaudeCliClient::new(config.agent.clone())),
            version_control: Arc::new(GitVersionControl),
            plan_parser: Arc::new(MarkdownPlanParser),
            gates: Arc::new(CommandGateRunner),
        }
    }
}

/// Why the engine interrupted its own in-flight call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InterruptReason {
    Question,
    Handoff,
}

pub(crate) struct EngineState {
    pub(crate) ctx: ExecutionContext,
    /// Bumped by every start; outcomes of older runs are discarded.
    run_id: u64,
    loop_active: bool,
    failures: TaskFailureHandler,
    budget: ContextBudgetMonitor,
    interrupt: Option<InterruptReason>,
    cancel: CancellationToken,
}

pub(crate) struct Inner {
    state: Mutex<EngineState>,
    preferences: Arc<DevloopConfig>,
    collaborators: Collaborators,
    prompts: PromptBuilder,
    events: broadcast::Sender<EngineEvent>,
    active: watch::Sender<bool>,
}

/// Cloneable handle to one engine.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<Inner>,
}

impl ExecutionEngine {
    pub fn new(preferences: Arc<DevloopConfig>, collaborators: Collaborators) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (active, _) = watch::channel(false);
        let state = EngineState {
            ctx: ExecutionContext::new(Arc::clone(&preferences)),
            run_id: 0,
            loop_active: false,
            failures: TaskFailureHandler::new(),
            budget: ContextBudgetMonitor::new(preferences.budget.clone()),
            interrupt: None,
            cancel: CancellationToken::new(),
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                preferences,
                collaborators,
                prompts: PromptBuilder::default(),
                events,
                active,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Clone of the current context.
    pub fn snapshot(&self) -> ExecutionContext {
        self.inner.state.lock().ctx.clone()
    }

    /// Read the context without cloning it.
    pub fn with_context<R>(&self, f: impl FnOnce(&ExecutionContext) -> R) -> R {
        f(&self.inner.state.lock().ctx)
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().ctx.phase
    }

    pub fn is_loop_active(&self) -> bool {
        self.inner.state.lock().loop_active
    }

    /// Wait until the phase loop has yielded, then report the phase.
    pub async fn settled(&self) -> Phase {
        let mut rx = self.inner.active.subscribe();
        // The sender lives as long as `inner`, so this only errors on drop.
        let _ = rx.wait_for(|active| !*active).await;
        self.phase()
    }

    /// Rejected with `AlreadyRunning` while a run is in progress.
    pub fn set_target_path(&self, path: Option<PathBuf>) -> Result<(), EngineError> {
        let mut st = self.inner.state.lock();
        ensure_not_running(st.ctx.phase)?;
        st.ctx.target_path = path;
        Ok(())
    }

    /// Rejected with `AlreadyRunning` while a run is in progress.
    pub fn set_feature_description(&self, text: impl Into<String>) -> Result<(), EngineError> {
        let mut st = self.inner.state.lock();
        ensure_not_running(st.ctx.phase)?;
        st.ctx.feature_description = text.into();
        Ok(())
    }

    /// Point a freshly created engine at its workspace directory.
    pub(crate) fn bind_workspace(&self, target: Option<PathBuf>, info: Option<WorkspaceInfo>) {
        let mut st = self.inner.state.lock();
        st.ctx.target_path = target;
        st.ctx.workspace_info = info;
    }

    /// Install an already-parsed plan (e.g. for `start_with_existing_plan`).
    pub fn set_plan(&self, plan: Plan) -> Result<(), EngineError> {
        let mut st = self.inner.state.lock();
        ensure_not_running(st.ctx.phase)?;
        st.ctx.plan = Some(plan);
        st.ctx.current_task_index = None;
        Ok(())
    }

    /// Load the plan file from the target directory (or `path` when given).
    ///
    /// Returns the number of tasks found. Nothing is read while a run is in
    /// progress.
    pub fn load_existing_plan(&self, path: Option<PathBuf>) -> Result<usize, EngineError> {
        let path = {
            let st = self.inner.state.lock();
            ensure_not_running(st.ctx.phase)?;
            match path {
                Some(path) => path,
                None => st.ctx.plan_path().ok_or(EngineError::MissingTargetPath)?,
            }
        };
        let plan = load_plan(&path, self.inner.collaborators.plan_parser.as_ref())
            .map_err(EngineError::PlanLoad)?;
        if plan.is_empty() {
            return Err(EngineError::PlanLoad(anyhow!(
                "no tasks found in {}",
                path.display()
            )));
        }
        let count = plan.tasks.len();
        // A run may have started while the file was read.
        self.set_plan(plan)?;
        Ok(count)
    }

    /// Begin a fresh run: interview, plan, then every task.
    pub fn start(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        ensure_not_running(st.ctx.phase)?;
        if st.ctx.target_path.is_none() {
            return Err(EngineError::MissingTargetPath);
        }
        let feature = st.ctx.feature_description.trim().to_string();
        if feature.is_empty() {
            return Err(EngineError::EmptyFeatureDescription);
        }

        inner.begin_run(&mut st);
        st.ctx.plan = None;
        st.ctx.interview = Some(InterviewSession::new(feature.clone()));
        inner.log(&mut st, LogLevel::Info, format!("Starting run: {feature}"));
        inner.set_phase(&mut st, Phase::ConductingInterview);
        inner.spawn_loop(&mut st);
        Ok(())
    }

    /// Run the tasks of a previously loaded plan, skipping interview and planning.
    pub fn start_with_existing_plan(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        ensure_not_running(st.ctx.phase)?;
        if st.ctx.target_path.is_none() {
            return Err(EngineError::MissingTargetPath);
        }
        let first = match st.ctx.plan.as_ref() {
            Some(plan) if !plan.is_empty() => plan.first_incomplete_index(),
            _ => return Err(EngineError::NoExistingPlan),
        };

        inner.begin_run(&mut st);
        inner.log(&mut st, LogLevel::Info, "Resuming existing plan");
        match first {
            None => {
                inner.log(&mut st, LogLevel::Info, "All tasks are already completed");
                inner.set_phase(&mut st, Phase::Completed);
            }
            Some(idx) => {
                inner.select_task(&mut st, idx);
                inner.set_phase(&mut st, Phase::ExecutingTask);
                inner.spawn_loop(&mut st);
            }
        }
        Ok(())
    }

    /// Pause between phase steps. Returns false when there is nothing to pause.
    ///
    /// An in-flight agent call is not cancelled; the pause takes effect once it returns.
    pub fn pause(&self) -> bool {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        let phase = st.ctx.phase;
        if !phase.is_in_progress() {
            debug!(%phase, "pause ignored");
            return false;
        }
        st.ctx.paused_from = Some(phase);
        inner.log(&mut st, LogLevel::Info, format!("Paused during {phase}"));
        inner.set_phase(&mut st, Phase::Paused);
        true
    }

    pub fn resume(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        if st.ctx.phase != Phase::Paused {
            return Err(EngineError::NotPaused);
        }
        let restored = st.ctx.paused_from.take().unwrap_or(Phase::Idle);
        inner.log(&mut st, LogLevel::Info, format!("Resumed {restored}"));
        inner.set_phase(&mut st, restored);
        inner.spawn_loop(&mut st);
        Ok(())
    }

    /// Forcefully stop the run. Returns false when there was nothing to stop.
    pub fn stop(&self) -> bool {
        let inner = &self.inner;
        let stopped = {
            let mut st = inner.state.lock();
            let phase = st.ctx.phase;
            if phase == Phase::Idle || phase.is_terminal() {
                false
            } else {
                st.cancel.cancel();
                st.interrupt = None;
                st.ctx.paused_from = None;
                st.ctx.pending_questions.clear();
                st.ctx.question_origin = None;
                st.ctx.pending_task_failure = None;
                inner.record_error(&mut st, STOPPED_BY_USER);
                inner.set_phase(&mut st, Phase::Failed);
                true
            }
        };
        if stopped {
            inner.collaborators.agent.interrupt();
        }
        stopped
    }

    /// Stop and refuse any further agent calls (workspace teardown).
    pub fn terminate(&self) {
        self.stop();
        self.inner.collaborators.agent.terminate();
    }

    /// Answer the current pending question.
    pub fn answer_question(&self, answer: impl Into<String>) -> Result<(), EngineError> {
        let answer = answer.into();
        let inner = &self.inner;
        let mut st = inner.state.lock();
        if st.ctx.session_id.is_none() {
            return Err(EngineError::NoSessionId);
        }
        let Some(question) = st.ctx.pending_questions.pop_front() else {
            warn!("answer received with no pending question; ignoring");
            return Ok(());
        };

        let interview_open = st
            .ctx
            .interview
            .as_ref()
            .is_some_and(|interview| !interview.is_complete());
        if interview_open && st.ctx.current_interview_question.is_some() {
            if let Some(interview) = st.ctx.interview.as_mut() {
                interview.record(question.question.clone(), answer.clone());
            }
        }
        st.ctx.collected_answers.push(Exchange {
            question: question.question.clone(),
            answer: answer.clone(),
        });
        inner.log(&mut st, LogLevel::Info, format!("Answer: {answer}"));

        if let Some(next) = st.ctx.pending_questions.front().cloned() {
            if st.ctx.current_interview_question.is_some() {
                st.ctx.current_interview_question = Some(next.question.clone());
            }
            inner.emit(EngineEvent::QuestionPending { question: next });
            return Ok(());
        }

        let answers = std::mem::take(&mut st.ctx.collected_answers)
            .iter()
            .map(|ex| format!("Q: {}\nA: {}", ex.question, ex.answer))
            .collect::<Vec<_>>()
            .join("\n\n");
        st.ctx.pending_input = Some(answers);
        st.ctx.current_interview_question = None;
        let origin = st.ctx.question_origin.take().unwrap_or(Phase::ExecutingTask);
        if st.ctx.phase == Phase::WaitingForUser {
            inner.set_phase(&mut st, origin);
            inner.spawn_loop(&mut st);
        } else if st.ctx.phase == Phase::Paused {
            st.ctx.paused_from = Some(origin);
        }
        Ok(())
    }

    /// Apply the user's decision for the pending task failure.
    ///
    /// A retry re-runs the task in a fresh agent session. While paused, the
    /// decision only sets the phase to resume into.
    pub fn handle_task_failure_response(&self, response: FailureResponse) -> Result<(), EngineError> {
        let inner = &self.inner;
        let save = {
            let mut st = inner.state.lock();
            let Some(failure) = st.ctx.pending_task_failure.take() else {
                return Err(EngineError::NoPendingTaskFailure);
            };
            match response {
                FailureResponse::Retry => {
                    inner.log(
                        &mut st,
                        LogLevel::Info,
                        format!("Retrying Task {} at user request", failure.task_number),
                    );
                    inner.set_task_status(&mut st, TaskStatus::InProgress);
                    inner.clear_session(&mut st);
                    inner.advance(&mut st, Phase::ExecutingTask);
                }
                FailureResponse::Skip => {
                    inner.log(
                        &mut st,
                        LogLevel::Warning,
                        format!("Skipping Task {} at user request", failure.task_number),
                    );
                    inner.set_task_status(&mut st, TaskStatus::Skipped);
                    let next = inner.next_task_phase(&mut st);
                    inner.advance(&mut st, next);
                }
                FailureResponse::Stop => {
                    inner.set_task_status(&mut st, TaskStatus::Failed);
                    inner.record_error(
                        &mut st,
                        format!(
                            "Stopped after Task {} failed: {}",
                            failure.task_number, failure.error
                        ),
                    );
                    inner.set_phase(&mut st, Phase::Failed);
                }
            }
            inner.spawn_loop(&mut st);
            inner.plan_snapshot(&st)
        };
        inner.persist_plan(save);
        Ok(())
    }
}

/// Run setup may only change between runs.
fn ensure_not_running(phase: Phase) -> Result<(), EngineError> {
    if matches!(phase, Phase::Idle | Phase::Completed | Phase::Failed) {
        Ok(())
    } else {
        Err(EngineError::AlreadyRunning(phase))
    }
}

impl Inner {
    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn log(&self, st: &mut EngineState, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(level, message);
        match level {
            LogLevel::Info => info!(message = %entry.message, "engine log"),
            LogLevel::Agent | LogLevel::Tool => debug!(message = %entry.message, "agent log"),
            LogLevel::Warning => warn!(message = %entry.message, "engine log"),
            LogLevel::Error => error!(message = %entry.message, "engine log"),
        }
        st.ctx.logs.push(entry.clone());
        self.emit(EngineEvent::LogAppended { entry });
    }

    /// Append to the error log (mirrored into the main log).
    pub(crate) fn record_error(&self, st: &mut EngineState, message: impl Into<String>) {
        let entry = LogEntry::new(LogLevel::Error, message);
        st.ctx.errors.push(entry.clone());
        self.emit(EngineEvent::ErrorRecorded {
            entry: entry.clone(),
        });
        self.log(st, LogLevel::Error, entry.message);
    }

    /// Log only if `run_id` is still the active run.
    pub(crate) fn log_for_run(&self, run_id: u64, level: LogLevel, message: impl Into<String>) {
        let mut st = self.state.lock();
        if st.run_id == run_id {
            self.log(&mut st, level, message);
        }
    }

    pub(crate) fn set_phase(&self, st: &mut EngineState, to: Phase) {
        let from = st.ctx.phase;
        if from == to {
            return;
        }
        st.ctx.phase = to;
        if to.is_terminal() {
            st.ctx.paused_from = None;
            st.ctx.finished_at = Some(Utc::now());
        }
        debug!(%from, %to, "phase changed");
        self.emit(EngineEvent::PhaseChanged { from, to });
    }

    /// Apply a transition computed by the loop.
    ///
    /// A stopped run ignores it; a paused run records it as the phase to
    /// resume into, unless it is terminal.
    pub(crate) fn advance(&self, st: &mut EngineState, to: Phase) {
        match st.ctx.phase {
            Phase::Failed => debug!(%to, "run stopped; transition dropped"),
            Phase::Paused if !to.is_terminal() => st.ctx.paused_from = Some(to),
            _ => self.set_phase(st, to),
        }
    }

    pub(crate) fn fail_run(&self, st: &mut EngineState, message: impl Into<String>) {
        self.record_error(st, message);
        self.set_phase(st, Phase::Failed);
    }

    pub(crate) fn set_task_status(&self, st: &mut EngineState, status: TaskStatus) {
        if let Some(task) = st.ctx.current_task_mut() {
            if task.status == status {
                return;
            }
            task.status = status;
            let number = task.number;
            self.emit(EngineEvent::TaskStatusChanged { number, status });
        }
    }

    /// Make `idx` the current task with a fresh conversation.
    pub(crate) fn select_task(&self, st: &mut EngineState, idx: usize) {
        st.ctx.current_task_index = Some(idx);
        st.ctx.last_task_error = None;
        st.ctx.continuation = None;
        self.clear_session(st);
        self.set_task_status(st, TaskStatus::InProgress);
        if let Some(label) = st.ctx.current_task().map(|t| t.label()) {
            self.log(st, LogLevel::Info, format!("Starting {label}"));
        }
    }

    /// Select the next open task, returning `ExecutingTask`, or `Completed` when none remain.
    pub(crate) fn next_task_phase(&self, st: &mut EngineState) -> Phase {
        let next = match (st.ctx.plan.as_ref(), st.ctx.current_task_index) {
            (Some(plan), Some(idx)) => plan.next_open_index(idx),
            _ => None,
        };
        match next {
            Some(idx) => {
                self.select_task(st, idx);
                Phase::ExecutingTask
            }
            None => {
                st.ctx.current_task_index = None;
                self.clear_session(st);
                if let Some(plan) = st.ctx.plan.as_ref() {
                    let summary = format!(
                        "All tasks processed: {} completed, {} skipped, {} failed",
                        plan.count_with_status(TaskStatus::Completed),
                        plan.count_with_status(TaskStatus::Skipped),
                        plan.count_with_status(TaskStatus::Failed),
                    );
                    self.log(st, LogLevel::Info, summary);
                }
                Phase::Completed
            }
        }
    }

    /// Drop the agent conversation and forget its token usage.
    pub(crate) fn clear_session(&self, st: &mut EngineState) {
        st.ctx.session_id = None;
        st.budget.reset();
        st.ctx.remaining_budget_percent = st.budget.remaining_percent();
    }

    fn begin_run(&self, st: &mut EngineState) {
        st.run_id += 1;
        st.cancel = CancellationToken::new();
        st.interrupt = None;
        st.failures.reset();
        st.budget = ContextBudgetMonitor::new(self.preferences.budget.clone());
        st.ctx.reset_run(Arc::clone(&self.preferences));
    }

    /// Schedule the phase loop unless it is already running.
    ///
    /// Must be called from within a Tokio runtime.
    fn spawn_loop(self: &Arc<Self>, st: &mut EngineState) {
        if st.loop_active || !st.ctx.phase.is_in_progress() {
            return;
        }
        st.loop_active = true;
        self.active.send_replace(true);
        tokio::spawn(Arc::clone(self).drive());
    }

    pub(crate) fn plan_snapshot(&self, st: &EngineState) -> Option<(PathBuf, Plan)> {
        Some((st.ctx.plan_path()?, st.ctx.plan.clone()?))
    }

    /// Write the plan file. Failures are logged, never fatal.
    pub(crate) fn persist_plan(&self, snapshot: Option<(PathBuf, Plan)>) {
        let Some((path, plan)) = snapshot else {
            return;
        };
        if let Err(err) = save_plan(&path, &plan, self.collaborators.plan_parser.as_ref()) {
            let mut st = self.state.lock();
            self.log(
                &mut st,
                LogLevel::Warning,
                format!("Could not save plan to {}: {err:#}", path.display()),
            );
        }
    }

    fn new_failure(&self, st: &EngineState, error: &str) -> Option<PendingTaskFailure> {
        let task = st.ctx.current_task()?;
        Some(PendingTaskFailure {
            id: Uuid::new_v4(),
            task_number: task.number,
            task_title: task.title.clone(),
            error: error.to_string(),
        })
    }
}
