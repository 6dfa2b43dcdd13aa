//! The phase loop: prepare a step under the lock, run it unlocked, apply it under the lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{EngineState, Inner, InterruptReason};
use crate::core::classifier::TaskClassifier;
use crate::core::failure::FailureDecision;
use crate::core::interview::InterviewSession;
use crate::core::log::LogLevel;
use crate::core::plan::Plan;
use crate::core::retry::{RetryDecision, RetryPolicy};
use crate::core::transitions::{TransitionInputs, next_phase};
use crate::core::types::{CallPurpose, GateOutcome, Phase, TaskStatus};
use crate::events::EngineEvent;
use crate::io::agent::{AgentError, AgentMessage, AgentRequest, AgentResponse};
use crate::io::config::DevloopConfig;
use crate::io::gates::{DEFAULT_OUTPUT_LIMIT_BYTES, GateKind, GateRequest};
use crate::io::git::CommitOutcome;
use crate::io::prompt::{NO_ISSUES_MARKER, PromptInputs, plan_outline};

/// One unit of work, detached from the context so it can run unlocked.
pub(super) struct Step {
    pub(super) run_id: u64,
    pub(super) phase: Phase,
    pub(super) kind: StepKind,
    pub(super) workdir: PathBuf,
    pub(super) session_id: Option<String>,
    pub(super) task_number: Option<u32>,
    pub(super) cancel: CancellationToken,
    pub(super) config: Arc<DevloopConfig>,
}

pub(super) enum StepKind {
    Call {
        purpose: CallPurpose,
        prompt: String,
    },
    /// Analysis call, then a fix call fed with the findings.
    Review {
        prompt: String,
        inputs: PromptInputs,
    },
    Commit {
        message: String,
    },
    Handoff {
        commit_prompt: String,
        summary_prompt: String,
    },
    Clear,
}

pub(super) enum StepOutcome {
    Call(Result<AgentResponse, CallFailure>),
    Commit {
        commit: anyhow::Result<CommitOutcome>,
        gate_failure: Option<String>,
    },
    Handoff(Result<Option<String>, CallFailure>),
    Clear,
}

/// Why an agent call did not produce a usable response.
#[derive(Debug)]
pub(super) enum CallFailure {
    /// The run was stopped.
    Cancelled,
    /// The engine interrupted the call itself.
    Suspended(InterruptReason),
    /// Retries are used up.
    Exhausted(AgentError),
    Internal(String),
}

impl Inner {
    /// Run steps until the phase rests (waiting, paused, idle, or terminal).
    pub(super) async fn drive(self: Arc<Self>) {
        loop {
            let step = {
                let mut st = self.state.lock();
                if !st.ctx.phase.is_in_progress() {
                    st.loop_active = false;
                    let phase = st.ctx.phase;
                    self.active.send_replace(false);
                    self.emit(EngineEvent::Settled { phase });
                    debug!(%phase, "phase loop settled");
                    return;
                }
                match self.prepare_step(&mut st) {
                    Ok(step) => step,
                    Err(message) => {
                        self.fail_run(&mut st, message);
                        continue;
                    }
                }
            };

            let outcome = self.execute_step(&step).await;

            let save = {
                let mut st = self.state.lock();
                if st.run_id != step.run_id || st.ctx.phase == Phase::Failed {
                    debug!(phase = %step.phase, "outcome of a stopped run discarded");
                    None
                } else {
                    self.apply_outcome(&mut st, &step, outcome)
                }
            };
            self.persist_plan(save);
        }
    }

    fn prompt_inputs(&self, st: &mut EngineState) -> PromptInputs {
        let ctx = &mut st.ctx;
        let task = ctx.current_task().cloned();
        let continuation = match (&ctx.continuation, &task) {
            (Some(summary), Some(task)) if summary.task_number == task.number => {
                Some(summary.summary.clone())
            }
            _ => None,
        };
        PromptInputs {
            feature: ctx.feature_description.clone(),
            transcript: ctx.interview.as_ref().map(|interview| interview.transcript()),
            answers: ctx.pending_input.take(),
            task,
            plan_source: ctx.plan.as_ref().map(|plan| plan.source.clone()),
            outline: ctx.plan.as_ref().map(plan_outline),
            continuation,
            findings: None,
            failure: ctx.last_task_error.clone(),
        }
    }

    fn prepare_step(&self, st: &mut EngineState) -> Result<Step, String> {
        let phase = st.ctx.phase;
        let workdir = st
            .ctx
            .target_path
            .clone()
            .ok_or_else(|| "No target path set".to_string())?;
        let task_label = st.ctx.current_task().map(|task| task.label());
        let needs_task = phase.is_task_scoped()
            || matches!(
                phase,
                Phase::CommittingImplementation | Phase::CommittingReview | Phase::CommittingTests
            );
        if needs_task && task_label.is_none() {
            return Err(format!("{phase} has no current task"));
        }
        let label = task_label.unwrap_or_default();

        let build = |st: &mut EngineState, purpose: CallPurpose| -> Result<String, String> {
            let inputs = self.prompt_inputs(st);
            self.prompts
                .build(purpose, &inputs)
                .map_err(|err| format!("{} prompt: {err:#}", purpose.label()))
        };

        let kind = match phase {
            Phase::ConductingInterview => StepKind::Call {
                purpose: CallPurpose::Interview,
                prompt: build(st, CallPurpose::Interview)?,
            },
            Phase::GeneratingInitialPlan => StepKind::Call {
                purpose: CallPurpose::PlanGeneration,
                prompt: build(st, CallPurpose::PlanGeneration)?,
            },
            Phase::RewritingPlan => StepKind::Call {
                purpose: CallPurpose::PlanRewrite,
                prompt: build(st, CallPurpose::PlanRewrite)?,
            },
            Phase::ExecutingTask => StepKind::Call {
                purpose: CallPurpose::Implementation,
                prompt: build(st, CallPurpose::Implementation)?,
            },
            Phase::WritingTests => StepKind::Call {
                purpose: CallPurpose::TestWriting,
                prompt: build(st, CallPurpose::TestWriting)?,
            },
            Phase::ReviewingCode => {
                let inputs = self.prompt_inputs(st);
                let prompt = self
                    .prompts
                    .build(CallPurpose::ReviewAnalysis, &inputs)
                    .map_err(|err| format!("Review prompt: {err:#}"))?;
                StepKind::Review { prompt, inputs }
            }
            Phase::CommittingImplementation => StepKind::Commit {
                message: label.clone(),
            },
            Phase::CommittingReview => StepKind::Commit {
                message: format!("{label}: apply review fixes"),
            },
            Phase::CommittingTests => StepKind::Commit {
                message: format!("{label}: add tests"),
            },
            Phase::ClearingContext if st.ctx.handoff_resume_phase.is_some() => StepKind::Handoff {
                commit_prompt: build(st, CallPurpose::HandoffCommit)?,
                summary_prompt: build(st, CallPurpose::HandoffSummary)?,
            },
            Phase::ClearingContext => StepKind::Clear,
            Phase::Idle
            | Phase::WaitingForUser
            | Phase::Paused
            | Phase::Completed
            | Phase::Failed => return Err(format!("{phase} has no work to run")),
        };

        Ok(Step {
            run_id: st.run_id,
            phase,
            kind,
            workdir,
            session_id: st.ctx.session_id.clone(),
            task_number: st.ctx.current_task().map(|task| task.number),
            cancel: st.cancel.clone(),
            config: Arc::clone(&st.ctx.config),
        })
    }

    async fn execute_step(&self, step: &Step) -> StepOutcome {
        match &step.kind {
            StepKind::Call { purpose, prompt } => StepOutcome::Call(
                self.call_agent(step, *purpose, prompt, step.session_id.clone())
                    .await,
            ),
            StepKind::Review { prompt, inputs } => {
                StepOutcome::Call(self.review(step, prompt, inputs).await)
            }
            StepKind::Commit { message } => self.commit(step, message).await,
            StepKind::Handoff {
                commit_prompt,
                summary_prompt,
            } => StepOutcome::Handoff(self.handoff(step, commit_prompt, summary_prompt).await),
            StepKind::Clear => StepOutcome::Clear,
        }
    }

    /// One agent call with transient-error retries.
    #[instrument(skip_all, fields(purpose = ?purpose, task = ?step.task_number))]
    pub(super) async fn call_agent(
        &self,
        step: &Step,
        purpose: CallPurpose,
        prompt: &str,
        session_id: Option<String>,
    ) -> Result<AgentResponse, CallFailure> {
        let policy = RetryPolicy::new(step.config.retry.clone());
        let permission_mode = purpose.permission_mode();
        let timeout = step.config.timeouts.for_mode(permission_mode);
        let sink = |message: &AgentMessage| self.handle_message(step, purpose, message);
        let mut attempt = 1;
        loop {
            if step.cancel.is_cancelled() {
                return Err(CallFailure::Cancelled);
            }
            self.state.lock().interrupt = None;
            let request = AgentRequest {
                prompt: prompt.to_string(),
                workdir: step.workdir.clone(),
                permission_mode,
                session_id: session_id.clone(),
                timeout: Some(timeout),
                purpose,
                task_number: step.task_number,
                cancel: step.cancel.clone(),
            };
            let result = self.collaborators.agent.execute(request, &sink).await;
            let interrupt = self.finish_call(step.run_id, result.as_ref().ok());

            if step.cancel.is_cancelled() {
                return Err(CallFailure::Cancelled);
            }
            if let Some(reason) = interrupt {
                return Err(CallFailure::Suspended(reason));
            }
            let error = match result {
                Ok(response) if !response.is_error => return Ok(response),
                Ok(response) => AgentError::SoftExit {
                    code: None,
                    message: response.result_text,
                },
                Err(err) => err,
            };

            match policy.decide(attempt, &error) {
                RetryDecision::RetryAfter(delay) => {
                    self.log_for_run(
                        step.run_id,
                        LogLevel::Warning,
                        format!(
                            "Retrying {} (attempt {}/{}) after error: {error}",
                            purpose.label(),
                            attempt + 1,
                            policy.max_attempts()
                        ),
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = step.cancel.cancelled() => return Err(CallFailure::Cancelled),
                    }
                    attempt += 1;
                }
                RetryDecision::GiveUp => {
                    warn!(%error, attempt, "agent call gave up");
                    return Err(CallFailure::Exhausted(error));
                }
            }
        }
    }

    /// Fold a finished call into the context and take any pending interrupt.
    fn finish_call(&self, run_id: u64, response: Option<&AgentResponse>) -> Option<InterruptReason> {
        let mut st = self.state.lock();
        if st.run_id != run_id {
            return None;
        }
        if let Some(response) = response {
            st.ctx.total_cost_usd += response.total_cost_usd;
            if let Some(usage) = response.usage {
                st.ctx.input_tokens += usage.input_tokens;
                st.ctx.output_tokens += usage.output_tokens;
            }
            if let Some(id) = &response.session_id {
                st.ctx.session_id = Some(id.clone());
            }
            self.emit_usage(&st);
        }
        st.interrupt.take()
    }

    pub(super) fn emit_usage(&self, st: &EngineState) {
        self.emit(EngineEvent::UsageUpdated {
            total_cost_usd: st.ctx.total_cost_usd,
            input_tokens: st.ctx.input_tokens,
            output_tokens: st.ctx.output_tokens,
            remaining_budget_percent: st.ctx.remaining_budget_percent,
        });
    }

    async fn review(
        &self,
        step: &Step,
        prompt: &str,
        inputs: &PromptInputs,
    ) -> Result<AgentResponse, CallFailure> {
        let analysis = self
            .call_agent(step, CallPurpose::ReviewAnalysis, prompt, step.session_id.clone())
            .await?;
        if analysis.result_text.contains(NO_ISSUES_MARKER) {
            self.log_for_run(step.run_id, LogLevel::Info, "Review found no issues");
            return Ok(analysis);
        }
        self.log_for_run(
            step.run_id,
            LogLevel::Info,
            "Review found issues; applying fixes",
        );
        let fix_inputs = PromptInputs {
            findings: Some(analysis.result_text.clone()),
            answers: None,
            ..inputs.clone()
        };
        let fix_prompt = self
            .prompts
            .build(CallPurpose::ReviewFix, &fix_inputs)
            .map_err(|err| CallFailure::Internal(format!("Review fix prompt: {err:#}")))?;
        let session = analysis.session_id.clone().or_else(|| step.session_id.clone());
        self.call_agent(step, CallPurpose::ReviewFix, &fix_prompt, session)
            .await
    }

    async fn commit(&self, step: &Step, message: &str) -> StepOutcome {
        let commit = self
            .collaborators
            .version_control
            .commit_all(message, &step.workdir)
            .await;
        let gate_failure = match &commit {
            Ok(_) => self.run_gates(step).await,
            Err(_) => None,
        };
        StepOutcome::Commit {
            commit,
            gate_failure,
        }
    }

    /// Build and test gates after a commit; the first failure is returned.
    async fn run_gates(&self, step: &Step) -> Option<String> {
        let auto = &step.config.autonomous;
        if !auto.enabled {
            return None;
        }
        let gates = [
            (GateKind::Build, auto.run_build_after_commit, &auto.build_command),
            (GateKind::Test, auto.run_tests_after_commit, &auto.test_command),
        ];
        for (kind, enabled, command) in gates {
            if !enabled {
                continue;
            }
            let request = GateRequest {
                kind,
                command: command.clone(),
                workdir: step.workdir.clone(),
                timeout: Duration::from_secs(auto.gate_timeout_secs),
                output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
                cancel: step.cancel.clone(),
            };
            match self.collaborators.gates.run(&request).await {
                Ok(report) if report.outcome == GateOutcome::Pass => self.log_for_run(
                    step.run_id,
                    LogLevel::Info,
                    format!("{} gate passed", kind.label()),
                ),
                Ok(report) => {
                    return Some(format!(
                        "{} gate failed:\n{}",
                        kind.label(),
                        report.output_tail
                    ));
                }
                Err(err) => return Some(format!("{} gate could not run: {err:#}", kind.label())),
            }
        }
        None
    }

    /// Returns the plan to persist when the step changed it.
    fn apply_outcome(
        &self,
        st: &mut EngineState,
        step: &Step,
        outcome: StepOutcome,
    ) -> Option<(PathBuf, Plan)> {
        let before = st.ctx.plan.clone();
        match outcome {
            StepOutcome::Call(Ok(response)) => self.apply_response(st, step, response),
            StepOutcome::Call(Err(failure)) => self.apply_call_failure(st, step, failure),
            StepOutcome::Commit {
                commit,
                gate_failure,
            } => self.apply_commit(st, step, commit, gate_failure),
            StepOutcome::Handoff(result) => self.apply_handoff(st, result),
            StepOutcome::Clear => self.apply_clear(st),
        }
        if st.ctx.plan != before {
            self.plan_snapshot(st)
        } else {
            None
        }
    }

    fn apply_response(&self, st: &mut EngineState, step: &Step, response: AgentResponse) {
        match step.phase {
            Phase::ConductingInterview => {
                let feature = st.ctx.feature_description.clone();
                let interview = st
                    .ctx
                    .interview
                    .get_or_insert_with(|| InterviewSession::new(feature));
                let marked =
                    interview.is_complete() || interview.observe_text(&response.result_text);
                if !marked {
                    interview.mark_complete();
                    self.log(
                        st,
                        LogLevel::Warning,
                        "Interview ended without a completion marker; continuing to planning",
                    );
                } else {
                    self.log(st, LogLevel::Info, "Requirements interview complete");
                }
                st.ctx.current_interview_question = None;
            }
            Phase::GeneratingInitialPlan => {
                let plan = self.collaborators.plan_parser.parse(&response.result_text);
                if plan.is_empty() {
                    self.fail_run(st, "No tasks found in plan");
                    return;
                }
                self.log(
                    st,
                    LogLevel::Info,
                    format!("Generated plan with {} tasks", plan.tasks.len()),
                );
                st.ctx.plan = Some(plan);
                st.ctx.current_task_index = None;
            }
            Phase::RewritingPlan => {
                let plan = self.collaborators.plan_parser.parse(&response.result_text);
                if plan.is_empty() {
                    self.fail_run(st, "No tasks found in plan");
                    return;
                }
                self.log(
                    st,
                    LogLevel::Info,
                    format!("Plan rewritten into {} tasks", plan.tasks.len()),
                );
                let first = plan.first_incomplete_index();
                st.ctx.plan = Some(plan);
                match first {
                    Some(idx) => self.select_task(st, idx),
                    None => {
                        self.clear_session(st);
                        self.advance(st, Phase::Completed);
                        return;
                    }
                }
            }
            Phase::ExecutingTask | Phase::ReviewingCode | Phase::WritingTests => {
                if let Some(label) = st.ctx.current_task().map(|task| task.label()) {
                    self.log(
                        st,
                        LogLevel::Info,
                        format!("{} finished for {label}", step.phase),
                    );
                }
            }
            other => warn!(phase = %other, "agent response in a phase without calls"),
        }
        let next = next_phase(step.phase, &self.transition_inputs(st));
        self.advance(st, next);
    }

    fn apply_call_failure(&self, st: &mut EngineState, step: &Step, failure: CallFailure) {
        match failure {
            CallFailure::Cancelled => debug!(phase = %step.phase, "call cancelled"),
            CallFailure::Suspended(InterruptReason::Question) => {
                st.ctx.question_origin.get_or_insert(step.phase);
                self.advance(st, Phase::WaitingForUser);
            }
            CallFailure::Suspended(InterruptReason::Handoff) => {
                self.log(
                    st,
                    LogLevel::Info,
                    format!(
                        "Context budget low ({:.0}% left); handing off",
                        st.ctx.remaining_budget_percent
                    ),
                );
                st.ctx.handoff_resume_phase = Some(step.phase);
                self.advance(st, Phase::ClearingContext);
            }
            CallFailure::Exhausted(err) if step.phase.is_task_scoped() => {
                self.route_task_failure(st, format!("{} failed: {err}", step.phase));
            }
            CallFailure::Exhausted(err) => {
                self.fail_run(st, format!("{} failed: {err}", step.phase));
            }
            CallFailure::Internal(message) => self.fail_run(st, message),
        }
    }

    fn apply_commit(
        &self,
        st: &mut EngineState,
        step: &Step,
        commit: anyhow::Result<CommitOutcome>,
        gate_failure: Option<String>,
    ) {
        match commit {
            Ok(CommitOutcome::Committed) => self.log(st, LogLevel::Info, "Changes committed"),
            Ok(CommitOutcome::NothingToCommit) => {
                self.log(st, LogLevel::Info, "Nothing to commit")
            }
            Err(err) => {
                self.fail_run(st, format!("{} failed: {err:#}", step.phase));
                return;
            }
        }
        if let Some(failure) = gate_failure {
            self.route_task_failure(st, failure);
            return;
        }
        if step.phase == Phase::CommittingReview && st.ctx.config.tests.write_tests {
            let classifier = TaskClassifier::new(&st.ctx.config.tests.ui_keywords);
            let keyword = st
                .ctx
                .current_task()
                .and_then(|task| classifier.ui_keyword(task).map(str::to_string));
            if let Some(keyword) = keyword {
                self.log(
                    st,
                    LogLevel::Info,
                    format!("Skipping tests for UI task (matched \"{keyword}\")"),
                );
            }
        }
        let next = next_phase(step.phase, &self.transition_inputs(st));
        self.advance(st, next);
    }

    fn apply_clear(&self, st: &mut EngineState) {
        self.set_task_status(st, TaskStatus::Completed);
        if let Some(task) = st.ctx.current_task() {
            let (number, label) = (task.number, task.label());
            st.failures.on_success(number);
            self.log(st, LogLevel::Info, format!("Completed {label}"));
        }
        let next = next_phase(Phase::ClearingContext, &self.transition_inputs(st));
        let next = match next {
            Phase::ExecutingTask | Phase::Completed => self.next_task_phase(st),
            other => other,
        };
        self.advance(st, next);
    }

    /// Apply the failure policy to the current task.
    pub(super) fn route_task_failure(&self, st: &mut EngineState, error: String) {
        let Some(task) = st.ctx.current_task() else {
            self.fail_run(st, error);
            return;
        };
        let (number, label) = (task.number, task.label());
        self.record_error(st, format!("{label}: {error}"));
        st.ctx.last_task_error = Some(error.clone());
        let decision = st.failures.on_failure(number, &st.ctx.config.autonomous);
        match decision {
            FailureDecision::AskUser => {
                self.set_task_status(st, TaskStatus::Failed);
                if let Some(failure) = self.new_failure(st, &error) {
                    st.ctx.pending_task_failure = Some(failure.clone());
                    self.emit(EngineEvent::TaskFailurePending { failure });
                }
                self.advance(st, Phase::WaitingForUser);
            }
            FailureDecision::Retry {
                failures,
                max_retries,
            } => {
                self.log(
                    st,
                    LogLevel::Warning,
                    format!("{label} failure {failures}/{max_retries}; auto-retrying"),
                );
                self.clear_session(st);
                self.advance(st, Phase::ExecutingTask);
            }
            FailureDecision::Skip { failures } => {
                self.log(
                    st,
                    LogLevel::Warning,
                    format!("Skipping {label} after {failures} failures"),
                );
                self.set_task_status(st, TaskStatus::Skipped);
                let next = self.next_task_phase(st);
                self.advance(st, next);
            }
            FailureDecision::Stop { failures } => {
                self.set_task_status(st, TaskStatus::Failed);
                self.fail_run(st, format!("Stopping after {label} failed {failures} times"));
            }
        }
    }

    fn transition_inputs(&self, st: &EngineState) -> TransitionInputs {
        let ctx = &st.ctx;
        let classifier = TaskClassifier::new(&ctx.config.tests.ui_keywords);
        TransitionInputs {
            interview_complete: ctx
                .interview
                .as_ref()
                .is_some_and(|interview| interview.is_complete()),
            write_tests: ctx.config.tests.write_tests,
            ui_task: ctx
                .current_task()
                .is_some_and(|task| classifier.is_ui_task(task)),
            has_next_task: match (ctx.plan.as_ref(), ctx.current_task_index) {
                (Some(plan), Some(idx)) => plan.next_open_index(idx).is_some(),
                _ => false,
            },
        }
    }
}
