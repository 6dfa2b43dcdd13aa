//! Context handoff: checkpoint the work, summarize it, continue in a fresh session.

use chrono::Utc;

use super::phases::{CallFailure, Step};
use super::{ContinuationSummary, EngineState, Inner, InterruptReason};
use crate::core::log::LogLevel;
use crate::core::types::{CallPurpose, Phase};

impl Inner {
    /// Ask the agent to commit its progress, then to summarize it.
    ///
    /// Either call may fail without failing the run; the task just restarts
    /// with less context.
    pub(super) async fn handoff(
        &self,
        step: &Step,
        commit_prompt: &str,
        summary_prompt: &str,
    ) -> Result<Option<String>, CallFailure> {
        match self
            .call_agent(
                step,
                CallPurpose::HandoffCommit,
                commit_prompt,
                step.session_id.clone(),
            )
            .await
        {
            Ok(_) => self.log_for_run(step.run_id, LogLevel::Info, "Checkpoint commit done"),
            Err(CallFailure::Exhausted(err)) => self.log_for_run(
                step.run_id,
                LogLevel::Warning,
                format!("Checkpoint commit failed: {err}"),
            ),
            Err(other) => return Err(other),
        }

        match self
            .call_agent(
                step,
                CallPurpose::HandoffSummary,
                summary_prompt,
                step.session_id.clone(),
            )
            .await
        {
            Ok(response) => {
                let summary = response.result_text.trim().to_string();
                Ok((!summary.is_empty()).then_some(summary))
            }
            Err(CallFailure::Exhausted(err)) => {
                self.log_for_run(
                    step.run_id,
                    LogLevel::Warning,
                    format!("Continuation summary failed: {err}"),
                );
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }

    pub(super) fn apply_handoff(
        &self,
        st: &mut EngineState,
        result: Result<Option<String>, CallFailure>,
    ) {
        let summary = match result {
            Ok(summary) => summary,
            Err(CallFailure::Suspended(InterruptReason::Question)) => {
                st.ctx.question_origin.get_or_insert(Phase::ClearingContext);
                self.advance(st, Phase::WaitingForUser);
                return;
            }
            Err(CallFailure::Internal(message)) => {
                self.fail_run(st, message);
                return;
            }
            Err(CallFailure::Cancelled)
            | Err(CallFailure::Suspended(InterruptReason::Handoff))
            | Err(CallFailure::Exhausted(_)) => None,
        };

        let resume = st
            .ctx
            .handoff_resume_phase
            .take()
            .unwrap_or(Phase::ExecutingTask);
        self.clear_session(st);
        let task_number = st.ctx.current_task().map(|task| task.number);
        st.ctx.continuation = match (summary, task_number) {
            (Some(summary), Some(task_number)) => Some(ContinuationSummary {
                task_number,
                summary,
                created_at: Utc::now(),
            }),
            _ => None,
        };
        self.emit_usage(st);
        self.log(
            st,
            LogLevel::Info,
            format!("Context handed off; resuming {resume} in a fresh session"),
        );
        self.advance(st, resume);
    }
}
