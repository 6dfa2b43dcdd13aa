//! Handling of messages streamed by an in-flight agent call.

use tracing::{debug, info};

use super::phases::Step;
use super::{Inner, InterruptReason, PendingQuestion};
use crate::core::log::LogLevel;
use crate::core::types::{CallPurpose, Phase};
use crate::events::EngineEvent;
use crate::io::agent::{ASK_USER_TOOL, AgentMessage, ContentBlock, parse_ask_user};

/// Longest tool input echoed into the log.
const TOOL_INPUT_PREVIEW_CHARS: usize = 200;

impl Inner {
    /// Sink for one call's stream. Runs on the agent client's task, takes the
    /// lock briefly, and never calls back into the agent while holding it.
    pub(super) fn handle_message(&self, step: &Step, purpose: CallPurpose, message: &AgentMessage) {
        let interrupt_agent = {
            let mut st = self.state.lock();
            if st.run_id != step.run_id || st.ctx.phase == Phase::Failed {
                return;
            }
            if let Some(id) = message.session_id() {
                if st.ctx.session_id.as_deref() != Some(id) {
                    debug!(session_id = id, "agent session captured");
                    st.ctx.session_id = Some(id.to_string());
                }
            }

            let mut interrupt_agent = false;
            if let AgentMessage::Assistant { content, usage, .. } = message {
                for block in content {
                    match block {
                        ContentBlock::Text(text) => {
                            if text.trim().is_empty() {
                                continue;
                            }
                            self.log(&mut st, LogLevel::Agent, text.trim());
                            if purpose == CallPurpose::Interview {
                                let completed = st
                                    .ctx
                                    .interview
                                    .as_mut()
                                    .is_some_and(|interview| {
                                        !interview.is_complete() && interview.observe_text(text)
                                    });
                                if completed {
                                    info!("interview completion marker seen");
                                }
                            }
                        }
                        ContentBlock::ToolUse { name, input, .. } if name == ASK_USER_TOOL => {
                            let questions: Vec<PendingQuestion> = parse_ask_user(input)
                                .into_iter()
                                .map(PendingQuestion::from)
                                .collect();
                            if questions.is_empty() {
                                continue;
                            }
                            let was_idle = st.ctx.pending_questions.is_empty();
                            if purpose == CallPurpose::Interview {
                                st.ctx.current_interview_question =
                                    Some(questions[0].question.clone());
                            }
                            st.ctx.pending_questions.extend(questions);
                            st.ctx.question_origin.get_or_insert(step.phase);
                            if was_idle {
                                if let Some(front) = st.ctx.pending_questions.front().cloned() {
                                    self.log(
                                        &mut st,
                                        LogLevel::Info,
                                        format!("Agent asks: {}", front.question),
                                    );
                                    self.emit(EngineEvent::QuestionPending { question: front });
                                }
                            }
                            st.interrupt = Some(InterruptReason::Question);
                            interrupt_agent = true;
                        }
                        ContentBlock::ToolUse { name, input, .. } => {
                            let preview = preview(&input.to_string());
                            self.log(&mut st, LogLevel::Tool, format!("{name} {preview}"));
                        }
                    }
                }

                if let Some(usage) = usage {
                    st.budget.record(usage);
                    st.ctx.remaining_budget_percent = st.budget.remaining_percent();
                    self.emit_usage(&st);
                    let handoff_allowed = step.phase.is_task_scoped()
                        && !matches!(
                            purpose,
                            CallPurpose::HandoffCommit | CallPurpose::HandoffSummary
                        );
                    if handoff_allowed && st.interrupt.is_none() && st.budget.needs_handoff() {
                        st.interrupt = Some(InterruptReason::Handoff);
                        interrupt_agent = true;
                    }
                }
            }
            interrupt_agent
        };

        if interrupt_agent {
            self.collaborators.agent.interrupt();
        }
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= TOOL_INPUT_PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(TOOL_INPUT_PREVIEW_CHARS).collect();
    format!("{cut}…")
}
