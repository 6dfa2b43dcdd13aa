//! Test-only doubles for the engine's collaborators.
//!
//! Every double is configured through `&self` so a test can keep an `Arc`
//! to it after handing a clone to the engine.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::core::interview::INTERVIEW_COMPLETE_SENTINEL;
use crate::core::plan::{Plan, Task};
use crate::core::types::{CallPurpose, GateOutcome, PermissionMode, TokenUsage};
use crate::engine::{Collaborators, ExecutionEngine};
use crate::io::agent::{
    ASK_USER_TOOL, AgentClient, AgentError, AgentMessage, AgentRequest, AgentResponse,
    ContentBlock, MessageSink, QuestionSpec, ResultMessage,
};
use crate::io::config::DevloopConfig;
use crate::io::gates::{GateKind, GateReport, GateRequest, GateRunner};
use crate::io::git::{CommitOutcome, VersionControl};
use crate::io::isolation::{WorkspaceInfo, WorkspaceIsolation};
use crate::io::plan_store::MarkdownPlanParser;
use crate::io::prompt::NO_ISSUES_MARKER;

/// Upper bound on how long a scripted call waits for an interrupt or release.
const SCRIPT_WAIT_LIMIT: Duration = Duration::from_secs(10);

/// Cost reported by every successful scripted call.
pub const SCRIPTED_CALL_COST_USD: f64 = 0.01;

/// Markdown plan with `count` tasks titled `Task title N`.
pub fn plan_markdown(count: u32) -> String {
    let mut out = String::from("# Implementation Plan\n");
    for n in 1..=count {
        out.push_str(&format!(
            "\n## Task {n}: Task title {n}\n**Description:** Implement part {n}\n- [ ] Write code for part {n}\n"
        ));
    }
    out
}

/// Parsed plan with `count` pending tasks.
pub fn plan(count: u32) -> Plan {
    let tasks = (1..=count)
        .map(|n| Task::new(n, format!("Task title {n}"), format!("Implement part {n}")))
        .collect();
    Plan::new(plan_markdown(count), tasks)
}

/// A single freeform question.
pub fn question(text: &str) -> QuestionSpec {
    QuestionSpec {
        question: text.to_string(),
        header: String::new(),
        options: Vec::new(),
        multi_select: false,
    }
}

/// One recorded `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub purpose: CallPurpose,
    pub prompt: String,
    pub session_id: Option<String>,
    pub task_number: Option<u32>,
    pub permission_mode: PermissionMode,
}

#[derive(Debug, Clone)]
struct FailureRule {
    purpose: CallPurpose,
    task_number: Option<u32>,
    error: AgentError,
    /// `None` fails forever.
    remaining: Option<u32>,
}

#[derive(Default)]
struct Script {
    responses: HashMap<CallPurpose, VecDeque<String>>,
    questions: HashMap<CallPurpose, VecDeque<Vec<QuestionSpec>>>,
    usage: HashMap<CallPurpose, VecDeque<TokenUsage>>,
    failures: Vec<FailureRule>,
    calls: Vec<RecordedCall>,
    hold: Option<CallPurpose>,
    sessions: usize,
}

impl Script {
    fn take_failure(&mut self, purpose: CallPurpose, task_number: Option<u32>) -> Option<AgentError> {
        let rule = self.failures.iter_mut().find(|rule| {
            rule.purpose == purpose
                && (rule.task_number.is_none() || rule.task_number == task_number)
                && rule.remaining != Some(0)
        })?;
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(rule.error.clone())
    }
}

/// Agent double driven by per-purpose scripts.
///
/// Calls without a scripted response get a sensible default: the interview
/// completes, plans have two tasks, and reviews find nothing.
#[derive(Default)]
pub struct ScriptedAgent {
    script: Mutex<Script>,
    current: Mutex<Option<CancellationToken>>,
    release: Notify,
    entered: Notify,
    interrupts: AtomicUsize,
    terminated: AtomicBool,
    running: AtomicBool,
}

impl ScriptedAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the result text of the next call for `purpose`.
    pub fn respond(&self, purpose: CallPurpose, text: impl Into<String>) {
        self.script
            .lock()
            .responses
            .entry(purpose)
            .or_default()
            .push_back(text.into());
    }

    /// Make the next call for `purpose` ask these questions and wait to be interrupted.
    pub fn ask(&self, purpose: CallPurpose, questions: Vec<QuestionSpec>) {
        self.script
            .lock()
            .questions
            .entry(purpose)
            .or_default()
            .push_back(questions);
    }

    /// Report `usage` mid-stream on the next call for `purpose`.
    pub fn report_usage(&self, purpose: CallPurpose, usage: TokenUsage) {
        self.script
            .lock()
            .usage
            .entry(purpose)
            .or_default()
            .push_back(usage);
    }

    /// Fail calls for `purpose`; `times: None` fails every call.
    pub fn fail(&self, purpose: CallPurpose, error: AgentError, times: Option<u32>) {
        self.script.lock().failures.push(FailureRule {
            purpose,
            task_number: None,
            error,
            remaining: times,
        });
    }

    /// Like [`Self::fail`], limited to one task.
    pub fn fail_task(
        &self,
        purpose: CallPurpose,
        task_number: u32,
        error: AgentError,
        times: Option<u32>,
    ) {
        self.script.lock().failures.push(FailureRule {
            purpose,
            task_number: Some(task_number),
            error,
            remaining: times,
        });
    }

    /// Block calls for `purpose` until [`Self::release`] or an interrupt.
    pub fn hold(&self, purpose: CallPurpose) {
        self.script.lock().hold = Some(purpose);
    }

    pub fn release(&self) {
        self.script.lock().hold = None;
        self.release.notify_one();
    }

    /// Resolves once a held call is in flight.
    pub async fn wait_until_held(&self) {
        self.entered.notified().await;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script.lock().calls.clone()
    }

    pub fn calls_for(&self, purpose: CallPurpose) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|call| call.purpose == purpose)
            .count()
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    fn default_response(purpose: CallPurpose) -> String {
        match purpose {
            CallPurpose::Interview => format!("Requirements are clear. {INTERVIEW_COMPLETE_SENTINEL}"),
            CallPurpose::PlanGeneration | CallPurpose::PlanRewrite => plan_markdown(2),
            CallPurpose::ReviewAnalysis => NO_ISSUES_MARKER.to_string(),
            CallPurpose::HandoffSummary => "Progress summary".to_string(),
            _ => "Done.".to_string(),
        }
    }

    async fn wait_for_interrupt(token: &CancellationToken) -> AgentError {
        tokio::select! {
            _ = token.cancelled() => AgentError::Interrupted,
            _ = tokio::time::sleep(SCRIPT_WAIT_LIMIT) => AgentError::Timeout(SCRIPT_WAIT_LIMIT),
        }
    }

    async fn wait_for_release(&self, token: &CancellationToken) -> Result<(), AgentError> {
        self.entered.notify_one();
        tokio::select! {
            _ = self.release.notified() => Ok(()),
            _ = token.cancelled() => Err(AgentError::Interrupted),
        }
    }

    async fn run(
        &self,
        request: &AgentRequest,
        token: &CancellationToken,
        on_message: MessageSink<'_>,
    ) -> Result<AgentResponse, AgentError> {
        let (failure, questions, usage, held, session_id) = {
            let mut script = self.script.lock();
            script.calls.push(RecordedCall {
                purpose: request.purpose,
                prompt: request.prompt.clone(),
                session_id: request.session_id.clone(),
                task_number: request.task_number,
                permission_mode: request.permission_mode,
            });
            let failure = script.take_failure(request.purpose, request.task_number);
            let questions = script
                .questions
                .get_mut(&request.purpose)
                .and_then(VecDeque::pop_front);
            let usage = script
                .usage
                .get_mut(&request.purpose)
                .and_then(VecDeque::pop_front);
            let held = script.hold == Some(request.purpose);
            let session_id = match &request.session_id {
                Some(id) => id.clone(),
                None => {
                    script.sessions += 1;
                    format!("session-{}", script.sessions)
                }
            };
            (failure, questions, usage, held, session_id)
        };

        if let Some(err) = failure {
            if held {
                self.wait_for_release(token).await?;
            }
            return Err(err);
        }

        on_message(&AgentMessage::System {
            subtype: "init".to_string(),
            session_id: Some(session_id.clone()),
        });

        if let Some(questions) = questions {
            let input = json!({
                "questions": questions.iter().map(|q| json!({
                    "question": q.question,
                    "header": q.header,
                    "options": q.options,
                    "multiSelect": q.multi_select,
                })).collect::<Vec<_>>()
            });
            on_message(&AgentMessage::Assistant {
                content: vec![ContentBlock::ToolUse {
                    id: "toolu_ask".to_string(),
                    name: ASK_USER_TOOL.to_string(),
                    input,
                }],
                usage: None,
                session_id: Some(session_id.clone()),
            });
            return Err(Self::wait_for_interrupt(token).await);
        }

        if let Some(usage) = usage {
            on_message(&AgentMessage::Assistant {
                content: vec![ContentBlock::Text("Working on it".to_string())],
                usage: Some(usage),
                session_id: Some(session_id.clone()),
            });
            if token.is_cancelled() {
                return Err(AgentError::Interrupted);
            }
        }

        if held {
            self.wait_for_release(token).await?;
        }

        if token.is_cancelled() {
            return Err(AgentError::Interrupted);
        }

        let text = self
            .script
            .lock()
            .responses
            .get_mut(&request.purpose)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Self::default_response(request.purpose));
        on_message(&AgentMessage::Assistant {
            content: vec![ContentBlock::Text(text.clone())],
            usage: None,
            session_id: Some(session_id.clone()),
        });
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            ..TokenUsage::default()
        };
        on_message(&AgentMessage::Result(ResultMessage {
            subtype: "success".to_string(),
            is_error: false,
            result: Some(text.clone()),
            session_id: Some(session_id.clone()),
            total_cost_usd: SCRIPTED_CALL_COST_USD,
            duration_ms: 1,
            usage: Some(usage),
        }));
        Ok(AgentResponse {
            result_text: text,
            session_id: Some(session_id),
            total_cost_usd: SCRIPTED_CALL_COST_USD,
            duration_ms: 1,
            is_error: false,
            usage: Some(usage),
        })
    }
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn execute(
        &self,
        request: AgentRequest,
        on_message: MessageSink<'_>,
    ) -> Result<AgentResponse, AgentError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(AgentError::Interrupted);
        }
        let token = request.cancel.child_token();
        *self.current.lock() = Some(token.clone());
        self.running.store(true, Ordering::SeqCst);
        let result = self.run(&request, &token, on_message).await;
        self.running.store(false, Ordering::SeqCst);
        self.current.lock().take();
        result
    }

    fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.current.lock().as_ref() {
            token.cancel();
        }
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.interrupt();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Version control double recording every commit.
#[derive(Default)]
pub struct RecordingVersionControl {
    commits: Mutex<Vec<(String, PathBuf)>>,
    error: Mutex<Option<String>>,
}

impl RecordingVersionControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every later commit fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.error.lock() = Some(message.into());
    }

    pub fn messages(&self) -> Vec<String> {
        self.commits
            .lock()
            .iter()
            .map(|(message, _)| message.clone())
            .collect()
    }
}

#[async_trait]
impl VersionControl for RecordingVersionControl {
    async fn commit_all(&self, message: &str, directory: &Path) -> Result<CommitOutcome> {
        if let Some(err) = self.error.lock().clone() {
            return Err(anyhow!(err));
        }
        self.commits
            .lock()
            .push((message.to_string(), directory.to_path_buf()));
        Ok(CommitOutcome::Committed)
    }
}

/// Gate double returning queued outcomes (default pass).
#[derive(Default)]
pub struct ScriptedGateRunner {
    outcomes: Mutex<HashMap<GateKind, VecDeque<GateOutcome>>>,
    runs: Mutex<Vec<GateKind>>,
}

impl ScriptedGateRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, kind: GateKind, outcome: GateOutcome) {
        self.outcomes
            .lock()
            .entry(kind)
            .or_default()
            .push_back(outcome);
    }

    pub fn runs(&self) -> Vec<GateKind> {
        self.runs.lock().clone()
    }
}

#[async_trait]
impl GateRunner for ScriptedGateRunner {
    async fn run(&self, request: &GateRequest) -> Result<GateReport> {
        self.runs.lock().push(request.kind);
        let outcome = self
            .outcomes
            .lock()
            .get_mut(&request.kind)
            .and_then(VecDeque::pop_front)
            .unwrap_or(GateOutcome::Pass);
        let output_tail = match outcome {
            GateOutcome::Pass => String::new(),
            GateOutcome::Fail => format!("{} broke", request.kind.label()),
        };
        Ok(GateReport {
            outcome,
            output_tail,
        })
    }
}

/// Isolation double creating sibling directories without git.
#[derive(Default)]
pub struct FakeIsolation {
    created: Mutex<Vec<WorkspaceInfo>>,
    removal_error: Mutex<Option<String>>,
    counter: AtomicUsize,
}

impl FakeIsolation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_removal(&self, message: Option<&str>) {
        *self.removal_error.lock() = message.map(str::to_string);
    }

    pub fn live(&self) -> Vec<WorkspaceInfo> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl WorkspaceIsolation for FakeIsolation {
    async fn create_isolated_copy(&self, original: &Path) -> Result<WorkspaceInfo> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let name = original
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workspace".to_string());
        let isolated = original.with_file_name(format!("{name}-copy-{n}"));
        std::fs::create_dir_all(&isolated)?;
        let info = WorkspaceInfo {
            original_path: original.to_path_buf(),
            isolated_path: isolated.clone(),
            worktree_path: isolated,
            branch: format!("devloop/test_{n}"),
            created_at: Utc::now(),
        };
        self.created.lock().push(info.clone());
        Ok(info)
    }

    async fn remove_isolated_copy(&self, info: &WorkspaceInfo) -> Result<()> {
        if let Some(err) = self.removal_error.lock().clone() {
            return Err(anyhow!(err));
        }
        self.created
            .lock()
            .retain(|live| live.worktree_path != info.worktree_path);
        if info.worktree_path.exists() {
            std::fs::remove_dir_all(&info.worktree_path)?;
        }
        Ok(())
    }

    async fn list_isolated_copies(&self, original: &Path) -> Result<Vec<WorkspaceInfo>> {
        Ok(self
            .created
            .lock()
            .iter()
            .filter(|info| info.original_path == original)
            .cloned()
            .collect())
    }
}

/// An engine wired to scripted doubles with a temporary target directory.
pub struct Harness {
    pub agent: Arc<ScriptedAgent>,
    pub version_control: Arc<RecordingVersionControl>,
    pub gates: Arc<ScriptedGateRunner>,
    pub engine: ExecutionEngine,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(config: DevloopConfig) -> Self {
        let agent = ScriptedAgent::new();
        let version_control = RecordingVersionControl::new();
        let gates = ScriptedGateRunner::new();
        let collaborators = Collaborators {
            agent: agent.clone(),
            version_control: version_control.clone(),
            plan_parser: Arc::new(MarkdownPlanParser),
            gates: gates.clone(),
        };
        let engine = ExecutionEngine::new(Arc::new(config), collaborators);
        let dir = tempfile::tempdir().expect("tempdir");
        engine
            .set_target_path(Some(dir.path().to_path_buf()))
            .expect("idle engine");
        engine
            .set_feature_description("Add a widget")
            .expect("idle engine");
        Self {
            agent,
            version_control,
            gates,
            engine,
            dir,
        }
    }

    /// Config with zero retry delays so retry tests finish quickly.
    pub fn fast_config() -> DevloopConfig {
        let mut config = DevloopConfig::default();
        config.retry.initial_delay_ms = 0;
        config.retry.max_delay_ms = 0;
        config
    }
}
