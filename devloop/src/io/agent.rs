//! Agent client abstraction and the Claude CLI implementation.
//!
//! The engine only sees [`AgentClient`]: one call in, a stream of
//! [`AgentMessage`]s delivered to a sink while the call runs, and a final
//! [`AgentResponse`] or a typed [`AgentError`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::retry::Retryable;
use crate::core::types::{CallPurpose, PermissionMode, TokenUsage};
use crate::io::config::AgentSettings;
use crate::io::process::run_command_streaming;
use crate::io::stream;

/// Tool the agent invokes to ask the user a structured question.
pub const ASK_USER_TOOL: &str = "AskUserQuestion";

/// Upper bound applied when a request carries no timeout.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultMessage {
    pub subtype: String,
    pub is_error: bool,
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub total_cost_usd: f64,
    pub duration_ms: u64,
    pub usage: Option<TokenUsage>,
}

/// One decoded message from the agent's output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    System {
        subtype: String,
        session_id: Option<String>,
    },
    Assistant {
        content: Vec<ContentBlock>,
        usage: Option<TokenUsage>,
        session_id: Option<String>,
    },
    User {
        session_id: Option<String>,
    },
    Result(ResultMessage),
}

impl AgentMessage {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            AgentMessage::System { session_id, .. }
            | AgentMessage::Assistant { session_id, .. }
            | AgentMessage::User { session_id } => session_id.as_deref(),
            AgentMessage::Result(result) => result.session_id.as_deref(),
        }
    }

    pub fn usage(&self) -> Option<&TokenUsage> {
        match self {
            AgentMessage::Assistant { usage, .. } => usage.as_ref(),
            AgentMessage::Result(result) => result.usage.as_ref(),
            _ => None,
        }
    }
}

/// A question carried by the ask-user tool payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSpec {
    pub question: String,
    pub header: String,
    pub options: Vec<String>,
    pub multi_select: bool,
}

/// Extract questions from an ask-user tool input.
///
/// Accepts either `{"questions": [...]}` or a single question object. Options
/// may be plain strings or objects with a `label`. Entries without question
/// text are dropped.
pub fn parse_ask_user(input: &Value) -> Vec<QuestionSpec> {
    let entries: Vec<&Value> = match input.get("questions").and_then(Value::as_array) {
        Some(list) => list.iter().collect(),
        None => vec![input],
    };
    entries
        .into_iter()
        .filter_map(|entry| {
            let question = entry.get("question").and_then(Value::as_str)?.trim();
            if question.is_empty() {
                return None;
            }
            let options = entry
                .get("options")
                .and_then(Value::as_array)
                .map(|opts| {
                    opts.iter()
                        .filter_map(|opt| match opt {
                            Value::String(label) => Some(label.clone()),
                            other => other
                                .get("label")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(QuestionSpec {
                question: question.to_string(),
                header: entry
                    .get("header")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                options,
                multi_select: entry
                    .get("multiSelect")
                    .or_else(|| entry.get("multi_select"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            })
        })
        .collect()
}

/// Everything needed for one agent call.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub workdir: PathBuf,
    pub permission_mode: PermissionMode,
    pub session_id: Option<String>,
    pub timeout: Option<Duration>,
    pub purpose: CallPurpose,
    pub task_number: Option<u32>,
    /// Cancelled when the run is stopped.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentResponse {
    pub result_text: String,
    pub session_id: Option<String>,
    pub total_cost_usd: f64,
    pub duration_ms: u64,
    pub is_error: bool,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    #[error("agent call timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("agent call was interrupted")]
    Interrupted,
    #[error("agent exited with a recoverable error (code {code:?}): {message}")]
    SoftExit { code: Option<i32>, message: String },
    #[error("agent exited with code {code}: {stderr}")]
    HardExit { code: i32, stderr: String },
    #[error("agent executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("agent produced no result")]
    NoResult,
    #[error("failed to spawn agent: {0}")]
    Spawn(String),
    #[error("agent stream could not be decoded: {0}")]
    Protocol(String),
}

impl Retryable for AgentError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Timeout(_) | AgentError::Interrupted | AgentError::SoftExit { .. }
        )
    }
}

/// Sink receiving every decoded message of an in-flight call.
pub type MessageSink<'a> = &'a (dyn Fn(&AgentMessage) + Send + Sync);

#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Run one call to completion, streaming messages to `on_message`.
    async fn execute(
        &self,
        request: AgentRequest,
        on_message: MessageSink<'_>,
    ) -> Result<AgentResponse, AgentError>;

    /// Cancel the in-flight call, if any. Later calls still run.
    fn interrupt(&self);

    /// Cancel the in-flight call and refuse further calls.
    fn terminate(&self);

    fn is_running(&self) -> bool;
}

/// Drives the `claude` CLI in print mode with stream-json output.
pub struct ClaudeCliClient {
    settings: AgentSettings,
    current: Mutex<Option<CancellationToken>>,
    terminated: AtomicBool,
}

impl ClaudeCliClient {
    pub fn new(settings: AgentSettings) -> Self {
        Self {
            settings,
            current: Mutex::new(None),
            terminated: AtomicBool::new(false),
        }
    }

    fn build_command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.settings.command);
        cmd.arg("-p")
            .args(["--output-format", "stream-json", "--verbose"])
            .args(["--permission-mode", request.permission_mode.as_cli_arg()]);
        if let Some(session) = &request.session_id {
            cmd.args(["--resume", session]);
        }
        cmd.args(&self.settings.extra_args);
        cmd.current_dir(&request.workdir);
        cmd
    }

    async fn run(
        &self,
        request: AgentRequest,
        cancel: &CancellationToken,
        on_message: MessageSink<'_>,
    ) -> Result<AgentResponse, AgentError> {
        let cmd = self.build_command(&request);
        let timeout = request.timeout.unwrap_or(DEFAULT_CALL_TIMEOUT);

        let mut session_id: Option<String> = None;
        let mut result: Option<ResultMessage> = None;
        let mut decode_error: Option<String> = None;

        let output = run_command_streaming(
            cmd,
            Some(request.prompt.as_bytes()),
            timeout,
            self.settings.output_limit_bytes,
            cancel,
            |line| match stream::parse_line(line) {
                Ok(Some(message)) => {
                    if session_id.is_none() {
                        session_id = message.session_id().map(str::to_string);
                    }
                    if let AgentMessage::Result(r) = &message {
                        result = Some(r.clone());
                    }
                    on_message(&message);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(err = %format!("{err:#}"), "undecodable agent output line");
                    decode_error.get_or_insert_with(|| format!("{err:#}"));
                }
            },
        )
        .await
        .map_err(|err| self.spawn_error(err))?;

        if output.timed_out {
            return Err(AgentError::Timeout(timeout));
        }
        if output.cancelled {
            return Err(AgentError::Interrupted);
        }

        if let Some(result) = result {
            debug!(
                subtype = %result.subtype,
                is_error = result.is_error,
                cost = result.total_cost_usd,
                "agent call finished"
            );
            return Ok(AgentResponse {
                result_text: result.result.unwrap_or_default(),
                session_id: result.session_id.or(session_id),
                total_cost_usd: result.total_cost_usd,
                duration_ms: result.duration_ms,
                is_error: result.is_error,
                usage: result.usage,
            });
        }

        if !output.status.success() {
            let stderr = format!(
                "{}{}",
                output.stderr_lossy(),
                output.stderr_truncated_notice("agent")
            );
            return Err(match output.status.code() {
                Some(1) | None => AgentError::SoftExit {
                    code: output.status.code(),
                    message: stderr,
                },
                Some(code) => AgentError::HardExit { code, stderr },
            });
        }

        Err(match decode_error {
            Some(err) => AgentError::Protocol(err),
            None => AgentError::NoResult,
        })
    }

    fn spawn_error(&self, err: anyhow::Error) -> AgentError {
        let not_found = err
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
        if not_found {
            AgentError::ExecutableNotFound(self.settings.command.clone())
        } else {
            AgentError::Spawn(format!("{err:#}"))
        }
    }
}

#[async_trait]
impl AgentClient for ClaudeCliClient {
    #[instrument(skip_all, fields(purpose = ?request.purpose, task = ?request.task_number))]
    async fn execute(
        &self,
        request: AgentRequest,
        on_message: MessageSink<'_>,
    ) -> Result<AgentResponse, AgentError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(AgentError::Interrupted);
        }
        let cancel = request.cancel.child_token();
        *self.current.lock() = Some(cancel.clone());
        info!(mode = request.permission_mode.as_cli_arg(), "starting agent call");
        let outcome = self.run(request, &cancel, on_message).await;
        *self.current.lock() = None;
        outcome
    }

    fn interrupt(&self) {
        if let Some(cancel) = self.current.lock().as_ref() {
            debug!("interrupting agent call");
            cancel.cancel();
        }
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.interrupt();
    }

    fn is_running(&self) -> bool {
        self.current.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(AgentError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(AgentError::Interrupted.is_retryable());
        assert!(
            AgentError::SoftExit {
                code: Some(1),
                message: String::new()
            }
            .is_retryable()
        );
        assert!(!AgentError::NoResult.is_retryable());
        assert!(!AgentError::ExecutableNotFound("claude".into()).is_retryable());
        assert!(
            !AgentError::HardExit {
                code: 2,
                stderr: String::new()
            }
            .is_retryable()
        );
    }

    #[test]
    fn parses_question_list_with_option_objects() {
        let input = json!({
            "questions": [{
                "question": "Which database?",
                "header": "Storage",
                "options": [{"label": "Postgres", "description": "server"}, "SQLite"],
                "multiSelect": true
            }]
        });
        let questions = parse_ask_user(&input);
        assert_eq!(
            questions,
            vec![QuestionSpec {
                question: "Which database?".into(),
                header: "Storage".into(),
                options: vec!["Postgres".into(), "SQLite".into()],
                multi_select: true,
            }]
        );
    }

    #[test]
    fn parses_single_freeform_question() {
        let questions = parse_ask_user(&json!({"question": "Anything else?"}));
        assert_eq!(questions.len(), 1);
        assert!(questions[0].options.is_empty());
        assert!(!questions[0].multi_select);
    }

    #[test]
    fn drops_questions_without_text() {
        assert!(parse_ask_user(&json!({"questions": [{"header": "x"}]})).is_empty());
    }

    #[cfg(unix)]
    mod cli {
        use std::os::unix::fs::PermissionsExt;

        use super::*;

        fn script(dir: &std::path::Path, body: &str) -> String {
            let path = dir.join("fake-claude");
            std::fs::write(&path, format!("#!/bin/sh\ncat >/dev/null\n{body}\n")).expect("write");
            let mut perms = std::fs::metadata(&path).expect("meta").permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).expect("chmod");
            path.display().to_string()
        }

        fn request(dir: &std::path::Path) -> AgentRequest {
            AgentRequest {
                prompt: "hello".into(),
                workdir: dir.to_path_buf(),
                permission_mode: PermissionMode::ReadOnly,
                session_id: None,
                timeout: Some(Duration::from_secs(10)),
                purpose: CallPurpose::PlanGeneration,
                task_number: None,
                cancel: CancellationToken::new(),
            }
        }

        fn client(command: String) -> ClaudeCliClient {
            ClaudeCliClient::new(AgentSettings {
                command,
                ..AgentSettings::default()
            })
        }

        #[tokio::test]
        async fn returns_result_message_and_streams_messages() {
            let dir = tempfile::tempdir().expect("tempdir");
            let command = script(
                dir.path(),
                r#"echo '{"type":"system","subtype":"init","session_id":"abc"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}'
echo '{"type":"result","subtype":"success","is_error":false,"result":"done","total_cost_usd":0.5,"duration_ms":10}'"#,
            );
            let seen = Mutex::new(Vec::new());
            let sink = |m: &AgentMessage| seen.lock().push(m.clone());
            let response = client(command)
                .execute(request(dir.path()), &sink)
                .await
                .expect("execute");
            assert_eq!(response.result_text, "done");
            assert_eq!(response.session_id.as_deref(), Some("abc"));
            assert_eq!(response.total_cost_usd, 0.5);
            assert_eq!(seen.lock().len(), 3);
        }

        #[tokio::test]
        async fn exit_code_one_is_soft() {
            let dir = tempfile::tempdir().expect("tempdir");
            let command = script(dir.path(), "echo boom >&2\nexit 1");
            let err = client(command)
                .execute(request(dir.path()), &|_| {})
                .await
                .unwrap_err();
            assert!(matches!(err, AgentError::SoftExit { code: Some(1), .. }));
        }

        #[tokio::test]
        async fn other_exit_codes_are_hard() {
            let dir = tempfile::tempdir().expect("tempdir");
            let command = script(dir.path(), "exit 3");
            let err = client(command)
                .execute(request(dir.path()), &|_| {})
                .await
                .unwrap_err();
            assert!(matches!(err, AgentError::HardExit { code: 3, .. }));
        }

        #[tokio::test]
        async fn clean_exit_without_result_is_no_result() {
            let dir = tempfile::tempdir().expect("tempdir");
            let command = script(dir.path(), "exit 0");
            let err = client(command)
                .execute(request(dir.path()), &|_| {})
                .await
                .unwrap_err();
            assert_eq!(err, AgentError::NoResult);
        }

        #[tokio::test]
        async fn missing_binary_is_not_found() {
            let dir = tempfile::tempdir().expect("tempdir");
            let err = client("devloop-missing-agent-binary".into())
                .execute(request(dir.path()), &|_| {})
                .await
                .unwrap_err();
            assert!(matches!(err, AgentError::ExecutableNotFound(_)));
        }

        #[tokio::test]
        async fn cancelled_request_is_interrupted() {
            let dir = tempfile::tempdir().expect("tempdir");
            let command = script(dir.path(), "sleep 5");
            let req = request(dir.path());
            req.cancel.cancel();
            let err = client(command).execute(req, &|_| {}).await.unwrap_err();
            assert_eq!(err, AgentError::Interrupted);
        }
    }
}
