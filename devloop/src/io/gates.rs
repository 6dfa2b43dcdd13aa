//! Build and test gates run after commits in autonomous mode.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::core::types::GateOutcome;
use crate::io::process::run_command_streaming;

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 16_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateKind {
    Build,
    Test,
}

impl GateKind {
    pub fn label(self) -> &'static str {
        match self {
            GateKind::Build => "build",
            GateKind::Test => "test",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateRequest {
    pub kind: GateKind,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateReport {
    pub outcome: GateOutcome,
    /// Last `output_limit_bytes` of combined output, for error messages.
    pub output_tail: String,
}

#[async_trait]
pub trait GateRunner: Send + Sync {
    async fn run(&self, request: &GateRequest) -> Result<GateReport>;
}

/// Runs the configured command as a child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandGateRunner;

#[async_trait]
impl GateRunner for CommandGateRunner {
    #[instrument(skip_all, fields(gate = request.kind.label()))]
    async fn run(&self, request: &GateRequest) -> Result<GateReport> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| anyhow!("{} gate command is empty", request.kind.label()))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);

        let mut stdout = String::new();
        let output = run_command_streaming(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
            &request.cancel,
            |line| {
                stdout.push_str(line);
                stdout.push('\n');
            },
        )
        .await?;

        let mut combined = stdout;
        combined.push_str(&output.stderr_lossy());
        if output.timed_out {
            combined.push_str(&format!(
                "\n[{} gate timed out after {}s]",
                request.kind.label(),
                request.timeout.as_secs()
            ));
        }

        let outcome = if output.status.success() && !output.timed_out && !output.cancelled {
            GateOutcome::Pass
        } else {
            GateOutcome::Fail
        };
        info!(?outcome, "gate finished");
        Ok(GateReport {
            outcome,
            output_tail: tail(&combined, request.output_limit_bytes).to_string(),
        })
    }
}

/// Suffix of `text` no longer than `limit` bytes, cut on a char boundary.
fn tail(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
