//! Configuration stored in `devloop.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::budget::BudgetConfiguration;
use crate::core::classifier::TestConfiguration;
use crate::core::failure::AutonomousConfiguration;
use crate::core::log::DEFAULT_LOG_CAPACITY;
use crate::core::retry::RetryConfiguration;
use crate::core::types::PermissionMode;

pub const DEFAULT_CONFIG_FILE: &str = "devloop.toml";

/// Devloop configuration (TOML).
///
/// Edited by humans; every field has a default so partial files load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DevloopConfig {
    /// Plan file name, relative to the target directory.
    pub plan_file: String,
    pub agent: AgentSettings,
    pub retry: RetryConfiguration,
    pub timeouts: TimeoutConfiguration,
    pub autonomous: AutonomousConfiguration,
    pub budget: BudgetConfiguration,
    pub tests: TestConfiguration,
    pub logs: LogSettings,
}

impl Default for DevloopConfig {
    fn default() -> Self {
        Self {
            plan_file: "PLAN.md".to_string(),
            agent: AgentSettings::default(),
            retry: RetryConfiguration::default(),
            timeouts: TimeoutConfiguration::default(),
            autonomous: AutonomousConfiguration::default(),
            budget: BudgetConfiguration::default(),
            tests: TestConfiguration::default(),
            logs: LogSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentSettings {
    /// Agent executable (looked up on `PATH`).
    pub command: String,
    /// Extra arguments appended to every call (e.g. `["--model", "opus"]`).
    pub extra_args: Vec<String>,
    /// Bound on captured agent stderr.
    pub output_limit_bytes: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            extra_args: Vec::new(),
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfiguration {
    /// Read-only ("plan" mode) calls.
    pub read_only_secs: u64,
    /// Mutating ("acceptEdits") calls.
    pub accept_edits_secs: u64,
}

impl Default for TimeoutConfiguration {
    fn default() -> Self {
        Self {
            read_only_secs: 10 * 60,
            accept_edits_secs: 30 * 60,
        }
    }
}

impl TimeoutConfiguration {
    pub fn for_mode(&self, mode: PermissionMode) -> Duration {
        match mode {
            PermissionMode::ReadOnly => Duration::from_secs(self.read_only_secs),
            PermissionMode::AcceptEdits | PermissionMode::Default => {
                Duration::from_secs(self.accept_edits_secs)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogSettings {
    /// Maximum retained entries per log buffer.
    pub capacity: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl DevloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.plan_file.trim().is_empty() {
            return Err(anyhow!("plan_file must not be empty"));
        }
        if self.agent.command.trim().is_empty() {
            return Err(anyhow!("agent.command must not be empty"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be >= 1"));
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            return Err(anyhow!("retry.backoff_multiplier must be >= 1.0"));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(anyhow!("retry.max_delay_ms must be >= retry.initial_delay_ms"));
        }
        if self.timeouts.read_only_secs == 0 || self.timeouts.accept_edits_secs == 0 {
            return Err(anyhow!("timeouts must be > 0"));
        }
        if self.budget.window_tokens == 0 {
            return Err(anyhow!("budget.window_tokens must be > 0"));
        }
        if !(0.0..100.0).contains(&self.budget.low_budget_percent) {
            return Err(anyhow!("budget.low_budget_percent must be in [0, 100)"));
        }
        if self.autonomous.run_build_after_commit && is_blank(&self.autonomous.build_command) {
            return Err(anyhow!("autonomous.build_command must be a non-empty array"));
        }
        if self.autonomous.run_tests_after_commit && is_blank(&self.autonomous.test_command) {
            return Err(anyhow!("autonomous.test_command must be a non-empty array"));
        }
        if self.autonomous.gate_timeout_secs == 0 {
            return Err(anyhow!("autonomous.gate_timeout_secs must be > 0"));
        }
        if self.logs.capacity == 0 {
            return Err(anyhow!("logs.capacity must be > 0"));
        }
        Ok(())
    }
}

fn is_blank(command: &[String]) -> bool {
    command.first().is_none_or(|program| program.trim().is_empty())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DevloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<DevloopConfig> {
    if !path.exists() {
        let cfg = DevloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DevloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &DevloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::core::types::FailurePolicy;

    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, DevloopConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("devloop.toml");
        let mut cfg = DevloopConfig::default();
        cfg.autonomous.enabled = true;
        cfg.autonomous.failure_policy = FailurePolicy::RetryThenSkip;
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("devloop.toml");
        fs::write(
            &path,
            "plan_file = \"TASKS.md\"\n[autonomous]\nenabled = true\nfailure_policy = \"retry_then_stop\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.plan_file, "TASKS.md");
        assert_eq!(cfg.autonomous.failure_policy, FailurePolicy::RetryThenStop);
        assert_eq!(cfg.retry, RetryConfiguration::default());
    }

    #[test]
    fn rejects_zero_attempts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("devloop.toml");
        fs::write(&path, "[retry]\nmax_attempts = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("max_attempts"));
    }

    #[test]
    fn timeouts_follow_permission_mode() {
        let timeouts = TimeoutConfiguration {
            read_only_secs: 5,
            accept_edits_secs: 50,
        };
        assert_eq!(
            timeouts.for_mode(PermissionMode::ReadOnly),
            Duration::from_secs(5)
        );
        assert_eq!(
            timeouts.for_mode(PermissionMode::AcceptEdits),
            Duration::from_secs(50)
        );
    }
}
