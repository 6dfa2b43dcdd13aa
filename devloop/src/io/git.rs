//! Git adapter: commits for the engine and worktree plumbing for isolation.
//!
//! A small, explicit wrapper around `git` subprocess calls. The async
//! [`VersionControl`] seam runs the blocking wrapper on the blocking pool.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use tracing::{debug, instrument};

/// Result of a commit request. Nothing to commit is not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    NothingToCommit,
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Stage everything under `directory` and commit it with `message`.
    async fn commit_all(&self, message: &str, directory: &Path) -> Result<CommitOutcome>;
}

/// [`VersionControl`] backed by the `git` CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitVersionControl;

#[async_trait]
impl VersionControl for GitVersionControl {
    async fn commit_all(&self, message: &str, directory: &Path) -> Result<CommitOutcome> {
        let git = Git::new(directory);
        let message = message.to_string();
        tokio::task::spawn_blocking(move || {
            git.add_all()?;
            if git.commit_staged(&message)? {
                Ok(CommitOutcome::Committed)
            } else {
                Ok(CommitOutcome::NothingToCommit)
            }
        })
        .await
        .context("join git commit task")?
    }
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeEntry {
    pub path: PathBuf,
    /// Short branch name (`refs/heads/` stripped); absent when detached.
    pub branch: Option<String>,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Absolute path of the repository root containing the workdir.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_checked(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    /// Add a worktree at `dest` on a new branch created from HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn worktree_add(&self, branch: &str, dest: &Path) -> Result<()> {
        let dest = dest.to_string_lossy();
        self.run_checked(&["worktree", "add", "-b", branch, &dest])?;
        Ok(())
    }

    #[instrument(skip_all)]
    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", "--force", &path])?;
        Ok(())
    }

    pub fn worktree_list(&self) -> Result<Vec<WorktreeEntry>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    /// Force-delete a local branch.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_worktree_list(out: &str) -> Vec<WorktreeEntry> {
    let mut entries = Vec::new();
    let mut current: Option<WorktreeEntry> = None;
    for line in out.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(done) = current.take() {
                entries.push(done);
            }
            current = Some(WorktreeEntry {
                path: PathBuf::from(path.trim()),
                branch: None,
            });
        } else if let Some(reference) = line.strip_prefix("branch ") {
            if let Some(entry) = current.as_mut() {
                let reference = reference.trim();
                let short = reference.strip_prefix("refs/heads/").unwrap_or(reference);
                entry.branch = Some(short.to_string());
            }
        }
    }
    entries.extend(current);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worktree_porcelain() {
        let out = "worktree /repo\nHEAD abc\nbranch refs/heads/main\n\n\
                   worktree /repo-devloop-x1\nHEAD def\nbranch refs/heads/devloop/20250101_120000_x1\n\n\
                   worktree /detached\nHEAD 123\ndetached\n";
        let entries = parse_worktree_list(out);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].branch.as_deref(), Some("main"));
        assert_eq!(entries[1].path, PathBuf::from("/repo-devloop-x1"));
        assert_eq!(
            entries[1].branch.as_deref(),
            Some("devloop/20250101_120000_x1")
        );
        assert_eq!(entries[2].branch, None);
    }

    fn init_repo(dir: &Path) -> Git {
        let git = Git::new(dir);
        git.run_checked(&["init", "-q"]).expect("init");
        git.run_checked(&["config", "user.email", "dev@example.com"])
            .expect("config email");
        git.run_checked(&["config", "user.name", "Dev"])
            .expect("config name");
        git
    }

    #[tokio::test]
    async fn commit_all_commits_then_reports_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_repo(temp.path());
        std::fs::write(temp.path().join("a.txt"), "a").expect("write");

        let vc = GitVersionControl;
        assert_eq!(
            vc.commit_all("first", temp.path()).await.expect("commit"),
            CommitOutcome::Committed
        );
        assert_eq!(
            vc.commit_all("second", temp.path()).await.expect("commit"),
            CommitOutcome::NothingToCommit
        );
    }

    #[tokio::test]
    async fn commit_outside_repo_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(GitVersionControl.commit_all("x", temp.path()).await.is_err());
    }
}
