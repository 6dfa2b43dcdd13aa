//! Workspace isolation via git worktrees.
//!
//! An isolated copy is a sibling worktree `<repo>-devloop-<suffix>` on branch
//! `devloop/<timestamp>_<suffix>`. The branch name carries the creation time
//! so copies left behind by a crash can be listed and cleaned up later.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::io::git::Git;

pub const BRANCH_PREFIX: &str = "devloop/";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Mapping between an original target path and its isolated copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub original_path: PathBuf,
    /// Effective path inside the copy (same relative location as the original).
    pub isolated_path: PathBuf,
    /// Root of the copy; what gets removed.
    pub worktree_path: PathBuf,
    /// Isolation identifier (the worktree branch).
    pub branch: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait WorkspaceIsolation: Send + Sync {
    async fn create_isolated_copy(&self, path: &Path) -> Result<WorkspaceInfo>;
    async fn remove_isolated_copy(&self, info: &WorkspaceInfo) -> Result<()>;
    async fn list_isolated_copies(&self, path: &Path) -> Result<Vec<WorkspaceInfo>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GitWorktreeIsolation;

#[async_trait]
impl WorkspaceIsolation for GitWorktreeIsolation {
    #[instrument(skip_all, fields(path = %path.display()))]
    async fn create_isolated_copy(&self, path: &Path) -> Result<WorkspaceInfo> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || create_worktree(&path))
            .await
            .context("join worktree create task")?
    }

    #[instrument(skip_all, fields(branch = %info.branch))]
    async fn remove_isolated_copy(&self, info: &WorkspaceInfo) -> Result<()> {
        let info = info.clone();
        tokio::task::spawn_blocking(move || remove_worktree(&info))
            .await
            .context("join worktree remove task")?
    }

    async fn list_isolated_copies(&self, path: &Path) -> Result<Vec<WorkspaceInfo>> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || list_worktrees(&path))
            .await
            .context("join worktree list task")?
    }
}

fn create_worktree(path: &Path) -> Result<WorkspaceInfo> {
    let original = path
        .canonicalize()
        .with_context(|| format!("resolve {}", path.display()))?;
    let git = Git::new(&original);
    let root = git.toplevel()?;
    let relative = original
        .strip_prefix(&root)
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("repository root has no name: {}", root.display()))?;
    let parent = root
        .parent()
        .ok_or_else(|| anyhow!("repository root has no parent: {}", root.display()))?;

    let created_at = Utc::now();
    let suffix = generate_short_id();
    let branch = build_branch_name(&created_at.format(TIMESTAMP_FORMAT).to_string(), &suffix);
    let worktree_path = parent.join(format!("{name}-devloop-{suffix}"));

    Git::new(&root).worktree_add(&branch, &worktree_path)?;
    info!(branch = %branch, dest = %worktree_path.display(), "created isolated copy");

    Ok(WorkspaceInfo {
        original_path: original,
        isolated_path: worktree_path.join(relative),
        worktree_path,
        branch,
        created_at,
    })
}

fn remove_worktree(info: &WorkspaceInfo) -> Result<()> {
    let git = Git::new(&info.original_path);
    if info.worktree_path.exists() {
        git.worktree_remove(&info.worktree_path)?;
    } else {
        debug!(path = %info.worktree_path.display(), "worktree already gone");
    }
    git.delete_branch(&info.branch)?;
    info!(branch = %info.branch, "removed isolated copy");
    Ok(())
}

fn list_worktrees(path: &Path) -> Result<Vec<WorkspaceInfo>> {
    let entries = Git::new(path).worktree_list()?;
    // Porcelain output lists the main worktree first.
    let Some(main) = entries.first().map(|e| e.path.clone()) else {
        return Ok(Vec::new());
    };
    Ok(entries
        .into_iter()
        .filter_map(|entry| {
            let branch = entry.branch?;
            let created_at = parse_branch_timestamp(&branch)?;
            Some(WorkspaceInfo {
                original_path: main.clone(),
                isolated_path: entry.path.clone(),
                worktree_path: entry.path,
                branch,
                created_at,
            })
        })
        .collect())
}

pub fn build_branch_name(timestamp: &str, suffix: &str) -> String {
    format!("{BRANCH_PREFIX}{timestamp}_{suffix}")
}

/// Recover the creation time from a `devloop/<timestamp>_<suffix>` branch.
pub fn parse_branch_timestamp(branch: &str) -> Option<DateTime<Utc>> {
    let rest = branch.strip_prefix(BRANCH_PREFIX)?;
    let (timestamp, _suffix) = rest.rsplit_once('_')?;
    NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}
