//! Registry of independent workspaces, one engine each.
//!
//! Engines share nothing but the read-mostly preferences. A workspace whose
//! target is already open elsewhere gets an isolated copy of the directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::core::types::Phase;
use crate::engine::{Collaborators, ExecutionEngine};
use crate::io::config::DevloopConfig;
use crate::io::isolation::{GitWorktreeIsolation, WorkspaceInfo, WorkspaceIsolation};

pub type WorkspaceId = Uuid;

/// Builds the engine for a new workspace.
pub type EngineFactory = Arc<dyn Fn(Arc<DevloopConfig>) -> ExecutionEngine + Send + Sync>;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspace {0} not found")]
    NotFound(WorkspaceId),
    #[error("failed to provision an isolated copy: {0:#}")]
    Isolation(anyhow::Error),
    #[error("failed to remove isolated copy: {0:#}")]
    Removal(anyhow::Error),
}

pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    /// Path the caller asked for.
    pub target_path: Option<PathBuf>,
    pub workspace_info: Option<WorkspaceInfo>,
    pub engine: ExecutionEngine,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    /// Directory the engine actually works in.
    pub fn effective_path(&self) -> Option<&Path> {
        match &self.workspace_info {
            Some(info) => Some(info.isolated_path.as_path()),
            None => self.target_path.as_deref(),
        }
    }
}

/// Serializable view of a workspace for drivers.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceSummary {
    pub id: WorkspaceId,
    pub name: String,
    pub target_path: Option<PathBuf>,
    pub effective_path: Option<PathBuf>,
    pub isolated: bool,
    pub phase: Phase,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Registry {
    /// Creation order.
    workspaces: Vec<Workspace>,
    active: Option<WorkspaceId>,
}

impl Registry {
    fn position(&self, id: WorkspaceId) -> Result<usize, WorkspaceError> {
        self.workspaces
            .iter()
            .position(|ws| ws.id == id)
            .ok_or(WorkspaceError::NotFound(id))
    }

    fn get(&self, id: WorkspaceId) -> Result<&Workspace, WorkspaceError> {
        Ok(&self.workspaces[self.position(id)?])
    }

    fn is_open(&self, path: &Path) -> bool {
        let wanted = normalize(path);
        self.workspaces
            .iter()
            .filter_map(Workspace::effective_path)
            .any(|open| normalize(open) == wanted)
    }
}

pub struct WorkspaceCoordinator {
    preferences: Arc<DevloopConfig>,
    isolation: Arc<dyn WorkspaceIsolation>,
    factory: EngineFactory,
    // Held across isolation calls so two creations cannot both claim a path.
    registry: Mutex<Registry>,
}

impl WorkspaceCoordinator {
    pub fn new(
        preferences: Arc<DevloopConfig>,
        isolation: Arc<dyn WorkspaceIsolation>,
        factory: EngineFactory,
    ) -> Self {
        Self {
            preferences,
            isolation,
            factory,
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Claude CLI engines with git worktree isolation.
    pub fn production(preferences: Arc<DevloopConfig>) -> Self {
        let factory: EngineFactory = Arc::new(|prefs: Arc<DevloopConfig>| {
            let collaborators = Collaborators::production(&prefs);
            ExecutionEngine::new(prefs, collaborators)
        });
        Self::new(preferences, Arc::new(GitWorktreeIsolation), factory)
    }

    pub fn preferences(&self) -> &Arc<DevloopConfig> {
        &self.preferences
    }

    /// Open a workspace, isolating `target` when another workspace already uses it.
    ///
    /// The first workspace opened becomes the active one.
    #[instrument(skip(self))]
    pub async fn create(
        &self,
        target: Option<PathBuf>,
        name: Option<String>,
    ) -> Result<WorkspaceId, WorkspaceError> {
        let mut registry = self.registry.lock().await;
        let workspace_info = match &target {
            Some(path) if registry.is_open(path) => {
                let info = self
                    .isolation
                    .create_isolated_copy(path)
                    .await
                    .map_err(WorkspaceError::Isolation)?;
                info!(
                    original = %path.display(),
                    isolated = %info.isolated_path.display(),
                    branch = %info.branch,
                    "target already open; using isolated copy"
                );
                Some(info)
            }
            _ => None,
        };

        let engine = (self.factory)(Arc::clone(&self.preferences));
        let id = Uuid::new_v4();
        let name = name.unwrap_or_else(|| default_name(target.as_deref(), registry.workspaces.len()));
        let workspace = Workspace {
            id,
            name,
            target_path: target,
            workspace_info,
            engine,
            created_at: Utc::now(),
        };
        workspace.engine.bind_workspace(
            workspace.effective_path().map(Path::to_path_buf),
            workspace.workspace_info.clone(),
        );
        registry.workspaces.push(workspace);
        registry.active.get_or_insert(id);
        Ok(id)
    }

    /// Stop the workspace's run, remove its isolated copy, and discard it.
    ///
    /// A failed removal leaves the workspace open so the close can be retried.
    #[instrument(skip(self))]
    pub async fn close(&self, id: WorkspaceId) -> Result<(), WorkspaceError> {
        // Settle outside the registry lock; other workspaces stay usable meanwhile.
        let engine = self.engine(id).await?;
        engine.stop();
        engine.settled().await;

        let mut registry = self.registry.lock().await;
        let idx = registry.position(id)?;
        // A start that slipped in while settling is stopped again.
        if engine.stop() {
            engine.settled().await;
        }

        if let Some(info) = registry.workspaces[idx].workspace_info.clone() {
            self.isolation
                .remove_isolated_copy(&info)
                .await
                .map_err(WorkspaceError::Removal)?;
        }

        let workspace = registry.workspaces.remove(idx);
        workspace.engine.terminate();
        if registry.active == Some(id) {
            registry.active = registry.workspaces.first().map(|ws| ws.id);
        }
        info!(%id, "workspace closed");
        Ok(())
    }

    pub async fn select(&self, id: WorkspaceId) -> Result<(), WorkspaceError> {
        let mut registry = self.registry.lock().await;
        registry.position(id)?;
        registry.active = Some(id);
        Ok(())
    }

    pub async fn active(&self) -> Option<WorkspaceId> {
        self.registry.lock().await.active
    }

    pub async fn engine(&self, id: WorkspaceId) -> Result<ExecutionEngine, WorkspaceError> {
        Ok(self.registry.lock().await.get(id)?.engine.clone())
    }

    pub async fn workspace_info(
        &self,
        id: WorkspaceId,
    ) -> Result<Option<WorkspaceInfo>, WorkspaceError> {
        Ok(self.registry.lock().await.get(id)?.workspace_info.clone())
    }

    pub async fn list(&self) -> Vec<WorkspaceSummary> {
        let registry = self.registry.lock().await;
        registry
            .workspaces
            .iter()
            .map(|ws| WorkspaceSummary {
                id: ws.id,
                name: ws.name.clone(),
                target_path: ws.target_path.clone(),
                effective_path: ws.effective_path().map(Path::to_path_buf),
                isolated: ws.workspace_info.is_some(),
                phase: ws.engine.phase(),
                active: registry.active == Some(ws.id),
                created_at: ws.created_at,
            })
            .collect()
    }

    /// Remove isolated copies of `original` that no open workspace holds,
    /// e.g. left behind by a crash. Returns the removed copies.
    #[instrument(skip(self))]
    pub async fn prune_orphans(&self, original: &Path) -> Result<Vec<WorkspaceInfo>, WorkspaceError> {
        let registry = self.registry.lock().await;
        let copies = self
            .isolation
            .list_isolated_copies(original)
            .await
            .map_err(WorkspaceError::Isolation)?;
        let mut removed = Vec::new();
        for copy in copies {
            let held = registry.workspaces.iter().any(|ws| {
                ws.workspace_info
                    .as_ref()
                    .is_some_and(|info| info.worktree_path == copy.worktree_path)
            });
            if held {
                continue;
            }
            match self.isolation.remove_isolated_copy(&copy).await {
                Ok(()) => removed.push(copy),
                Err(err) => {
                    warn!(path = %copy.worktree_path.display(), error = %err, "orphaned copy not removed");
                    return Err(WorkspaceError::Removal(err));
                }
            }
        }
        Ok(removed)
    }
}

fn normalize(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn default_name(target: Option<&Path>, index: usize) -> String {
    target
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("Workspace {}", index + 1))
}
