//! Shared application state for the UI server.

use std::sync::Arc;

use devloop::engine::ExecutionEngine;
use devloop::events::EngineEvent;
use devloop::workspace::{WorkspaceCoordinator, WorkspaceId};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

/// An engine event tagged with the workspace it came from.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceEvent {
    pub workspace_id: WorkspaceId,
    #[serde(flatten)]
    pub event: EngineEvent,
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<WorkspaceCoordinator>,
    /// Fan-in of every workspace's engine events, for SSE clients.
    pub event_tx: Arc<broadcast::Sender<WorkspaceEvent>>,
}

impl AppState {
    pub fn new(coordinator: Arc<WorkspaceCoordinator>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            coordinator,
            event_tx: Arc::new(event_tx),
        }
    }

    /// Relay `engine`'s events onto the shared channel until the engine is dropped.
    pub fn forward_events(&self, workspace_id: WorkspaceId, engine: &ExecutionEngine) {
        let mut rx = engine.subscribe();
        let tx = Arc::clone(&self.event_tx);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        // No subscribers is fine; clients read the snapshot on connect.
                        let _ = tx.send(WorkspaceEvent {
                            workspace_id,
                            event,
                        });
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(%workspace_id, skipped = n, "event forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(%workspace_id, "event forwarder finished");
        });
    }
}
