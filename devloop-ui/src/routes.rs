//! HTTP route handlers for the workspace and engine control API.

use std::path::PathBuf;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use devloop::core::types::FailureResponse;
use devloop::engine::context::ExecutionContext;
use devloop::engine::{EngineError, ExecutionEngine};
use devloop::workspace::{WorkspaceError, WorkspaceId, WorkspaceSummary};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/workspaces", get(list_workspaces).post(create_workspace))
        .route("/workspaces/{id}", delete(close_workspace))
        .route("/workspaces/{id}/select", post(select_workspace))
        .route("/workspaces/{id}/context", get(get_context))
        .route("/workspaces/{id}/start", post(start))
        .route("/workspaces/{id}/start-with-plan", post(start_with_plan))
        .route("/workspaces/{id}/pause", post(pause))
        .route("/workspaces/{id}/resume", post(resume))
        .route("/workspaces/{id}/stop", post(stop))
        .route("/workspaces/{id}/answer", post(answer))
        .route("/workspaces/{id}/task-failure", post(task_failure))
}

/// Error body returned as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<WorkspaceError> for ApiError {
    fn from(err: WorkspaceError) -> Self {
        let status = match err {
            WorkspaceError::NotFound(_) => StatusCode::NOT_FOUND,
            WorkspaceError::Isolation(_) | WorkspaceError::Removal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match err {
            EngineError::AlreadyRunning(_)
            | EngineError::NotPaused
            | EngineError::NoSessionId
            | EngineError::NoPendingTaskFailure => StatusCode::CONFLICT,
            EngineError::MissingTargetPath
            | EngineError::EmptyFeatureDescription
            | EngineError::NoExistingPlan
            | EngineError::PlanLoad(_) => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn health() -> &'static str {
    "ok"
}

/// GET /api/workspaces - every open workspace in creation order.
async fn list_workspaces(State(state): State<AppState>) -> Json<Vec<WorkspaceSummary>> {
    Json(state.coordinator.list().await)
}

#[derive(Debug, Default, Deserialize)]
struct CreateWorkspace {
    target_path: Option<PathBuf>,
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct Created {
    id: WorkspaceId,
}

/// POST /api/workspaces - open a workspace and start relaying its events.
async fn create_workspace(
    State(state): State<AppState>,
    Json(body): Json<CreateWorkspace>,
) -> ApiResult<(StatusCode, Json<Created>)> {
    let id = state.coordinator.create(body.target_path, body.name).await?;
    let engine = state.coordinator.engine(id).await?;
    state.forward_events(id, &engine);
    info!(%id, "workspace opened");
    Ok((StatusCode::CREATED, Json(Created { id })))
}

/// DELETE /api/workspaces/{id} - stop the run and discard the workspace.
async fn close_workspace(
    State(state): State<AppState>,
    Path(id): Path<WorkspaceId>,
) -> ApiResult<StatusCode> {
    if let Err(err) = state.coordinator.close(id).await {
        warn!(%id, error = %err, "workspace close failed");
        return Err(err.into());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn select_workspace(
    State(state): State<AppState>,
    Path(id): Path<WorkspaceId>,
) -> ApiResult<StatusCode> {
    state.coordinator.select(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/workspaces/{id}/context - full snapshot of the engine's context.
async fn get_context(
    State(state): State<AppState>,
    Path(id): Path<WorkspaceId>,
) -> ApiResult<Json<ExecutionContext>> {
    Ok(Json(engine(&state, id).await?.snapshot()))
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    feature_description: String,
}

async fn start(
    State(state): State<AppState>,
    Path(id): Path<WorkspaceId>,
    Json(body): Json<StartRequest>,
) -> ApiResult<StatusCode> {
    let engine = engine(&state, id).await?;
    engine.set_feature_description(body.feature_description)?;
    engine.start()?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Default, Deserialize)]
struct StartWithPlanRequest {
    /// Plan file; the configured plan path under the target when omitted.
    plan_path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct PlanLoaded {
    task_count: usize,
}

async fn start_with_plan(
    State(state): State<AppState>,
    Path(id): Path<WorkspaceId>,
    Json(body): Json<StartWithPlanRequest>,
) -> ApiResult<(StatusCode, Json<PlanLoaded>)> {
    let engine = engine(&state, id).await?;
    let task_count = engine.load_existing_plan(body.plan_path)?;
    engine.start_with_existing_plan()?;
    Ok((StatusCode::ACCEPTED, Json(PlanLoaded { task_count })))
}

/// Whether a control request changed anything.
#[derive(Debug, Serialize)]
struct Changed {
    changed: bool,
}

async fn pause(
    State(state): State<AppState>,
    Path(id): Path<WorkspaceId>,
) -> ApiResult<Json<Changed>> {
    let changed = engine(&state, id).await?.pause();
    Ok(Json(Changed { changed }))
}

async fn resume(
    State(state): State<AppState>,
    Path(id): Path<WorkspaceId>,
) -> ApiResult<StatusCode> {
    engine(&state, id).await?.resume()?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop(
    State(state): State<AppState>,
    Path(id): Path<WorkspaceId>,
) -> ApiResult<Json<Changed>> {
    let changed = engine(&state, id).await?.stop();
    Ok(Json(Changed { changed }))
}

#[derive(Debug, Deserialize)]
struct AnswerRequest {
    answer: String,
}

async fn answer(
    State(state): State<AppState>,
    Path(id): Path<WorkspaceId>,
    Json(body): Json<AnswerRequest>,
) -> ApiResult<StatusCode> {
    engine(&state, id).await?.answer_question(body.answer)?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct TaskFailureRequest {
    response: FailureResponse,
}

async fn task_failure(
    State(state): State<AppState>,
    Path(id): Path<WorkspaceId>,
    Json(body): Json<TaskFailureRequest>,
) -> ApiResult<StatusCode> {
    engine(&state, id)
        .await?
        .handle_task_failure_response(body.response)?;
    Ok(StatusCode::ACCEPTED)
}

async fn engine(state: &AppState, id: WorkspaceId) -> ApiResult<ExecutionEngine> {
    Ok(state.coordinator.engine(id).await?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use devloop::core::types::{CallPurpose, Phase};
    use devloop::engine::Collaborators;
    use devloop::io::config::DevloopConfig;
    use devloop::io::plan_store::MarkdownPlanParser;
    use devloop::test_support::{
        FakeIsolation, RecordingVersionControl, ScriptedAgent, ScriptedGateRunner, question,
    };
    use devloop::workspace::{EngineFactory, WorkspaceCoordinator};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    struct TestApp {
        state: AppState,
        agent: Arc<ScriptedAgent>,
        dir: tempfile::TempDir,
    }

    impl TestApp {
        fn new() -> Self {
            let agent = ScriptedAgent::new();
            let shared = Arc::clone(&agent);
            let factory: EngineFactory = Arc::new(move |prefs| {
                let collaborators = Collaborators {
                    agent: shared.clone(),
                    version_control: RecordingVersionControl::new(),
                    plan_parser: Arc::new(MarkdownPlanParser),
                    gates: ScriptedGateRunner::new(),
                };
                ExecutionEngine::new(prefs, collaborators)
            });
            let mut config = DevloopConfig::default();
            config.retry.initial_delay_ms = 0;
            config.retry.max_delay_ms = 0;
            let coordinator =
                WorkspaceCoordinator::new(Arc::new(config), FakeIsolation::new(), factory);
            Self {
                state: AppState::new(Arc::new(coordinator)),
                agent,
                dir: tempfile::tempdir().expect("tempdir"),
            }
        }

        async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let app = api_router().with_state(self.state.clone());
            let body = match body {
                Some(value) => Body::from(value.to_string()),
                None => Body::empty(),
            };
            let request = Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(body)
                .expect("request");
            let response = app.oneshot(request).await.expect("response");
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX)
                .await
                .expect("body");
            let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, value)
        }

        async fn open(&self) -> WorkspaceId {
            let target = self.dir.path().join("app");
            std::fs::create_dir_all(&target).expect("mkdir");
            let (status, body) = self
                .send("POST", "/workspaces", Some(json!({ "target_path": target })))
                .await;
            assert_eq!(status, StatusCode::CREATED);
            serde_json::from_value(body["id"].clone()).expect("id")
        }
    }

    #[tokio::test]
    async fn health_is_ok() {
        let app = TestApp::new();
        let response = api_router()
            .with_state(app.state.clone())
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_then_list_marks_first_workspace_active() {
        let app = TestApp::new();
        let id = app.open().await;

        let (status, body) = app.send("GET", "/workspaces", None).await;
        assert_eq!(status, StatusCode::OK);
        let list = body.as_array().expect("array");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["id"], json!(id));
        assert_eq!(list[0]["active"], json!(true));
        assert_eq!(list[0]["isolated"], json!(false));
    }

    #[tokio::test]
    async fn unknown_workspace_is_not_found() {
        let app = TestApp::new();
        let missing = uuid::Uuid::new_v4();
        let (status, body) = app
            .send("GET", &format!("/workspaces/{missing}/context"), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().expect("message").contains("not found"));

        let (status, _) = app.send("DELETE", &format!("/workspaces/{missing}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn start_runs_to_completion_and_rejects_restart() {
        let app = TestApp::new();
        let id = app.open().await;
        app.agent.hold(CallPurpose::Implementation);

        let uri = format!("/workspaces/{id}/start");
        let (status, _) = app
            .send("POST", &uri, Some(json!({ "feature_description": "Dark mode" })))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        app.agent.wait_until_held().await;

        let (status, body) = app
            .send("POST", &uri, Some(json!({ "feature_description": "Again" })))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().expect("message").contains("already"));

        app.agent.release();
        let engine = app.state.coordinator.engine(id).await.expect("engine");
        assert_eq!(engine.settled().await, Phase::Completed);

        let (status, body) = app
            .send("GET", &format!("/workspaces/{id}/context"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["feature_description"], json!("Dark mode"));
        assert_eq!(body["phase"], serde_json::to_value(Phase::Completed).expect("phase"));
    }

    #[tokio::test]
    async fn empty_feature_is_a_bad_request() {
        let app = TestApp::new();
        let id = app.open().await;
        let (status, _) = app
            .send(
                "POST",
                &format!("/workspaces/{id}/start"),
                Some(json!({ "feature_description": "  " })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_plan_is_a_bad_request() {
        let app = TestApp::new();
        let id = app.open().await;
        let (status, _) = app
            .send("POST", &format!("/workspaces/{id}/start-with-plan"), Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn answer_resumes_a_waiting_run() {
        let app = TestApp::new();
        let id = app.open().await;
        app.agent
            .ask(CallPurpose::Interview, vec![question("Which theme?")]);

        app.send(
            "POST",
            &format!("/workspaces/{id}/start"),
            Some(json!({ "feature_description": "Dark mode" })),
        )
        .await;
        let engine = app.state.coordinator.engine(id).await.expect("engine");
        assert_eq!(engine.settled().await, Phase::WaitingForUser);

        let (status, _) = app
            .send(
                "POST",
                &format!("/workspaces/{id}/answer"),
                Some(json!({ "answer": "Solarized" })),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(engine.settled().await, Phase::Completed);
    }

    #[tokio::test]
    async fn control_requests_report_conflicts() {
        let app = TestApp::new();
        let id = app.open().await;

        let (status, body) = app.send("POST", &format!("/workspaces/{id}/pause"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], json!(false));

        let (status, _) = app.send("POST", &format!("/workspaces/{id}/resume"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = app
            .send(
                "POST",
                &format!("/workspaces/{id}/task-failure"),
                Some(json!({ "response": "skip" })),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = app.send("POST", &format!("/workspaces/{id}/stop"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], json!(false));
    }

    #[tokio::test]
    async fn close_removes_the_workspace() {
        let app = TestApp::new();
        let id = app.open().await;
        let (status, _) = app.send("DELETE", &format!("/workspaces/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, body) = app.send("GET", "/workspaces", None).await;
        assert_eq!(body, json!([]));
    }
}
