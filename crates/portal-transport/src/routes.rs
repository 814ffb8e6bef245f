//! Collaborator HTTP routes: container files, skills and agent-server
//! resolution.
//!
//! File and skill routes run one-shot execs against the configured default
//! container. Errors are JSON bodies `{message, error}`.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use portal_exec::{FsError, RemoteFs};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::websocket::GatewayState;

/// Header naming the agent server a request is meant for.
pub const ACTIVE_SERVER_HEADER: &str = "x-active-server-url";

/// HTTP error with a JSON body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    #[serde(skip)]
    pub status: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiError {
    /// 400 with a message only.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            message: message.into(),
            error: None,
        }
    }

    /// 500 carrying the underlying error text.
    pub fn internal(message: impl Into<String>, error: &impl ToString) -> Self {
        Self {
            status: 500,
            message: message.into(),
            error: Some(error.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// Pick the agent-server base URL for a request: the header, then the
/// configured default.
#[must_use]
pub fn resolve_server_url(headers: &HeaderMap, fallback: &str) -> String {
    headers
        .get(ACTIVE_SERVER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// Routes served next to the terminal socket.
pub fn api_router() -> Router<GatewayState> {
    Router::new()
        .route("/api/server-url", get(server_url))
        .route("/api/fs/directory", get(list_directory))
        .route("/api/fs/content", get(read_content).post(write_content))
        .route("/api/fs/operations", post(operations))
        .route("/api/fs/upload", post(upload))
        .route("/api/skills/list", get(list_skills))
        .route("/api/skills/create", post(create_skill))
}

fn remote_fs(state: &GatewayState) -> Result<RemoteFs, ApiError> {
    let target = state
        .config
        .resolve_target(None)
        .map_err(|e| ApiError::internal("No container configured", &e))?;
    Ok(RemoteFs::new(state.runner.clone(), target))
}

async fn server_url(State(state): State<GatewayState>, headers: HeaderMap) -> Json<Value> {
    Json(json!({ "url": resolve_server_url(&headers, &state.config.agent_server_url) }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectoryQuery {
    path: Option<String>,
    show_hidden: Option<String>,
}

async fn list_directory(
    State(state): State<GatewayState>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Response, ApiError> {
    let fs = remote_fs(&state)?;
    let show_hidden = query.show_hidden.as_deref() == Some("true");
    let listing = fs
        .list_directory(query.path.as_deref(), show_hidden)
        .await
        .map_err(|e| fail("Failed to list files", &e))?;
    Ok(Json(listing).into_response())
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    path: Option<String>,
}

impl PathQuery {
    fn require(self, message: &str) -> Result<String, ApiError> {
        self.path
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ApiError::bad_request(message))
    }
}

async fn read_content(
    State(state): State<GatewayState>,
    Query(query): Query<PathQuery>,
) -> Result<String, ApiError> {
    let path = query.require("path is required")?;
    let fs = remote_fs(&state)?;
    fs.read_file(&path)
        .await
        .map_err(|e| fail("Failed to access file", &e))
}

#[derive(Debug, Deserialize)]
struct ContentBody {
    content: Option<String>,
}

async fn write_content(
    State(state): State<GatewayState>,
    Query(query): Query<PathQuery>,
    Json(body): Json<ContentBody>,
) -> Result<Json<Value>, ApiError> {
    let path = query.require("path is required")?;
    let content = body
        .content
        .ok_or_else(|| ApiError::bad_request("content is required"))?;
    let fs = remote_fs(&state)?;
    fs.write_file(&path, content.as_bytes())
        .await
        .map_err(|e| fail("Failed to access file", &e))?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FsAction {
    Rename,
    Delete,
    Mkdir,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct OperationBody {
    action: Option<FsAction>,
    path: Option<String>,
    destination: Option<String>,
}

async fn operations(
    State(state): State<GatewayState>,
    Json(body): Json<OperationBody>,
) -> Result<Json<Value>, ApiError> {
    let path = body
        .path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::bad_request("path is required"))?;
    let fs = remote_fs(&state)?;

    let result = match body.action {
        Some(FsAction::Rename) => {
            let destination = body
                .destination
                .filter(|d| !d.is_empty())
                .ok_or_else(|| ApiError::bad_request("destination is required for rename"))?;
            fs.rename(&path, &destination).await
        }
        Some(FsAction::Delete) => fs.delete(&path).await,
        Some(FsAction::Mkdir) => fs.mkdir(&path).await,
        Some(FsAction::Unknown) | None => return Err(ApiError::bad_request("Invalid action")),
    };

    match result {
        Ok(()) => Ok(Json(json!({ "success": true }))),
        Err(FsError::ProtectedPath(_)) => Err(ApiError::bad_request("Cannot delete protected paths")),
        Err(e) => Err(fail("Operation failed", &e)),
    }
}

async fn upload(
    State(state): State<GatewayState>,
    Query(query): Query<PathQuery>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let path = query.require("path query param is required")?;
    let fs = remote_fs(&state)?;
    fs.write_file(&path, &body)
        .await
        .map_err(|e| fail("Upload failed", &e))?;
    Ok(Json(json!({ "success": true })))
}

async fn list_skills(State(state): State<GatewayState>) -> Result<Json<Value>, ApiError> {
    let fs = remote_fs(&state)?;
    let skills = fs
        .list_skills()
        .await
        .map_err(|e| fail("Failed to list skills", &e))?;
    Ok(Json(json!({ "skills": skills })))
}

#[derive(Debug, Deserialize)]
struct CreateSkillBody {
    name: Option<String>,
    content: Option<String>,
}

async fn create_skill(
    State(state): State<GatewayState>,
    Json(body): Json<CreateSkillBody>,
) -> Result<Json<Value>, ApiError> {
    let (Some(name), Some(content)) = (
        body.name.filter(|n| !n.is_empty()),
        body.content.filter(|c| !c.is_empty()),
    ) else {
        return Err(ApiError::bad_request("Name and content are required"));
    };
    let fs = remote_fs(&state)?;
    match fs.create_skill(&name, &content).await {
        Ok(path) => Ok(Json(json!({ "success": true, "path": path }))),
        Err(FsError::InvalidName(_)) => Err(ApiError::bad_request("Invalid skill name")),
        Err(e) => Err(fail("Failed to create skill", &e)),
    }
}

fn fail(message: &str, error: &FsError) -> ApiError {
    tracing::error!("{message}: {error}");
    ApiError::internal(message, error)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::Request,
    };
    use portal_core::{ControlPlane, ExecSpec, GatewayConfig, NegotiationError, RawStream, ResizeError};
    use portal_exec::{CommandRunner, ExecError, ExecOutput};
    use tower::ServiceExt;

    use super::*;

    /// Records argv and answers `ls` with a fixed listing.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CommandRunner for Recorder {
        async fn run(&self, _target: &str, command: Vec<String>) -> Result<ExecOutput, ExecError> {
            self.calls.lock().unwrap().push(command.clone());
            let stdout = match command.first().map(String::as_str) {
                Some("ls") => "src/\nREADME.md\n".to_string(),
                Some("cat") => "hello".to_string(),
                _ => String::new(),
            };
            Ok(ExecOutput {
                combined: stdout.clone(),
                stdout,
                exit_code: Some(0),
                ..ExecOutput::default()
            })
        }
    }

    struct NoControl;

    #[async_trait]
    impl ControlPlane for NoControl {
        async fn create_exec(&self, _: &str, _: &ExecSpec) -> Result<String, NegotiationError> {
            Err(NegotiationError::MalformedResponse("unused".into()))
        }
        async fn start_exec(&self, _: &str, _: bool) -> Result<RawStream, NegotiationError> {
            Err(NegotiationError::MalformedResponse("unused".into()))
        }
        async fn resize_exec(&self, _: &str, _: u16, _: u16) -> Result<(), ResizeError> {
            Ok(())
        }
    }

    fn app(container: Option<&str>) -> (Router, Arc<Recorder>) {
        let runner = Arc::new(Recorder::default());
        let config = GatewayConfig {
            default_container: container.map(String::from),
            agent_server_url: "http://agent:4000".into(),
            ..GatewayConfig::default()
        };
        let state = GatewayState::new(config, Arc::new(NoControl), runner.clone());
        (api_router().with_state(state), runner)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_resolve_server_url_prefers_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(resolve_server_url(&headers, "http://fallback"), "http://fallback");
        headers.insert(ACTIVE_SERVER_HEADER, "http://active:5000".parse().unwrap());
        assert_eq!(resolve_server_url(&headers, "http://fallback"), "http://active:5000");
    }

    #[tokio::test]
    async fn test_server_url_route_uses_configured_default() {
        let (app, _) = app(Some("box"));
        let response = app
            .oneshot(Request::get("/api/server-url").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["url"], "http://agent:4000");
    }

    #[tokio::test]
    async fn test_directory_listing() {
        let (app, runner) = app(Some("box"));
        let response = app
            .oneshot(
                Request::get("/api/fs/directory?path=/workspace&showHidden=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["path"], "/workspace");
        assert_eq!(body["items"][0]["name"], "src");
        assert_eq!(body["items"][0]["isDirectory"], true);
        assert_eq!(body["items"][1]["path"], "/workspace/README.md");
        assert!(runner.calls.lock().unwrap()[0].contains(&"-a".to_string()));
    }

    #[tokio::test]
    async fn test_read_content_requires_path() {
        let (app, _) = app(Some("box"));
        let response = app
            .oneshot(Request::get("/api/fs/content").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["message"], "path is required");
    }

    #[tokio::test]
    async fn test_read_content_returns_text() {
        let (app, _) = app(Some("box"));
        let response = app
            .oneshot(
                Request::get("/api/fs/content?path=/workspace/a.txt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn test_delete_protected_path_rejected() {
        let (app, runner) = app(Some("box"));
        let response = app
            .oneshot(post_json(
                "/api/fs/operations",
                &json!({ "action": "delete", "path": "/workspace" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_needs_destination() {
        let (app, _) = app(Some("box"));
        let response = app
            .oneshot(post_json(
                "/api/fs/operations",
                &json!({ "action": "rename", "path": "/workspace/a" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["message"],
            "destination is required for rename"
        );
    }

    #[tokio::test]
    async fn test_unknown_action_rejected() {
        let (app, _) = app(Some("box"));
        let response = app
            .oneshot(post_json(
                "/api/fs/operations",
                &json!({ "action": "chmod", "path": "/workspace/a" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["message"], "Invalid action");
    }

    #[tokio::test]
    async fn test_mkdir_runs_in_container() {
        let (app, runner) = app(Some("box"));
        let response = app
            .oneshot(post_json(
                "/api/fs/operations",
                &json!({ "action": "mkdir", "path": "/workspace/new" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            runner.calls.lock().unwrap()[0],
            vec!["mkdir", "-p", "/workspace/new"]
        );
    }

    #[tokio::test]
    async fn test_create_skill_requires_fields() {
        let (app, _) = app(Some("box"));
        let response = app
            .oneshot(post_json("/api/skills/create", &json!({ "name": "x" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_container_is_server_error() {
        let (app, _) = app(None);
        let response = app
            .oneshot(Request::get("/api/skills/list").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(
            body["error"],
            "Container ID is required. Set OPENCODE_CONTAINER env variable."
        );
    }
}
