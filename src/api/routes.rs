//! HTTP route handlers.

use std::sync::Arc;

use axum::middleware;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{AuthMode, Config};
use crate::orchestrator::{Orchestrator, OrchestratorError, RunReceipt, TaskStatus};
use crate::task::{Task, TaskId};
use crate::tools::{ToolInfo, ToolResponse};

use super::auth;
use super::error::error_response;
use super::types::*;

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub orchestrator: Orchestrator,
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::start(&config).await?;
    let state = Arc::new(AppState {
        config: config.clone(),
        orchestrator,
    });
    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        auth = ?config.auth_mode(),
        "Server listening on {}",
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new().route("/api/health", get(health));

    let protected_routes = Router::new()
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/run", post(run_task))
        .route("/api/tasks/:id/approve", post(approve_task))
        .route("/api/tasks/:id/stop", post(stop_task))
        .route("/api/tasks/:id/artifacts", get(list_artifacts))
        .route("/api/tasks/:id/archive", get(download_archive))
        .route("/api/tools", get(list_tools))
        .route("/api/tools/:tool_id", post(invoke_tool))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wait for SIGINT/SIGTERM. Pipelines still running are recovered as
/// retryable failures on the next start.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let running = state.orchestrator.running();
    if running > 0 {
        tracing::warn!(running, "Shutting down with pipelines in flight");
    }
    tracing::info!("Graceful shutdown complete");
}

fn parse_id(raw: &str) -> ApiResult<TaskId> {
    raw.parse::<TaskId>()
        .map_err(|e| error_response(OrchestratorError::Task(e)))
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        dev_mode: state.config.dev_mode,
        auth_required: state.config.auth_mode() != AuthMode::Disabled,
        max_concurrent_tasks: state.config.max_concurrent_tasks,
    })
}

/// Create a new task.
async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let task = state
        .orchestrator
        .create_task(&req.target, req.base_url.as_deref(), req.budget.as_ref())
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// List all tasks, newest first.
async fn list_tasks(State(state): State<Arc<AppState>>) -> Json<Vec<Task>> {
    Json(state.orchestrator.list_tasks().await)
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskStatus>> {
    let id = parse_id(&id)?;
    let status = state.orchestrator.status(&id).await.map_err(error_response)?;
    Ok(Json(status))
}

/// Trigger the pipeline. Answers 202 when a run was started or queued.
async fn run_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<RunReceipt>)> {
    let id = parse_id(&id)?;
    let receipt = state.orchestrator.run_task(&id).await.map_err(error_response)?;
    let status = if receipt.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(receipt)))
}

async fn approve_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ApproveRequest>,
) -> ApiResult<Json<Task>> {
    let id = parse_id(&id)?;
    let task = state
        .orchestrator
        .approve(&id, &req.action, &req.approver, req.remark)
        .await
        .map_err(error_response)?;
    Ok(Json(task))
}

async fn stop_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    let id = parse_id(&id)?;
    let task = state.orchestrator.stop(&id).await.map_err(error_response)?;
    Ok(Json(task))
}

async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ArtifactListResponse>> {
    let id = parse_id(&id)?;
    let artifacts = state
        .orchestrator
        .list_artifacts(&id)
        .await
        .map_err(error_response)?;
    Ok(Json(ArtifactListResponse {
        task_id: id,
        artifacts,
    }))
}

/// Stream the evidence archive as `application/zip`.
async fn download_archive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id = parse_id(&id)?;
    let path = state.orchestrator.archive(&id).await.map_err(error_response)?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, format!("Archive not readable: {}", e)))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("artifacts_{}.zip", id));

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

async fn list_tools(State(state): State<Arc<AppState>>) -> Json<Vec<ToolInfo>> {
    Json(state.orchestrator.list_tools())
}

/// Run one tool ad hoc inside an existing task's evidence directory.
async fn invoke_tool(
    State(state): State<Arc<AppState>>,
    Path(tool_id): Path<String>,
    Json(req): Json<InvokeToolRequest>,
) -> ApiResult<Json<ToolResponse>> {
    let id = parse_id(&req.task_id)?;
    let response = state
        .orchestrator
        .invoke_tool(&id, &tool_id, &req.args)
        .await
        .map_err(error_response)?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testing::FakeRunner;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn spawn_server(dir: &std::path::Path, api_key: Option<&str>) -> std::net::SocketAddr {
        let config = Config {
            runs_dir: dir.join("runs"),
            api_key: api_key.map(str::to_string),
            dev_mode: api_key.is_none(),
            default_timeout: Duration::from_secs(30),
            ..Config::default()
        };
        let orchestrator = Orchestrator::with_runner(&config, Arc::new(FakeRunner::silent()))
            .await
            .unwrap();
        let app = router(Arc::new(AppState {
            config,
            orchestrator,
        }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    /// Minimal HTTP/1.1 exchange; returns the status code and body.
    async fn request(
        addr: std::net::SocketAddr,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: Option<&str>,
    ) -> (u16, String) {
        let mut raw = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n",
            method, path, addr
        );
        for (name, value) in headers {
            raw.push_str(&format!("{}: {}\r\n", name, value));
        }
        let body = body.unwrap_or("");
        if !body.is_empty() {
            raw.push_str("Content-Type: application/json\r\n");
        }
        raw.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response).into_owned();

        let status = response
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap();
        let body = response
            .split_once("\r\n\r\n")
            .map(|(_, b)| b.to_string())
            .unwrap_or_default();
        (status, body)
    }

    #[tokio::test]
    async fn test_api_key_is_enforced() {
        let dir = tempdir().unwrap();
        let addr = spawn_server(dir.path(), Some("s3cret")).await;

        let (status, _) = request(addr, "GET", "/api/health", &[], None).await;
        assert_eq!(status, 200);

        let (status, _) = request(addr, "GET", "/api/tasks", &[], None).await;
        assert_eq!(status, 401);

        let (status, _) = request(addr, "GET", "/api/tasks", &[("X-API-Key", "wrong!")], None).await;
        assert_eq!(status, 401);

        let (status, body) = request(addr, "GET", "/api/tasks", &[("X-API-Key", "s3cret")], None).await;
        assert_eq!(status, 200);
        assert!(body.contains("[]"));
    }

    #[tokio::test]
    async fn test_task_lifecycle_over_http() {
        let dir = tempdir().unwrap();
        let addr = spawn_server(dir.path(), None).await;

        let (status, body) = request(
            addr,
            "POST",
            "/api/tasks",
            &[],
            Some(r#"{"target":"127.0.0.1","budget":"{\"timeout_seconds\": 60}"}"#),
        )
        .await;
        assert_eq!(status, 201, "{}", body);
        let task: serde_json::Value = serde_json::from_str(&body).unwrap();
        let id = task["task_id"].as_str().unwrap();
        assert_eq!(task["budget"]["timeout_seconds"], 60);

        let (status, body) = request(addr, "GET", &format!("/api/tasks/{}", id), &[], None).await;
        assert_eq!(status, 200);
        assert!(body.contains("\"state\":\"created\""), "{}", body);

        let (status, _) = request(addr, "GET", &format!("/api/tasks/{}/archive", id), &[], None).await;
        assert_eq!(status, 404);

        let (status, _) = request(
            addr,
            "POST",
            &format!("/api/tasks/{}/approve", id),
            &[],
            Some(r#"{"action":"approve","approver":"alice"}"#),
        )
        .await;
        assert_eq!(status, 409);

        let (status, body) = request(addr, "GET", &format!("/api/tasks/{}/artifacts", id), &[], None).await;
        assert_eq!(status, 200);
        assert!(body.contains("scope.json"));
    }

    #[tokio::test]
    async fn test_input_errors_over_http() {
        let dir = tempdir().unwrap();
        let addr = spawn_server(dir.path(), None).await;

        let (status, _) = request(
            addr,
            "POST",
            "/api/tasks",
            &[],
            Some(r#"{"target":"a","budget":"{nope"}"#),
        )
        .await;
        assert_eq!(status, 422);

        let (status, _) = request(addr, "GET", "/api/tasks/t_ffffffff", &[], None).await;
        assert_eq!(status, 404);

        let (status, _) = request(addr, "GET", "/api/tasks/bad..id", &[], None).await;
        assert_eq!(status, 400);

        let (_, body) = request(addr, "POST", "/api/tasks", &[], Some(r#"{"target":"a"}"#)).await;
        let task: serde_json::Value = serde_json::from_str(&body).unwrap();
        let invoke = format!(r#"{{"task_id":{},"args":{{}}}}"#, task["task_id"]);

        let (status, body) = request(addr, "POST", "/api/tools/metasploit", &[], Some(&invoke)).await;
        assert_eq!(status, 400, "{}", body);
        assert!(body.contains("metasploit"));

        let (status, _) = request(
            addr,
            "POST",
            "/api/tools/nmap",
            &[],
            Some(r#"{"task_id":"t_ffffffff","args":{}}"#),
        )
        .await;
        assert_eq!(status, 404);

        let (status, body) = request(addr, "GET", "/api/tools", &[], None).await;
        assert_eq!(status, 200);
        assert!(body.contains("http_probe"));
    }
}
