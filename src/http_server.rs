//! HTTP front end using Axum.
//!
//! Every route lives under `/users/:user_id` and answers with at least
//! `{ "success": bool, "message": string }`.

use crate::installer::remove_environment;
use crate::interpreter::InterpreterPreference;
use crate::registry::{ConflictPolicy, StartError, StartOptions, Started, StopError, StopOutcome};
use crate::state::AppState;
use crate::upload::{UploadError, UploadReply};
use crate::workspace::{read_log_tail, UserId, WorkspaceError};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// How often abandoned uploads are swept.
const UPLOAD_CLEANUP_INTERVAL_SECS: u64 = 60;

// Request/Response types
#[derive(Serialize)]
struct ActionReply {
    success: bool,
    message: String,
}

impl ActionReply {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }
}

#[derive(Deserialize)]
struct ManifestRequest {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    skip: bool,
}

#[derive(Deserialize)]
struct FileRequest {
    filename: String,
    content_base64: String,
}

#[derive(Deserialize)]
struct EntryPointRequest {
    filename: String,
}

#[derive(Deserialize)]
struct EditRequest {
    content_base64: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RunRequest {
    replace: bool,
    shared_interpreter: bool,
}

#[derive(Serialize)]
struct RunReply {
    success: bool,
    message: String,
    run: Started,
}

#[derive(Serialize)]
struct StopReply {
    success: bool,
    message: String,
    outcome: StopOutcome,
}

#[derive(Serialize)]
struct StatusReply {
    success: bool,
    message: String,
    running: Vec<String>,
}

#[derive(Serialize)]
struct ScriptInfo {
    name: String,
    running: bool,
}

#[derive(Serialize)]
struct ScriptsReply {
    success: bool,
    message: String,
    scripts: Vec<ScriptInfo>,
}

#[derive(Deserialize)]
struct LogQuery {
    tail_bytes: Option<u64>,
}

#[derive(Serialize)]
struct LogReply {
    success: bool,
    message: String,
    log_file: PathBuf,
    content: String,
}

/// Error rendered as `{ success: false, message }` with a status code.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ActionReply {
            success: false,
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

impl From<WorkspaceError> for ApiError {
    fn from(e: WorkspaceError) -> Self {
        let status = match e {
            WorkspaceError::InvalidUserId(_) | WorkspaceError::InvalidFilename(_) => {
                StatusCode::BAD_REQUEST
            }
            WorkspaceError::NotFound(_) => StatusCode::NOT_FOUND,
            WorkspaceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<UploadError> for ApiError {
    fn from(e: UploadError) -> Self {
        match e {
            UploadError::NoSession => Self::new(StatusCode::CONFLICT, e.to_string()),
            UploadError::Workspace(e) => e.into(),
        }
    }
}

impl From<StartError> for ApiError {
    fn from(e: StartError) -> Self {
        let status = match e {
            StartError::ScriptNotFound(_) => StatusCode::NOT_FOUND,
            StartError::AlreadyRunning(_) => StatusCode::CONFLICT,
            StartError::Workspace(inner) => return inner.into(),
            StartError::Spawn { .. } | StartError::Replace(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<StopError> for ApiError {
    fn from(e: StopError) -> Self {
        let status = match e {
            StopError::NotRunning(_) => StatusCode::NOT_FOUND,
            StopError::KillFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Parse the path's user id and check it against the allow-list.
fn authorize(state: &AppState, raw: &str) -> Result<UserId, ApiError> {
    let user = UserId::parse(raw)?;
    if !state.config.is_allowed(&user) {
        warn!(%user, "Rejected user outside allow-list");
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "You are not allowed to use this service",
        ));
    }
    Ok(user)
}

fn decode_base64(content: &str) -> Result<Vec<u8>, ApiError> {
    base64::engine::general_purpose::STANDARD
        .decode(content)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("Invalid base64 content: {e}")))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Upload session
        .route("/users/:user_id/upload", post(upload_begin))
        .route("/users/:user_id/upload/manifest", post(upload_manifest))
        .route("/users/:user_id/upload/files", post(upload_file))
        .route("/users/:user_id/upload/done", post(upload_done))
        .route("/users/:user_id/upload/entry-point", post(upload_entry_point))
        .route("/users/:user_id/upload/cancel", post(upload_cancel))
        // Scripts
        .route("/users/:user_id/scripts", get(list_scripts))
        .route("/users/:user_id/scripts/:name", put(edit_script))
        .route("/users/:user_id/scripts/:name", delete(delete_script))
        .route("/users/:user_id/scripts/:name/run", post(run_script))
        .route("/users/:user_id/scripts/:name/stop", post(stop_script))
        .route("/users/:user_id/scripts/:name/logs", get(script_logs))
        .route("/users/:user_id/status", get(status))
        .route("/users/:user_id/env", delete(delete_env))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server until Ctrl-C or SIGTERM, then stop every script.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    if let Some(every) = state.config.sweep_interval() {
        crate::registry::spawn_sweep_task(state.registry.clone(), every);
    }
    crate::upload::spawn_cleanup_task(
        state.uploads.clone(),
        Duration::from_secs(UPLOAD_CLEANUP_INTERVAL_SECS),
    );

    let app = router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, stopping running scripts");
    state.registry.stop_all().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn upload_begin(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<UploadReply> {
    let user = authorize(&state, &user_id)?;
    Ok(Json(state.uploads.begin(&user).await))
}

async fn upload_manifest(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<ManifestRequest>,
) -> ApiResult<UploadReply> {
    let user = authorize(&state, &user_id)?;
    let manifest = if req.skip { None } else { Some(req.content.unwrap_or_default()) };
    let reply = state.uploads.submit_manifest(&user, manifest.as_deref()).await?;
    Ok(Json(reply))
}

async fn upload_file(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<FileRequest>,
) -> ApiResult<UploadReply> {
    let user = authorize(&state, &user_id)?;
    let content = decode_base64(&req.content_base64)?;
    let reply = state.uploads.submit_file(&user, &req.filename, &content).await?;
    Ok(Json(reply))
}

async fn upload_done(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<UploadReply> {
    let user = authorize(&state, &user_id)?;
    Ok(Json(state.uploads.finish_files(&user).await?))
}

async fn upload_entry_point(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<EntryPointRequest>,
) -> ApiResult<UploadReply> {
    let user = authorize(&state, &user_id)?;
    let reply = state.uploads.select_entry_point(&user, &req.filename).await?;
    Ok(Json(reply))
}

async fn upload_cancel(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<UploadReply> {
    let user = authorize(&state, &user_id)?;
    Ok(Json(state.uploads.cancel(&user).await?))
}

async fn list_scripts(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<ScriptsReply> {
    let user = authorize(&state, &user_id)?;
    let names = state.workspaces.list_scripts(&user)?;
    let running = state.registry.list_running(&user).await;
    let scripts: Vec<ScriptInfo> = names
        .into_iter()
        .map(|name| ScriptInfo {
            running: running.contains(&name),
            name,
        })
        .collect();
    Ok(Json(ScriptsReply {
        success: true,
        message: format!("{} file(s)", scripts.len()),
        scripts,
    }))
}

async fn edit_script(
    State(state): State<AppState>,
    Path((user_id, name)): Path<(String, String)>,
    Json(req): Json<EditRequest>,
) -> ApiResult<ActionReply> {
    let user = authorize(&state, &user_id)?;
    let content = decode_base64(&req.content_base64)?;
    state.workspaces.write_script(&user, &name, &content)?;
    info!(%user, script = %name, bytes = content.len(), "Script edited");
    Ok(ActionReply::ok(format!("File {name} saved.")))
}

async fn delete_script(
    State(state): State<AppState>,
    Path((user_id, name)): Path<(String, String)>,
) -> ApiResult<ActionReply> {
    let user = authorize(&state, &user_id)?;
    let deleted = state
        .registry
        .when_idle(&user, &name, || state.workspaces.delete_script(&user, &name))
        .await;
    let Some(deleted) = deleted else {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("Stop {name} before deleting it"),
        ));
    };
    deleted?;
    info!(%user, script = %name, "Script deleted");
    Ok(ActionReply::ok(format!("File {name} deleted.")))
}

async fn run_script(
    State(state): State<AppState>,
    Path((user_id, name)): Path<(String, String)>,
    Json(req): Json<RunRequest>,
) -> ApiResult<RunReply> {
    let user = authorize(&state, &user_id)?;
    let options = StartOptions {
        conflict: if req.replace {
            ConflictPolicy::Replace
        } else {
            ConflictPolicy::Reject
        },
        interpreter: if req.shared_interpreter {
            InterpreterPreference::Shared
        } else {
            InterpreterPreference::Auto
        },
    };
    let run = state.registry.start(&user, &name, options).await?;
    let message = match run.replaced {
        Some(_) => format!(
            "Script {name} restarted using {}!",
            run.interpreter.describe()
        ),
        None => format!(
            "Script {name} started successfully using {}!",
            run.interpreter.describe()
        ),
    };
    Ok(Json(RunReply {
        success: true,
        message,
        run,
    }))
}

async fn stop_script(
    State(state): State<AppState>,
    Path((user_id, name)): Path<(String, String)>,
) -> ApiResult<StopReply> {
    let user = authorize(&state, &user_id)?;
    let outcome = state.registry.stop(&user, &name).await?;
    let message = match outcome {
        StopOutcome::Stopped => format!("Script {name} stopped successfully!"),
        StopOutcome::ForceKilled => format!("Script {name} force-killed!"),
    };
    Ok(Json(StopReply {
        success: true,
        message,
        outcome,
    }))
}

async fn status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<StatusReply> {
    let user = authorize(&state, &user_id)?;
    let running = state.registry.list_running(&user).await;
    let message = if running.is_empty() {
        "No scripts running".to_string()
    } else {
        format!("{} script(s) running", running.len())
    };
    Ok(Json(StatusReply {
        success: true,
        message,
        running,
    }))
}

async fn script_logs(
    State(state): State<AppState>,
    Path((user_id, name)): Path<(String, String)>,
    Query(query): Query<LogQuery>,
) -> ApiResult<LogReply> {
    let user = authorize(&state, &user_id)?;
    let ws = state.workspaces.workspace_of(&user)?;
    let log_file = ws.latest_log(&name)?.ok_or_else(|| {
        ApiError::new(StatusCode::NOT_FOUND, format!("No logs found for {name}"))
    })?;
    let limit = query
        .tail_bytes
        .unwrap_or(state.config.log_tail_bytes)
        .min(state.config.log_tail_bytes);
    let content = read_log_tail(&log_file, limit).map_err(WorkspaceError::from)?;
    Ok(Json(LogReply {
        success: true,
        message: format!("Latest log for {name}"),
        log_file,
        content,
    }))
}

async fn delete_env(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<ActionReply> {
    let user = authorize(&state, &user_id)?;
    if !state.registry.list_running(&user).await.is_empty() {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "Stop your running scripts before removing the environment",
        ));
    }
    let ws = state.workspaces.workspace_of(&user)?;
    let removed = remove_environment(&ws).map_err(WorkspaceError::from)?;
    let message = if removed {
        "Virtual environment removed."
    } else {
        "No virtual environment to remove."
    };
    Ok(ActionReply::ok(message))
}
