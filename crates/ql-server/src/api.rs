//! HTTP API handlers.

use crate::types::*;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use ql_common::{Error, SupportCode};
use ql_diagnostics::Disposition;
use ql_supervisor::{AppConfig, ScheduleSpec, Scheduler, StartError, StartFailure, StartRequest, Supervisor};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::error;

const SUGGEST_BASE: u16 = 5174;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub scheduler: Arc<Scheduler>,
    /// Serializes read-modify-write cycles on the config document.
    pub config_lock: Arc<tokio::sync::Mutex<()>>,
}

impl AppState {
    pub fn new(supervisor: Arc<Supervisor>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            supervisor,
            scheduler,
            config_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

/// Build the API router with permissive CORS, so other local dashboards
/// can call this API.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/history/:id", get(get_history))
        .route("/api/apps", get(get_apps).post(add_app))
        .route("/api/apps/migrate", post(migrate_apps))
        .route("/api/apps/:id", put(update_app).delete(delete_app))
        .route("/api/ports/check/:port", get(check_port))
        .route("/api/ports/suggest", get(suggest_port))
        .route("/api/ports/reserve", post(reserve_port))
        .route("/api/ports/reserve/:port", delete(unreserve_port))
        .route("/api/check-deps", post(check_deps))
        .route("/api/install", post(start_install))
        .route("/api/install/:id", get(get_install))
        .route("/api/start", post(start_app))
        .route("/api/stop", post(stop_app))
        .route("/api/schedules", get(get_schedules))
        .route("/api/schedule/:id", get(get_schedule).put(update_schedule))
        .route("/api/schedule/:id/enable", post(enable_schedule))
        .route("/api/schedule/:id/run", post(run_schedule))
        .route("/api/schedule/:id/status", get(schedule_status))
        .route("/api/todos", get(get_todos))
        .route("/api/triage", post(apply_triage))
        .route("/api/resolutions", get(get_resolutions).post(post_resolution))
        .route("/api/icon", get(get_icon))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// API error type mapped onto HTTP statuses.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
    Start(Box<StartFailure>),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::AppNotFound { .. } => ApiError::NotFound(e.to_string()),
            Error::NotRunning { .. }
            | Error::AlreadyRunning { .. }
            | Error::InvalidConfig { .. }
            | Error::ScheduleDisabled { .. }
            | Error::SyncInProgress { .. }
            | Error::InvalidSchedule { .. }
            | Error::PortInUse { .. }
            | Error::PathNotFound { .. }
            | Error::MissingManifest { .. }
            | Error::MissingDependencies { .. }
            | Error::FileNotFound { .. } => ApiError::BadRequest(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": message })),
            )
                .into_response(),
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": message })),
            )
                .into_response(),
            ApiError::Internal(message) => {
                error!("API error: {}", message);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": message,
                        "supportCode": SupportCode::Server,
                    })),
                )
                    .into_response()
            }
            ApiError::Start(failure) => {
                let status = StatusCode::from_u16(failure.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let mut body = serde_json::to_value(&*failure).unwrap_or_else(|_| json!({}));
                body["success"] = json!(false);
                (status, Json(body)).into_response()
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ===== Status & history =====

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.status_snapshot().await)
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let (attempts, last_error) = state.supervisor.history.for_app(&id);
    Json(json!({ "attempts": attempts, "lastError": last_error }))
}

// ===== App CRUD =====

async fn get_apps(State(state): State<AppState>) -> impl IntoResponse {
    let doc = state.supervisor.config.snapshot();
    Json(json!({ "apps": doc.apps, "reservedPorts": doc.reserved_ports }))
}

async fn add_app(
    State(state): State<AppState>,
    Json(app): Json<AppConfig>,
) -> ApiResult<Response> {
    let _guard = state.config_lock.lock().await;
    let doc = state.supervisor.config.snapshot();

    if doc.app(&app.id).is_some() {
        return Err(ApiError::BadRequest(format!("app '{}' already exists", app.id)));
    }
    if app.port > 0 && !doc.check_port(app.port, None).available {
        let suggested = doc.suggest_port(SUGGEST_BASE).ok();
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": format!("Port {} is already assigned or reserved", app.port),
                "suggestedPort": suggested,
            })),
        )
            .into_response());
    }

    let saved = state
        .supervisor
        .config
        .mutate(|doc| {
            doc.apps.push(app.clone());
            Ok(app.clone())
        })
        .await?;

    state.scheduler.reinstall(&saved.id);
    Ok((StatusCode::CREATED, Json(saved)).into_response())
}

async fn update_app(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<AppUpdate>,
) -> ApiResult<Json<AppConfig>> {
    let _guard = state.config_lock.lock().await;
    let doc = state.supervisor.config.snapshot();
    if doc.app(&id).is_none() {
        return Err(ApiError::NotFound(format!("app '{}' not found", id)));
    }

    // A port change is re-validated against the registry.
    if let Some(port) = update.port {
        if port > 0 && !doc.check_port(port, Some(&id)).available {
            return Err(ApiError::BadRequest(format!(
                "Port {} is already assigned or reserved",
                port
            )));
        }
    }
    if let Some(expr) = &update.schedule {
        ScheduleSpec::parse(expr).map_err(ApiError::from)?;
    }

    let updated = state
        .supervisor
        .config
        .mutate(move |doc| {
            let app = doc
                .apps
                .iter_mut()
                .find(|app| app.id == id)
                .ok_or_else(|| Error::app_not_found(&id))?;
            apply_app_update(app, update);
            Ok(app.clone())
        })
        .await?;

    state.scheduler.reinstall(&updated.id);
    Ok(Json(updated))
}

fn apply_app_update(app: &mut AppConfig, update: AppUpdate) {
    if let Some(v) = update.name {
        app.name = v;
    }
    if let Some(v) = update.description {
        app.description = v;
    }
    if let Some(v) = update.port {
        app.port = v;
    }
    if let Some(v) = update.path {
        app.path = v;
    }
    if let Some(v) = update.command {
        app.command = v;
    }
    if let Some(v) = update.icon {
        app.icon = Some(v);
    }
    if let Some(v) = update.icon_path {
        app.icon_path = Some(v);
    }
    if let Some(v) = update.colors {
        app.colors = Some(v);
    }
    if let Some(v) = update.health_check_url {
        app.health_check_url = Some(v);
    }
    if let Some(v) = update.startup_timeout {
        app.startup_timeout = v;
    }
    if let Some(v) = update.auto_restart {
        app.auto_restart = v;
    }
    if let Some(v) = update.max_restart_attempts {
        app.max_restart_attempts = v;
    }
    if let Some(v) = update.schedule {
        app.schedule = Some(v);
    }
    if let Some(v) = update.schedule_enabled {
        app.schedule_enabled = v;
    }
    if let Some(v) = update.run_if_missed {
        app.run_if_missed = v;
    }
    if let Some(v) = update.schedule_command {
        app.schedule_command = Some(v);
    }
}

async fn delete_app(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let _guard = state.config_lock.lock().await;
    state.scheduler.cancel(&id);
    state
        .supervisor
        .config
        .mutate(|doc| {
            let before = doc.apps.len();
            doc.apps.retain(|app| app.id != id);
            if doc.apps.len() == before {
                return Err(Error::app_not_found(&id));
            }
            Ok(())
        })
        .await?;
    Ok(Json(json!({ "deleted": id })))
}

async fn migrate_apps(
    State(state): State<AppState>,
    Json(req): Json<MigrateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let _guard = state.config_lock.lock().await;

    let results = state
        .supervisor
        .config
        .mutate(|doc| {
            let mut results = Vec::new();
            for app in req.apps {
                if doc.app(&app.id).is_some() {
                    results.push(json!({
                        "id": app.id,
                        "status": "skipped",
                        "reason": "id already exists",
                    }));
                    continue;
                }
                if app.port > 0 && !doc.check_port(app.port, None).available {
                    results.push(json!({
                        "id": app.id,
                        "status": "skipped",
                        "reason": format!("port {} unavailable", app.port),
                    }));
                    continue;
                }
                results.push(json!({ "id": app.id, "status": "imported" }));
                doc.apps.push(app);
            }
            Ok(results)
        })
        .await?;

    state.scheduler.install_all();
    Ok(Json(json!({ "results": results })))
}

// ===== Port broker =====

#[derive(Debug, serde::Deserialize)]
struct CheckQuery {
    #[serde(default)]
    exclude: Option<String>,
}

async fn check_port(
    State(state): State<AppState>,
    Path(port): Path<u16>,
    Query(query): Query<CheckQuery>,
) -> impl IntoResponse {
    let doc = state.supervisor.config.snapshot();
    let registry = doc.check_port(port, query.exclude.as_deref());
    let system_in_use = ql_process::is_port_in_use(port);
    let available = registry.available && !system_in_use;
    let suggested = if available {
        None
    } else {
        doc.suggest_port(SUGGEST_BASE).ok()
    };

    Json(json!({
        "port": port,
        "registryAvailable": registry.available,
        "registryReason": registry.reason,
        "registryUsedBy": registry.used_by,
        "systemInUse": system_in_use,
        "available": available,
        "suggestedPort": suggested,
    }))
}

#[derive(Debug, serde::Deserialize)]
struct SuggestQuery {
    #[serde(default)]
    base: Option<u16>,
}

async fn suggest_port(
    State(state): State<AppState>,
    Query(query): Query<SuggestQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let doc = state.supervisor.config.snapshot();
    let port = doc
        .suggest_port(query.base.unwrap_or(SUGGEST_BASE))
        .map_err(ApiError::from)?;
    Ok(Json(json!({ "port": port })))
}

async fn reserve_port(
    State(state): State<AppState>,
    Json(req): Json<ReserveRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let _guard = state.config_lock.lock().await;
    state
        .supervisor
        .config
        .mutate(|doc| {
            if !doc.check_port(req.port, None).available {
                return Err(Error::invalid_config(format!(
                    "port {} is already assigned or reserved",
                    req.port
                )));
            }
            doc.reserved_ports.insert(req.port, req.description.clone());
            Ok(())
        })
        .await?;
    Ok(Json(json!({ "reserved": req.port })))
}

async fn unreserve_port(
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> ApiResult<Json<serde_json::Value>> {
    if port == ql_supervisor::SUPERVISOR_PORT {
        return Err(ApiError::BadRequest(
            "the supervisor's own reservation cannot be removed".to_string(),
        ));
    }

    let _guard = state.config_lock.lock().await;
    state
        .supervisor
        .config
        .mutate(|doc| {
            if doc.reserved_ports.remove(&port).is_none() {
                return Err(Error::invalid_config(format!("port {} is not reserved", port)));
            }
            Ok(())
        })
        .await?;
    Ok(Json(json!({ "removed": port })))
}

// ===== Dependencies & installs =====

async fn check_deps(Json(req): Json<CheckDepsRequest>) -> impl IntoResponse {
    let dir = std::path::Path::new(&req.path);
    let has_package_json = ql_supervisor::installs::has_manifest(dir);
    let needs_install = has_package_json && !ql_supervisor::installs::has_node_modules(dir);
    Json(json!({
        "needsInstall": needs_install,
        "hasPackageJson": has_package_json,
        "packageManager": ql_supervisor::installs::detect_package_manager(dir),
    }))
}

async fn start_install(
    State(state): State<AppState>,
    Json(req): Json<InstallRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let app = state
        .supervisor
        .config
        .app(&req.id)
        .ok_or_else(|| ApiError::NotFound(format!("app '{}' not found", req.id)))?;

    let pm = state
        .supervisor
        .installs
        .start(&req.id, std::path::Path::new(&app.path))
        .map_err(ApiError::from)?;
    Ok(Json(json!({ "status": "started", "packageManager": pm })))
}

async fn get_install(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let job = state
        .supervisor
        .installs
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("no install job for '{}'", id)))?;

    let logs: Vec<_> = job.logs.iter().rev().take(20).rev().cloned().collect();
    let duration_ms = job
        .finished
        .map(|finished| (finished - job.started).num_milliseconds());
    Ok(Json(json!({
        "status": job.status,
        "packageManager": job.package_manager,
        "logs": logs,
        "exitCode": job.exit_code,
        "durationMs": duration_ms,
    })))
}

// ===== Lifecycle =====

async fn start_app(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Response {
    match state.supervisor.start_app(req).await {
        Ok(success) => Json(success).into_response(),
        Err(StartError::Rejected(e)) => ApiError::from(e).into_response(),
        Err(StartError::Failure(failure)) => ApiError::Start(failure).into_response(),
    }
}

async fn stop_app(
    State(state): State<AppState>,
    Json(req): Json<StopRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.supervisor.stop_app(&req.id).map_err(ApiError::from)?;
    Ok(Json(json!({ "stopped": req.id })))
}

// ===== Schedules =====

async fn get_schedules(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "schedules": state.scheduler.all_info() }))
}

async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ql_supervisor::ScheduleInfo>> {
    Ok(Json(state.scheduler.info(&id).map_err(ApiError::from)?))
}

async fn update_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<ScheduleUpdate>,
) -> ApiResult<Json<ql_supervisor::ScheduleInfo>> {
    if let Some(expr) = &update.schedule {
        ScheduleSpec::parse(expr).map_err(ApiError::from)?;
    }

    let _guard = state.config_lock.lock().await;
    state
        .supervisor
        .config
        .mutate(|doc| {
            let app = doc
                .apps
                .iter_mut()
                .find(|app| app.id == id)
                .ok_or_else(|| Error::app_not_found(&id))?;
            if let Some(v) = update.schedule {
                app.schedule = Some(v);
            }
            if let Some(v) = update.schedule_enabled {
                app.schedule_enabled = v;
            }
            if let Some(v) = update.run_if_missed {
                app.run_if_missed = v;
            }
            if let Some(v) = update.schedule_command {
                app.schedule_command = Some(v);
            }
            Ok(())
        })
        .await?;

    state.scheduler.reinstall(&id);
    Ok(Json(state.scheduler.info(&id).map_err(ApiError::from)?))
}

async fn enable_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<EnableScheduleRequest>,
) -> ApiResult<Json<ql_supervisor::ScheduleInfo>> {
    let _guard = state.config_lock.lock().await;
    state
        .supervisor
        .config
        .mutate(|doc| {
            let app = doc
                .apps
                .iter_mut()
                .find(|app| app.id == id)
                .ok_or_else(|| Error::app_not_found(&id))?;
            if app.schedule.is_none() && req.enabled {
                return Err(Error::invalid_config(format!(
                    "app '{}' has no schedule to enable",
                    id
                )));
            }
            app.schedule_enabled = req.enabled;
            Ok(())
        })
        .await?;

    state.scheduler.reinstall(&id);
    Ok(Json(state.scheduler.info(&id).map_err(ApiError::from)?))
}

async fn run_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ql_supervisor::ScheduleRunStarted>> {
    let run = state
        .supervisor
        .execute_scheduled_app(&id, true)
        .map_err(ApiError::from)?;
    Ok(Json(run))
}

async fn schedule_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if state.supervisor.config.app(&id).is_none() {
        return Err(ApiError::NotFound(format!("app '{}' not found", id)));
    }

    let run = state.scheduler.run_status(&id);
    let state_info = state.supervisor.schedule_state.get(&id);
    Ok(Json(json!({
        "id": id,
        "status": run.as_ref().map(|(status, _)| status),
        "recentLogs": run.map(|(_, logs)| logs).unwrap_or_default(),
        "state": state_info,
    })))
}

// ===== Diagnostics =====

async fn get_todos(State(state): State<AppState>) -> ApiResult<Json<ql_diagnostics::TodoInventory>> {
    state
        .supervisor
        .diagnostics
        .todos()
        .map(Json)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

async fn apply_triage(
    State(state): State<AppState>,
    Json(req): Json<TriageRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state
        .supervisor
        .diagnostics
        .triage(&req.items)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({
        "parking": outcome.parking,
        "implement": outcome.implement,
        "dontdo": outcome.dontdo,
    })))
}

async fn get_resolutions(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let resolutions = state
        .supervisor
        .diagnostics
        .read_resolutions()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "resolutions": resolutions })))
}

async fn post_resolution(
    State(state): State<AppState>,
    Json(req): Json<ResolutionRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let (resolution, removed) = state
        .supervisor
        .diagnostics
        .record_resolution(
            req.app.as_deref().unwrap_or(""),
            &req.issue,
            req.error_type.as_deref(),
            req.disposition.unwrap_or(Disposition::Resolved),
            req.explanation.as_deref().unwrap_or(""),
            req.notes.as_deref().unwrap_or(""),
        )
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "resolution": resolution, "todoRemoved": removed })))
}

// ===== Icons =====

const ICON_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "gif", "svg", "ico", "webp"];

async fn get_icon(Query(query): Query<IconQuery>) -> ApiResult<Response> {
    let path = std::path::Path::new(&query.path);
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    if !ICON_EXTENSIONS.contains(&extension.as_str()) {
        return Err(ApiError::BadRequest(format!(
            "unsupported icon extension '{}'",
            extension
        )));
    }

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|_| ApiError::NotFound(format!("icon not found: {}", query.path)))?;

    let content_type = match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        _ => "image/webp",
    };

    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use ql_diagnostics::DiagnosticsEngine;
    use ql_supervisor::{ConfigStore, ScheduleStateStore};
    use tower::util::ServiceExt;

    async fn test_state(dir: &std::path::Path) -> AppState {
        let config = ConfigStore::open(dir).await.unwrap();
        let schedule_state = ScheduleStateStore::open(dir).await.unwrap();
        let diagnostics = DiagnosticsEngine::new(dir);
        let supervisor = Supervisor::new(config, schedule_state, diagnostics);
        let scheduler = Scheduler::new(Arc::clone(&supervisor));
        AppState::new(supervisor, scheduler)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn app_body(id: &str, port: u16) -> serde_json::Value {
        json!({
            "id": id,
            "name": id,
            "port": port,
            "path": "/tmp",
            "command": "npm run dev",
        })
    }

    #[tokio::test]
    async fn test_add_app_then_conflict_suggests_port() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(test_state(dir.path()).await);

        let response = router
            .clone()
            .oneshot(json_request("POST", "/api/apps", app_body("a", 5174)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .clone()
            .oneshot(json_request("POST", "/api/apps", app_body("b", 5174)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["suggestedPort"], 5175);
    }

    #[tokio::test]
    async fn test_port_check_reflects_registry_and_system() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(test_state(dir.path()).await);

        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let response = router
            .clone()
            .oneshot(get_request(&format!("/api/ports/check/{}", port)))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["registryAvailable"], true);
        assert_eq!(body["systemInUse"], true);
        assert_eq!(body["available"], false);
        drop(listener);

        let response = router
            .clone()
            .oneshot(get_request("/api/ports/check/8000"))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["registryAvailable"], false);
        assert_eq!(body["registryReason"], "reserved");
    }

    #[tokio::test]
    async fn test_supervisor_reservation_is_protected() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(test_state(dir.path()).await);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/ports/reserve/8000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_reserve_and_release_port() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(test_state(dir.path()).await);

        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/ports/reserve",
                json!({ "port": 9200, "description": "elasticsearch" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Double reservation is rejected.
        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/ports/reserve",
                json!({ "port": 9200, "description": "again" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/ports/reserve/9200")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_check_deps_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(test_state(dir.path()).await);

        let app_dir = dir.path().join("webapp");
        std::fs::create_dir(&app_dir).unwrap();
        std::fs::write(app_dir.join("package.json"), "{}").unwrap();
        std::fs::write(app_dir.join("yarn.lock"), "").unwrap();

        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/check-deps",
                json!({ "path": app_dir.to_str().unwrap() }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["needsInstall"], true);
        assert_eq!(body["hasPackageJson"], true);
        assert_eq!(body["packageManager"], "yarn");
    }

    #[tokio::test]
    async fn test_migrate_reports_per_item_status() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(test_state(dir.path()).await);

        router
            .clone()
            .oneshot(json_request("POST", "/api/apps", app_body("existing", 5174)))
            .await
            .unwrap();

        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/apps/migrate",
                json!({ "apps": [app_body("existing", 5200), app_body("conflict", 5174), app_body("fresh", 5300)] }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        let results = body["results"].as_array().unwrap();
        assert_eq!(results[0]["status"], "skipped");
        assert_eq!(results[1]["status"], "skipped");
        assert_eq!(results[2]["status"], "imported");
    }

    #[tokio::test]
    async fn test_todos_and_triage_flow() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("TODO.md"),
            "## High Priority\n- [ ] Fix login\n- [ ] Add tests\n",
        )
        .unwrap();
        let router = create_router(test_state(dir.path()).await);

        let response = router.clone().oneshot(get_request("/api/todos")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["count"], 2);

        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/triage",
                json!({ "items": [
                    { "text": "Fix login", "action": "implement" },
                    { "text": "Add tests", "action": "dontdo" },
                ]}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["implement"], 1);
        assert_eq!(body["dontdo"], 1);

        // The dontdo produced a cancelled resolution.
        let response = router
            .clone()
            .oneshot(get_request("/api/resolutions"))
            .await
            .unwrap();
        let body = body_json(response).await;
        let resolutions = body["resolutions"].as_array().unwrap();
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0]["disposition"], "cancelled");
    }

    #[tokio::test]
    async fn test_post_resolution_removes_matching_todo() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("TODO.md"),
            "## High Priority\n- [ ] port conflict on billing\n",
        )
        .unwrap();
        let router = create_router(test_state(dir.path()).await);

        let response = router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/resolutions",
                json!({ "app": "billing", "issue": "port conflict" }),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["resolution"]["errorType"], "PORT_IN_USE");
        assert_eq!(body["todoRemoved"], "port conflict on billing");
    }

    #[tokio::test]
    async fn test_icon_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(test_state(dir.path()).await);

        let response = router
            .clone()
            .oneshot(get_request("/api/icon?path=/etc/passwd"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_status_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(test_state(dir.path()).await);

        let response = router.clone().oneshot(get_request("/api/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body.as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_unknown_app_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(test_state(dir.path()).await);

        let response = router
            .clone()
            .oneshot(json_request("POST", "/api/stop", json!({ "id": "ghost" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_schedule_update_validates_expression() {
        let dir = tempfile::tempdir().unwrap();
        let router = create_router(test_state(dir.path()).await);

        router
            .clone()
            .oneshot(json_request("POST", "/api/apps", app_body("task", 5180)))
            .await
            .unwrap();

        let response = router
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/schedule/task",
                json!({ "schedule": "99:99" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/schedule/task",
                json!({ "schedule": "02:30", "scheduleEnabled": true, "runIfMissed": true }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["description"], "Daily at 2:30 AM");
        assert_eq!(body["scheduleEnabled"], true);
    }
}
