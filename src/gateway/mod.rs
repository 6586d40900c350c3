//! Axum-based HTTP gateway for lists, tasks and shares.
//!
//! - Request body size limits (64KB default)
//! - Request timeouts (30s default)
//! - Bearer authentication against the token store
//! - Every list/task route goes through the lifecycle and share services,
//!   which resolve access before touching the store

use crate::access::{AccessResolver, ShareRole};
use crate::auth::AuthStore;
use crate::config::{Config, ServerConfig};
use crate::error::AccessError;
use crate::sharing::ShareService;
use crate::store::{ResourceKind, ResourceStore, SqliteStore};
use crate::todo::{ListService, NewStep, StepPatch, StepService, TaskPatch, TaskService};
use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::Json,
    routing::{get, patch, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Concrete response type for every handler.
type ApiResponse = (StatusCode, Json<Value>);
type ApiResult = Result<ApiResponse, ApiResponse>;

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthStore>,
    pub lists: ListService,
    pub tasks: TaskService,
    pub steps: StepService,
    pub sharing: ShareService,
}

impl AppState {
    pub fn new(store: Arc<dyn ResourceStore>, auth: Arc<AuthStore>) -> Self {
        let resolver = AccessResolver::new(store.clone());
        Self {
            lists: ListService::new(store.clone(), resolver.clone()),
            tasks: TaskService::new(store.clone(), resolver.clone()),
            steps: StepService::new(store.clone(), resolver.clone()),
            sharing: ShareService::new(store, resolver).with_directory(auth.clone()),
            auth,
        }
    }
}

/// Run the HTTP gateway until the process is stopped.
pub async fn run_gateway(config: &Config) -> Result<()> {
    let db_path = config.database_path();
    let store: Arc<dyn ResourceStore> = Arc::new(SqliteStore::open(&db_path)?);
    let auth = Arc::new(AuthStore::new(
        &db_path.with_extension("auth.db"),
        Some(config.auth.access_ttl_secs),
        Some(config.auth.refresh_ttl_secs),
    )?);

    match auth.cleanup_expired_sessions() {
        Ok(0) => {}
        Ok(n) => tracing::info!(count = n, "Removed expired sessions"),
        Err(e) => tracing::warn!("Failed to clean up expired sessions: {e}"),
    }

    let state = AppState::new(store, auth);
    spawn_share_event_log(&state.sharing);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, db = %db_path.display(), "Gateway listening");

    let app = build_router(state, &config.server);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}

/// Assemble routes and middleware.
pub fn build_router(state: AppState, server: &ServerConfig) -> Router {
    // ── CORS: web clients may connect from any origin ──
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/auth/login", post(handle_auth_login))
        .route("/auth/refresh", post(handle_auth_refresh))
        .route("/auth/logout", post(handle_auth_logout))
        .route("/lists", get(handle_lists_owned).post(handle_list_create))
        .route(
            "/lists/{id}",
            get(handle_list_get)
                .patch(handle_list_rename)
                .delete(handle_list_remove),
        )
        .route("/lists/{id}/restore", post(handle_list_restore))
        .route(
            "/lists/{id}/permanent",
            axum::routing::delete(handle_list_purge),
        )
        .route(
            "/lists/{id}/tasks",
            get(handle_tasks_in_list).post(handle_task_create),
        )
        .route(
            "/tasks/{id}",
            get(handle_task_get)
                .patch(handle_task_update)
                .delete(handle_task_remove),
        )
        .route("/tasks/{id}/restore", post(handle_task_restore))
        .route(
            "/tasks/{id}/permanent",
            axum::routing::delete(handle_task_purge),
        )
        .route(
            "/tasks/{id}/steps",
            get(handle_steps_of_task).post(handle_step_create),
        )
        .route("/tasks/{id}/steps/order", patch(handle_steps_reorder))
        .route(
            "/steps/{id}",
            patch(handle_step_update).delete(handle_step_remove),
        )
        .route(
            "/lists/{id}/shares",
            get(handle_list_shares).post(handle_list_share),
        )
        .route(
            "/lists/{id}/shares/{user_id}",
            patch(handle_list_share_update).delete(handle_list_unshare),
        )
        .route(
            "/tasks/{id}/shares",
            get(handle_task_shares).post(handle_task_share),
        )
        .route(
            "/tasks/{id}/shares/{user_id}",
            patch(handle_task_share_update).delete(handle_task_unshare),
        )
        .route("/shared", get(handle_shared_with_me))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(server.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(server.request_timeout_secs),
        ))
}

/// Log share notifications. Push delivery would subscribe the same way.
fn spawn_share_event_log(sharing: &ShareService) {
    let mut events = sharing.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    tracing::debug!(recipient = event.recipient(), ?event, "Share event");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Share event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

// ══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ══════════════════════════════════════════════════════════════════════════════

fn error_response(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(json!({"error": message.into()})))
}

/// Map a service failure to its HTTP status. Storage details stay in the log.
fn access_error(err: AccessError) -> ApiResponse {
    let status = match &err {
        AccessError::NotFound(_) => StatusCode::NOT_FOUND,
        AccessError::Forbidden(_) => StatusCode::FORBIDDEN,
        AccessError::Conflict(_) => StatusCode::CONFLICT,
        AccessError::BadRequest(_) => StatusCode::BAD_REQUEST,
        AccessError::Storage(e) => {
            tracing::error!("Storage failure: {e:#}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
        }
    };
    error_response(status, err.to_string())
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiResponse> {
    body.map(|Json(b)| b)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("Invalid request: {e}")))
}

fn ok<T: serde::Serialize>(status: StatusCode, value: T) -> ApiResult {
    match serde_json::to_value(value) {
        Ok(v) => Ok((status, Json(v))),
        Err(e) => {
            tracing::error!("Response serialization failed: {e}");
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
            ))
        }
    }
}

/// Extract bearer token from Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Refresh token from the `refresh_token` cookie.
fn extract_refresh_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == "refresh_token")
        .map(|(_, value)| value.to_string())
}

/// Validate the access token and return the caller's user id.
fn require_user(state: &AppState, headers: &HeaderMap) -> Result<String, ApiResponse> {
    let token = extract_bearer_token(headers).ok_or_else(|| {
        error_response(StatusCode::UNAUTHORIZED, "Missing Authorization header")
    })?;

    state
        .auth
        .validate_access(token)
        .map(|session| session.user_id)
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "Invalid or expired access token"))
}

// ══════════════════════════════════════════════════════════════════════════════
// AUTH HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health: always public
async fn handle_health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

#[derive(Deserialize, Default)]
struct RefreshBody {
    refresh_token: Option<String>,
}

/// POST /auth/login: authenticate and get an access/refresh pair.
async fn handle_auth_login(
    State(state): State<AppState>,
    body: Result<Json<LoginBody>, JsonRejection>,
) -> ApiResult {
    let body = json_body(body)?;

    let user = state
        .auth
        .authenticate(&body.username, &body.password)
        .map_err(|_| error_response(StatusCode::UNAUTHORIZED, "Invalid username or password"))?;

    let tokens = state.auth.issue_tokens(&user.id).map_err(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Session creation failed: {e}"),
        )
    })?;

    tracing::info!(user_id = %user.id, "User logged in");
    Ok((
        StatusCode::OK,
        Json(json!({
            "access_token": tokens.access_token,
            "refresh_token": tokens.refresh_token,
            "expires_in": tokens.expires_in,
            "user_id": user.id,
            "username": user.username,
        })),
    ))
}

/// POST /auth/refresh: rotate tokens. Reads the body first, then the cookie.
async fn handle_auth_refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<RefreshBody>>,
) -> ApiResult {
    let token = body
        .and_then(|Json(b)| b.refresh_token)
        .or_else(|| extract_refresh_cookie(&headers))
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "Missing refresh token"))?;

    match state.auth.refresh(&token) {
        Ok(Some(tokens)) => ok(StatusCode::OK, tokens),
        Ok(None) => Err(error_response(
            StatusCode::UNAUTHORIZED,
            "Invalid or expired refresh token",
        )),
        Err(e) => Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Refresh failed: {e}"),
        )),
    }
}

/// POST /auth/logout: revoke the current session.
async fn handle_auth_logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let token = extract_bearer_token(&headers)
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "Missing Authorization header"))?;

    match state.auth.revoke(token) {
        Ok(true) => Ok((StatusCode::OK, Json(json!({"status": "logged_out"})))),
        Ok(false) => Err(error_response(StatusCode::UNAUTHORIZED, "Invalid session")),
        Err(e) => Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Logout failed: {e}"),
        )),
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// LIST HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct ListBody {
    name: String,
}

/// GET /lists: lists owned by the caller.
async fn handle_lists_owned(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let lists = state.lists.list_owned(&user_id).await.map_err(access_error)?;
    ok(StatusCode::OK, lists)
}

/// POST /lists
async fn handle_list_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<ListBody>, JsonRejection>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let body = json_body(body)?;
    let list = state
        .lists
        .create(&user_id, &body.name)
        .await
        .map_err(access_error)?;
    ok(StatusCode::CREATED, list)
}

/// GET /lists/{id}: the list with its tasks.
async fn handle_list_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let detail = state.lists.get(&id, &user_id).await.map_err(access_error)?;
    ok(StatusCode::OK, detail)
}

/// PATCH /lists/{id}
async fn handle_list_rename(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<ListBody>, JsonRejection>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let body = json_body(body)?;
    let list = state
        .lists
        .rename(&id, &user_id, &body.name)
        .await
        .map_err(access_error)?;
    ok(StatusCode::OK, list)
}

/// DELETE /lists/{id}: soft delete, owner only.
async fn handle_list_remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    state.lists.remove(&id, &user_id).await.map_err(access_error)?;
    Ok((StatusCode::OK, Json(json!({"status": "deleted"}))))
}

/// POST /lists/{id}/restore
async fn handle_list_restore(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let list = state.lists.restore(&id, &user_id).await.map_err(access_error)?;
    ok(StatusCode::OK, list)
}

/// DELETE /lists/{id}/permanent
async fn handle_list_purge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    state.lists.purge(&id, &user_id).await.map_err(access_error)?;
    Ok((StatusCode::OK, Json(json!({"status": "purged"}))))
}

// ══════════════════════════════════════════════════════════════════════════════
// TASK HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct TaskBody {
    description: String,
}

/// GET /lists/{id}/tasks
async fn handle_tasks_in_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(list_id): Path<String>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let tasks = state
        .tasks
        .list_in(&list_id, &user_id)
        .await
        .map_err(access_error)?;
    ok(StatusCode::OK, tasks)
}

/// POST /lists/{id}/tasks
async fn handle_task_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(list_id): Path<String>,
    body: Result<Json<TaskBody>, JsonRejection>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let body = json_body(body)?;
    let task = state
        .tasks
        .create(&list_id, &user_id, &body.description)
        .await
        .map_err(access_error)?;
    ok(StatusCode::CREATED, task)
}

/// GET /tasks/{id}: the task with its steps.
async fn handle_task_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let task = state.tasks.get(&id, &user_id).await.map_err(access_error)?;
    ok(StatusCode::OK, task)
}

/// PATCH /tasks/{id}
async fn handle_task_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<TaskPatch>, JsonRejection>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let patch = json_body(body)?;
    let task = state
        .tasks
        .update(&id, &user_id, &patch)
        .await
        .map_err(access_error)?;
    ok(StatusCode::OK, task)
}

/// DELETE /tasks/{id}
async fn handle_task_remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    state.tasks.remove(&id, &user_id).await.map_err(access_error)?;
    Ok((StatusCode::OK, Json(json!({"status": "deleted"}))))
}

/// POST /tasks/{id}/restore
async fn handle_task_restore(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let task = state.tasks.restore(&id, &user_id).await.map_err(access_error)?;
    ok(StatusCode::OK, task)
}

/// DELETE /tasks/{id}/permanent
async fn handle_task_purge(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    state.tasks.purge(&id, &user_id).await.map_err(access_error)?;
    Ok((StatusCode::OK, Json(json!({"status": "purged"}))))
}

// ══════════════════════════════════════════════════════════════════════════════
// STEP HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct StepOrderBody {
    step_ids: Vec<String>,
}

/// GET /tasks/{id}/steps
async fn handle_steps_of_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let steps = state
        .steps
        .list(&task_id, &user_id)
        .await
        .map_err(access_error)?;
    ok(StatusCode::OK, steps)
}

/// POST /tasks/{id}/steps
async fn handle_step_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    body: Result<Json<NewStep>, JsonRejection>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let step = json_body(body)?;
    let step = state
        .steps
        .create(&task_id, &user_id, &step)
        .await
        .map_err(access_error)?;
    ok(StatusCode::CREATED, step)
}

/// PATCH /tasks/{id}/steps/order: `{"step_ids": [...]}` naming every step once.
async fn handle_steps_reorder(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    body: Result<Json<StepOrderBody>, JsonRejection>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let body = json_body(body)?;
    let steps = state
        .steps
        .reorder(&task_id, &user_id, &body.step_ids)
        .await
        .map_err(access_error)?;
    ok(StatusCode::OK, steps)
}

/// PATCH /steps/{id}
async fn handle_step_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<StepPatch>, JsonRejection>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let patch = json_body(body)?;
    let step = state
        .steps
        .update(&id, &user_id, &patch)
        .await
        .map_err(access_error)?;
    ok(StatusCode::OK, step)
}

/// DELETE /steps/{id}
async fn handle_step_remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    state.steps.remove(&id, &user_id).await.map_err(access_error)?;
    Ok((StatusCode::OK, Json(json!({"status": "deleted"}))))
}

// ══════════════════════════════════════════════════════════════════════════════
// SHARE HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// Names the grantee by `user_id`, or by `email` / `username`.
#[derive(Deserialize)]
struct ShareBody {
    user_id: Option<String>,
    email: Option<String>,
    username: Option<String>,
    /// `VIEWER` or `EDITOR`, case-insensitive. Defaults to `EDITOR`.
    role: Option<String>,
}

#[derive(Deserialize)]
struct ShareRoleBody {
    role: String,
}

fn parse_role(raw: Option<&str>) -> Result<ShareRole, ApiResponse> {
    match raw {
        None => Ok(ShareRole::default()),
        Some(s) => ShareRole::parse(s).ok_or_else(|| {
            error_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid role '{s}': expected VIEWER or EDITOR"),
            )
        }),
    }
}

async fn list_shares(
    kind: ResourceKind,
    state: AppState,
    headers: HeaderMap,
    id: String,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let shares = state
        .sharing
        .list_shares(kind, &id, &user_id)
        .await
        .map_err(access_error)?;
    ok(StatusCode::OK, shares)
}

async fn create_share(
    kind: ResourceKind,
    state: AppState,
    headers: HeaderMap,
    id: String,
    body: Result<Json<ShareBody>, JsonRejection>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let body = json_body(body)?;
    let role = parse_role(body.role.as_deref())?;

    let shared = match (body.user_id, body.email.or(body.username)) {
        (Some(grantee), _) => {
            state
                .sharing
                .share(kind, &id, &user_id, &grantee, role)
                .await
        }
        (None, Some(login)) => {
            state
                .sharing
                .share_with_login(kind, &id, &user_id, &login, role)
                .await
        }
        (None, None) => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "One of user_id, email or username is required",
            ))
        }
    };
    let share = shared.map_err(access_error)?;
    ok(StatusCode::CREATED, share)
}

async fn update_share(
    kind: ResourceKind,
    state: AppState,
    headers: HeaderMap,
    (id, grantee): (String, String),
    body: Result<Json<ShareRoleBody>, JsonRejection>,
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let body = json_body(body)?;
    let role = parse_role(Some(&body.role))?;
    let share = state
        .sharing
        .update_role(kind, &id, &user_id, &grantee, role)
        .await
        .map_err(access_error)?;
    ok(StatusCode::OK, share)
}

async fn remove_share(
    kind: ResourceKind,
    state: AppState,
    headers: HeaderMap,
    (id, grantee): (String, String),
) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    state
        .sharing
        .unshare(kind, &id, &user_id, &grantee)
        .await
        .map_err(access_error)?;
    Ok((StatusCode::OK, Json(json!({"status": "unshared"}))))
}

/// GET /lists/{id}/shares
async fn handle_list_shares(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    list_shares(ResourceKind::List, state, headers, id).await
}

/// POST /lists/{id}/shares
async fn handle_list_share(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<ShareBody>, JsonRejection>,
) -> ApiResult {
    create_share(ResourceKind::List, state, headers, id, body).await
}

/// PATCH /lists/{id}/shares/{user_id}
async fn handle_list_share_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(ids): Path<(String, String)>,
    body: Result<Json<ShareRoleBody>, JsonRejection>,
) -> ApiResult {
    update_share(ResourceKind::List, state, headers, ids, body).await
}

/// DELETE /lists/{id}/shares/{user_id}
async fn handle_list_unshare(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(ids): Path<(String, String)>,
) -> ApiResult {
    remove_share(ResourceKind::List, state, headers, ids).await
}

/// GET /tasks/{id}/shares
async fn handle_task_shares(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult {
    list_shares(ResourceKind::Task, state, headers, id).await
}

/// POST /tasks/{id}/shares
async fn handle_task_share(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Json<ShareBody>, JsonRejection>,
) -> ApiResult {
    create_share(ResourceKind::Task, state, headers, id, body).await
}

/// PATCH /tasks/{id}/shares/{user_id}
async fn handle_task_share_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(ids): Path<(String, String)>,
    body: Result<Json<ShareRoleBody>, JsonRejection>,
) -> ApiResult {
    update_share(ResourceKind::Task, state, headers, ids, body).await
}

/// DELETE /tasks/{id}/shares/{user_id}
async fn handle_task_unshare(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(ids): Path<(String, String)>,
) -> ApiResult {
    remove_share(ResourceKind::Task, state, headers, ids).await
}

/// GET /shared: lists and tasks other users shared with the caller.
async fn handle_shared_with_me(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    let user_id = require_user(&state, &headers)?;
    let shared = state
        .sharing
        .shared_with(&user_id)
        .await
        .map_err(access_error)?;
    ok(StatusCode::OK, shared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        _tmp: TempDir,
        state: AppState,
        router: Router,
    }

    fn test_app() -> TestApp {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn ResourceStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let auth =
            Arc::new(AuthStore::new(&tmp.path().join("auth.db"), Some(3600), Some(7200)).unwrap());
        let state = AppState::new(store, auth);
        let router = build_router(state.clone(), &ServerConfig::default());
        TestApp {
            _tmp: tmp,
            state,
            router,
        }
    }

    impl TestApp {
        /// Register a user and return `(user_id, access_token)`.
        fn user(&self, name: &str) -> (String, String) {
            let id = self.state.auth.register(name, "password123!").unwrap();
            let tokens = self.state.auth.issue_tokens(&id).unwrap();
            (id, tokens.access_token)
        }

        async fn call(
            &self,
            method: &str,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
            }
            let request = match body {
                Some(v) => builder
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(v.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(Value::Null)
            };
            (status, value)
        }
    }

    #[test]
    fn app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }

    #[test]
    fn bearer_and_cookie_extraction() {
        let mut headers = HeaderMap::new();
        assert!(extract_bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        headers.insert(header::COOKIE, "theme=dark; refresh_token=r1".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("abc"));
        assert_eq!(extract_refresh_cookie(&headers).as_deref(), Some("r1"));
    }

    #[test]
    fn access_errors_map_to_status_codes() {
        let cases = [
            (AccessError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (AccessError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (AccessError::Conflict("x".into()), StatusCode::CONFLICT),
            (AccessError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (
                AccessError::Storage(anyhow::anyhow!("disk I/O error")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            let (status, Json(body)) = access_error(err);
            assert_eq!(status, expected);
            assert!(!body["error"].as_str().unwrap().contains("disk"));
        }
    }

    #[tokio::test]
    async fn health_is_public() {
        let app = test_app();
        let (status, body) = app.call("GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn routes_require_bearer_token() {
        let app = test_app();
        let (status, body) = app.call("GET", "/lists", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Missing Authorization header");

        let (status, _) = app.call("GET", "/lists", Some("bogus"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn login_then_refresh_rotates_tokens() {
        let app = test_app();
        app.user("alice");

        let (status, body) = app
            .call(
                "POST",
                "/auth/login",
                None,
                Some(json!({"username": "alice", "password": "password123!"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let access = body["access_token"].as_str().unwrap().to_string();
        let refresh = body["refresh_token"].as_str().unwrap().to_string();
        assert_eq!(body["expires_in"], 3600);

        let (status, body) = app
            .call(
                "POST",
                "/auth/refresh",
                None,
                Some(json!({"refresh_token": refresh})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let new_access = body["access_token"].as_str().unwrap().to_string();

        let (status, _) = app.call("GET", "/lists", Some(&access), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = app.call("GET", "/lists", Some(&new_access), None).await;
        assert_eq!(status, StatusCode::OK);

        // The old refresh token was consumed
        let (status, _) = app
            .call(
                "POST",
                "/auth/refresh",
                None,
                Some(json!({"refresh_token": refresh})),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let app = test_app();
        app.user("alice");
        let (status, body) = app
            .call(
                "POST",
                "/auth/login",
                None,
                Some(json!({"username": "alice", "password": "nope-nope"})),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid username or password");
    }

    #[tokio::test]
    async fn list_lifecycle_and_permissions() {
        let app = test_app();
        let (_, alice) = app.user("alice");
        let (bob_id, bob) = app.user("bob");

        let (status, list) = app
            .call("POST", "/lists", Some(&alice), Some(json!({"name": "Groceries"})))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let list_id = list["id"].as_str().unwrap().to_string();
        let uri = format!("/lists/{list_id}");

        let (status, _) = app.call("GET", &uri, Some(&bob), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, share) = app
            .call(
                "POST",
                &format!("{uri}/shares"),
                Some(&alice),
                Some(json!({"user_id": bob_id, "role": "viewer"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(share["role"], "VIEWER");

        let (status, _) = app.call("GET", &uri, Some(&bob), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app
            .call("PATCH", &uri, Some(&bob), Some(json!({"name": "Mine"})))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .call(
                "PATCH",
                &format!("{uri}/shares/{bob_id}"),
                Some(&alice),
                Some(json!({"role": "EDITOR"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, task) = app
            .call(
                "POST",
                &format!("{uri}/tasks"),
                Some(&bob),
                Some(json!({"description": "bread"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(task["id"].is_string());

        let (status, _) = app.call("DELETE", &uri, Some(&bob), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app.call("DELETE", &uri, Some(&alice), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app.call("GET", &uri, Some(&alice), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, restored) = app
            .call("POST", &format!("{uri}/restore"), Some(&alice), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(restored["id"], list_id.as_str());
    }

    #[tokio::test]
    async fn share_validation_errors() {
        let app = test_app();
        let (alice_id, alice) = app.user("alice");
        let (bob_id, _) = app.user("bob");

        let (_, list) = app
            .call("POST", "/lists", Some(&alice), Some(json!({"name": "Chores"})))
            .await;
        let shares_uri = format!("/lists/{}/shares", list["id"].as_str().unwrap());

        let (status, _) = app
            .call(
                "POST",
                &shares_uri,
                Some(&alice),
                Some(json!({"user_id": alice_id})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .call(
                "POST",
                &shares_uri,
                Some(&alice),
                Some(json!({"user_id": "no-such-user"})),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = app
            .call(
                "POST",
                &shares_uri,
                Some(&alice),
                Some(json!({"user_id": bob_id, "role": "OWNER"})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .call("POST", &shares_uri, Some(&alice), Some(json!({"user_id": bob_id})))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, body) = app
            .call("POST", &shares_uri, Some(&alice), Some(json!({"user_id": bob_id})))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("already shared"));

        let (status, shares) = app.call("GET", &shares_uri, Some(&alice), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(shares.as_array().unwrap().len(), 1);
        assert_eq!(shares[0]["role"], "EDITOR");
    }

    #[tokio::test]
    async fn shared_endpoint_lists_grants_for_caller() {
        let app = test_app();
        let (_, alice) = app.user("alice");
        let (bob_id, bob) = app.user("bob");

        let (_, list) = app
            .call("POST", "/lists", Some(&alice), Some(json!({"name": "Trip"})))
            .await;
        let list_id = list["id"].as_str().unwrap();
        app.call(
            "POST",
            &format!("/lists/{list_id}/shares"),
            Some(&alice),
            Some(json!({"user_id": bob_id, "role": "VIEWER"})),
        )
        .await;

        let (status, shared) = app.call("GET", "/shared", Some(&bob), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(shared[0]["resource"]["id"], list_id);
        assert_eq!(shared[0]["role"], "VIEWER");

        let (status, _) = app
            .call(
                "DELETE",
                &format!("/lists/{list_id}/shares/{bob_id}"),
                Some(&bob),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let (_, shared) = app.call("GET", "/shared", Some(&bob), None).await;
        assert!(shared.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let app = test_app();
        let (_, alice) = app.user("alice");
        let (status, body) = app
            .call("POST", "/lists", Some(&alice), Some(json!({"title": "x"})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid request"));
    }

    #[tokio::test]
    async fn logout_revokes_access_token() {
        let app = test_app();
        let (_, alice) = app.user("alice");

        let (status, _) = app.call("POST", "/auth/logout", Some(&alice), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app.call("GET", "/lists", Some(&alice), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn grantee_lookup_happens_after_access_check() {
        let app = test_app();
        let (_, alice) = app.user("alice");
        let (_, mallory) = app.user("mallory");

        let (_, list) = app
            .call("POST", "/lists", Some(&alice), Some(json!({"name": "Private"})))
            .await;
        let shares_uri = format!("/lists/{}/shares", list["id"].as_str().unwrap());

        let (status, body) = app
            .call(
                "POST",
                &shares_uri,
                Some(&mallory),
                Some(json!({"user_id": "no-such-user"})),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(!body["error"].as_str().unwrap().contains("no-such-user"));

        let (status, _) = app
            .call("POST", &shares_uri, Some(&mallory), Some(json!({"user_id": "  "})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app
            .call("POST", &shares_uri, Some(&alice), Some(json!({"role": "VIEWER"})))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn task_shared_by_email() {
        let app = test_app();
        let (_, alice) = app.user("alice");
        let (bob_id, bob) = app.user("bob");
        app.state.auth.set_email(&bob_id, "bob@example.com").unwrap();

        let (_, list) = app
            .call("POST", "/lists", Some(&alice), Some(json!({"name": "Home"})))
            .await;
        let (_, task) = app
            .call(
                "POST",
                &format!("/lists/{}/tasks", list["id"].as_str().unwrap()),
                Some(&alice),
                Some(json!({"description": "fix sink"})),
            )
            .await;
        let task_uri = format!("/tasks/{}", task["id"].as_str().unwrap());

        let (status, share) = app
            .call(
                "POST",
                &format!("{task_uri}/shares"),
                Some(&alice),
                Some(json!({"email": "BOB@example.com", "role": "VIEWER"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(share["shared_with_id"], bob_id.as_str());

        let (status, _) = app
            .call(
                "POST",
                &format!("{task_uri}/shares"),
                Some(&alice),
                Some(json!({"email": "nobody@example.com"})),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = app.call("GET", &task_uri, Some(&bob), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn step_routes_follow_task_access() {
        let app = test_app();
        let (_, alice) = app.user("alice");
        let (bob_id, bob) = app.user("bob");

        let (_, list) = app
            .call("POST", "/lists", Some(&alice), Some(json!({"name": "Trip"})))
            .await;
        let list_id = list["id"].as_str().unwrap().to_string();
        let (_, task) = app
            .call(
                "POST",
                &format!("/lists/{list_id}/tasks"),
                Some(&alice),
                Some(json!({"description": "pack"})),
            )
            .await;
        let task_uri = format!("/tasks/{}", task["id"].as_str().unwrap());

        let (status, first) = app
            .call(
                "POST",
                &format!("{task_uri}/steps"),
                Some(&alice),
                Some(json!({"description": "socks"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let (_, second) = app
            .call(
                "POST",
                &format!("{task_uri}/steps"),
                Some(&alice),
                Some(json!({"description": "charger", "completed": true})),
            )
            .await;
        let first_id = first["id"].as_str().unwrap().to_string();
        let second_id = second["id"].as_str().unwrap().to_string();

        let (status, _) = app
            .call("GET", &format!("{task_uri}/steps"), Some(&bob), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        app.call(
            "POST",
            &format!("/lists/{list_id}/shares"),
            Some(&alice),
            Some(json!({"user_id": bob_id, "role": "VIEWER"})),
        )
        .await;

        let (status, detail) = app.call("GET", &task_uri, Some(&bob), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["steps"].as_array().unwrap().len(), 2);

        let (status, _) = app
            .call(
                "PATCH",
                &format!("/steps/{first_id}"),
                Some(&bob),
                Some(json!({"completed": true})),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, ordered) = app
            .call(
                "PATCH",
                &format!("{task_uri}/steps/order"),
                Some(&alice),
                Some(json!({"step_ids": [second_id, first_id]})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ordered[0]["id"], second_id.as_str());

        let (status, _) = app
            .call("DELETE", &format!("/steps/{first_id}"), Some(&alice), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let (_, steps) = app
            .call("GET", &format!("{task_uri}/steps"), Some(&bob), None)
            .await;
        assert_eq!(steps.as_array().unwrap().len(), 1);
    }
}
