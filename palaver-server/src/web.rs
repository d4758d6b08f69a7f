//! HTTP surface: WebSocket chat transport, registration, uploads,
//! leaderboard, and the admin API.
//!
//! Every REST rejection carries a JSON body with a success flag, a
//! stable `reason` code, and a human-readable message. Credential
//! checks use `Authorization: Bearer <token>`; admin endpoints
//! additionally require the token's admin flag (the flag embedded at
//! issuance — see DESIGN.md for the accepted staleness window).

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

use crate::connection;
use crate::db::{LeaderboardWindow, RegisterOutcome};
use crate::server::{ModerationError, SharedState};
use crate::token::Claims;

/// Maximum accepted image size.
const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Build the axum router.
pub fn router(state: Arc<SharedState>) -> Router {
    let uploads = ServeDir::new(state.blobs.dir());
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/register", post(register))
        .route("/upload", post(upload))
        .route("/change-password", post(change_password))
        .route("/scores/{window}", get(scores))
        .route("/admin/users", get(admin_users))
        .route("/admin/mute", post(admin_mute))
        .route("/admin/set-admin", post(admin_set_admin))
        .route(
            "/admin/invitation-codes",
            post(admin_add_invitation_code).get(admin_list_invitation_codes),
        )
        .route("/admin/plugins", get(admin_plugins))
        .route("/admin/plugins/toggle", post(admin_toggle_plugin))
        .nest_service("/uploads", uploads)
        .layer(DefaultBodyLimit::max(12 * 1024 * 1024))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
        )
        .with_state(state)
}

/// A REST rejection: status code plus a stable reason code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    reason: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            reason,
            message: message.into(),
        }
    }

    fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }

    /// Storage failures are logged server-side; the caller only sees
    /// a generic failure.
    fn storage() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "storage", "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "reason": self.reason,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<ModerationError> for ApiError {
    fn from(err: ModerationError) -> Self {
        match err {
            ModerationError::NotFound => {
                Self::new(StatusCode::NOT_FOUND, "not_found", "user not found")
            }
            ModerationError::Forbidden => Self::new(
                StatusCode::FORBIDDEN,
                "forbidden",
                "the root admin cannot be demoted",
            ),
            ModerationError::Storage => Self::storage(),
        }
    }
}

/// Extract and verify the bearer credential. Missing and invalid
/// tokens are distinguished by status only, never by which check
/// inside verification failed.
fn bearer_claims(state: &SharedState, headers: &HeaderMap) -> Result<Claims, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| {
            ApiError::new(StatusCode::UNAUTHORIZED, "missing_token", "no credential provided")
        })?;
    state.issuer.verify(token).map_err(|_| {
        ApiError::new(
            StatusCode::FORBIDDEN,
            "invalid_credential",
            "invalid or expired token",
        )
    })
}

fn admin_claims(state: &SharedState, headers: &HeaderMap) -> Result<Claims, ApiError> {
    let claims = bearer_claims(state, headers)?;
    if !claims.admin {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "forbidden",
            "admin privileges required",
        ));
    }
    Ok(claims)
}

// ── WebSocket ──────────────────────────────────────────────────────

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<SharedState>>) -> Response {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state))
        .into_response()
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

// ── Registration ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    password: String,
    invitation_code: String,
}

async fn register(
    State(state): State<Arc<SharedState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let RegisterRequest {
        username,
        password,
        invitation_code,
    } = req;
    if username.is_empty() || password.is_empty() || invitation_code.is_empty() {
        return Err(ApiError::validation(
            "username, password, and invitation code are required",
        ));
    }

    let hash = tokio::task::spawn_blocking(move || connection::hash_password(&password))
        .await
        .map_err(|_| ApiError::storage())?
        .map_err(|e| {
            tracing::error!("Password hashing failed: {e}");
            ApiError::storage()
        })?;

    let outcome = state
        .with_db(|db| db.register_user(&username, &hash, &invitation_code))
        .ok_or_else(ApiError::storage)?;

    match outcome {
        RegisterOutcome::Registered(_) => {
            tracing::info!("Registered new user {username}");
            Ok((
                StatusCode::CREATED,
                Json(json!({ "success": true, "message": "registration successful" })),
            ))
        }
        RegisterOutcome::InvalidCode => Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "invalid_code",
            "invalid or exhausted invitation code",
        )),
        RegisterOutcome::UsernameTaken => Err(ApiError::new(
            StatusCode::CONFLICT,
            "username_taken",
            "username is already taken",
        )),
    }
}

// ── Uploads ────────────────────────────────────────────────────────

async fn upload(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    bearer_claims(&state, &headers)?;

    let mut file: Option<(Vec<u8>, String)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("multipart error: {e}")))?
    {
        if field.name() != Some("image") {
            continue;
        }
        let name = field.file_name().unwrap_or("upload").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::validation(format!("file read error: {e}")))?;
        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err(ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "too_large",
                "file too large (max 10MB)",
            ));
        }
        file = Some((bytes.to_vec(), name));
    }

    let (bytes, name) = file.ok_or_else(|| ApiError::validation("no file uploaded"))?;
    let file_url = state.blobs.save(&bytes, &name).map_err(|e| {
        tracing::error!("Failed to store upload: {e}");
        ApiError::storage()
    })?;
    Ok(Json(json!({ "success": true, "file_url": file_url })))
}

// ── Password change ────────────────────────────────────────────────

#[derive(Deserialize)]
struct ChangePasswordRequest {
    old_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let claims = bearer_claims(&state, &headers)?;
    if req.old_password.is_empty() || req.new_password.is_empty() {
        return Err(ApiError::validation("old and new password are required"));
    }

    let user = state
        .with_db(|db| db.find_user(&claims.sub))
        .flatten()
        .ok_or_else(|| {
            ApiError::new(StatusCode::UNAUTHORIZED, "bad_credentials", "old password incorrect")
        })?;

    let old = req.old_password;
    let new = req.new_password;
    let new_hash = tokio::task::spawn_blocking(move || {
        connection::verify_password(&user.password_hash, &old)
            .then(|| connection::hash_password(&new))
    })
    .await
    .map_err(|_| ApiError::storage())?
    .ok_or_else(|| {
        ApiError::new(StatusCode::UNAUTHORIZED, "bad_credentials", "old password incorrect")
    })?
    .map_err(|e| {
        tracing::error!("Password hashing failed: {e}");
        ApiError::storage()
    })?;

    let updated = state
        .with_db(|db| db.update_password(&claims.sub, &new_hash))
        .ok_or_else(ApiError::storage)?;
    if !updated {
        return Err(ApiError::storage());
    }
    Ok(Json(json!({
        "success": true,
        "message": "password changed, please log in again",
    })))
}

// ── Leaderboard ────────────────────────────────────────────────────

async fn scores(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Path(window): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    bearer_claims(&state, &headers)?;
    let window = LeaderboardWindow::parse(&window)
        .ok_or_else(|| ApiError::validation("window must be day, week, or month"))?;
    let scores = state
        .with_db(|db| db.leaderboard(window, chrono::Utc::now()))
        .ok_or_else(ApiError::storage)?;
    Ok(Json(json!({ "success": true, "scores": scores })))
}

// ── Admin API ──────────────────────────────────────────────────────

async fn admin_users(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    admin_claims(&state, &headers)?;
    let users = state
        .with_db(|db| db.list_users())
        .ok_or_else(ApiError::storage)?;
    let users: Vec<serde_json::Value> = users
        .iter()
        .map(|u| json!({ "id": u.id, "username": u.username, "is_admin": u.is_admin }))
        .collect();
    Ok(Json(json!({ "success": true, "users": users })))
}

#[derive(Deserialize)]
struct MuteRequest {
    username: String,
    mute: bool,
}

async fn admin_mute(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Json(req): Json<MuteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    admin_claims(&state, &headers)?;
    if req.username.is_empty() {
        return Err(ApiError::validation("username is required"));
    }
    state.set_muted(&req.username, req.mute)?;
    let verb = if req.mute { "muted" } else { "unmuted" };
    Ok(Json(json!({
        "success": true,
        "message": format!("{} has been {verb}", req.username),
    })))
}

#[derive(Deserialize)]
struct SetAdminRequest {
    username: String,
    is_admin: bool,
}

async fn admin_set_admin(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Json(req): Json<SetAdminRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    admin_claims(&state, &headers)?;
    if req.username.is_empty() {
        return Err(ApiError::validation("username is required"));
    }
    state.set_admin(&req.username, req.is_admin)?;
    let verb = if req.is_admin { "granted" } else { "revoked" };
    Ok(Json(json!({
        "success": true,
        "message": format!("admin {verb} for {}", req.username),
    })))
}

#[derive(Deserialize)]
struct AddCodeRequest {
    code: String,
    max_uses: u32,
}

async fn admin_add_invitation_code(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Json(req): Json<AddCodeRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    admin_claims(&state, &headers)?;
    if req.code.is_empty() || req.max_uses == 0 {
        return Err(ApiError::validation(
            "code is required and max_uses must be greater than zero",
        ));
    }
    let created = {
        let db = state.db.lock().unwrap();
        db.create_invitation_code(&req.code, req.max_uses)
    };
    match created {
        Ok(code) => Ok((
            StatusCode::CREATED,
            Json(json!({ "success": true, "code": code })),
        )),
        Err(ref e) if crate::db::is_unique_violation(e) => Err(ApiError::new(
            StatusCode::CONFLICT,
            "code_exists",
            "invitation code already exists",
        )),
        Err(e) => {
            tracing::error!("Failed to create invitation code: {e}");
            Err(ApiError::storage())
        }
    }
}

async fn admin_list_invitation_codes(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    admin_claims(&state, &headers)?;
    let codes = state
        .with_db(|db| db.list_invitation_codes())
        .ok_or_else(ApiError::storage)?;
    Ok(Json(json!({ "success": true, "codes": codes })))
}

async fn admin_plugins(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    admin_claims(&state, &headers)?;
    Ok(Json(json!({ "success": true, "plugins": state.plugins.list() })))
}

#[derive(Deserialize)]
struct TogglePluginRequest {
    name: String,
    enabled: bool,
}

async fn admin_toggle_plugin(
    State(state): State<Arc<SharedState>>,
    headers: HeaderMap,
    Json(req): Json<TogglePluginRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    admin_claims(&state, &headers)?;
    if !state.plugins.toggle(&req.name, req.enabled, &*state) {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            "plugin not found",
        ));
    }
    let verb = if req.enabled { "enabled" } else { "disabled" };
    Ok(Json(json!({
        "success": true,
        "message": format!("plugin {} {verb}", req.name),
    })))
}
