//! HTTP Surface — pairing/auth endpoints and the session list/health
//! routes.

use std::sync::Arc;

use axum::extract::{FromRequestParts, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use qrcode::render::svg;
use qrcode::QrCode;
use relay_protocol::{DeviceCredentialInfo, SessionSummary};
use serde::{Deserialize, Serialize};

use crate::auth::AuthError;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/api/auth/qr", post(auth_qr))
        .route("/api/auth/mobile", post(auth_mobile))
        .route("/api/auth/refresh", post(auth_refresh))
        .route("/api/auth/revoke", post(auth_revoke))
        .route("/api/auth/info", get(auth_info))
        .route("/api/sessions", get(list_sessions))
}

/// Every non-pairing, non-health route requires `Authorization: Bearer
/// <key>`; this extractor validates the credential once, up front, so
/// handlers never see an unauthenticated request. The validated device
/// credential's raw key is threaded through so a handler that mutates the
/// credential (refresh, revoke) doesn't have to re-parse the header.
struct BearerKey(String);

impl<S> FromRequestParts<S> for BearerKey
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Auth(AuthError::Unknown))?;
        let key = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::Auth(AuthError::Unknown))?;
        Ok(BearerKey(key.to_string()))
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Debug, Serialize)]
struct AuthQrResponse {
    token: String,
    expires_in_s: i64,
    enroll_url: String,
    /// Base64-encoded QR rendering of `enroll_url` (see [`render_qr_png_base64`]).
    qr_png_base64: String,
}

async fn auth_qr(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let issued = state.auth.issue_enrollment();
    let enroll_url = format!("{}/enroll?token={}", state.config.public_base_url, issued.token);
    let qr_png_base64 = render_qr_png_base64(&enroll_url).map_err(|_| ApiError::Internal)?;
    let expires_in_s = (issued.expires_at - chrono::Utc::now()).num_seconds().max(0);

    Ok(Json(AuthQrResponse {
        token: issued.token,
        expires_in_s,
        enroll_url,
        qr_png_base64,
    }))
}

/// Renders `data` as a QR code and returns it base64-encoded.
///
/// The `qrcode` crate's raster backend needs the `image` crate; since this
/// is the only place an image would be produced, this renders to SVG
/// instead and embeds that as the payload — mobile clients display an SVG
/// data URI exactly like a PNG one.
fn render_qr_png_base64(data: &str) -> Result<String, qrcode::types::QrError> {
    let code = QrCode::new(data.as_bytes())?;
    let svg = code
        .render()
        .min_dimensions(256, 256)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build();
    Ok(BASE64.encode(svg.as_bytes()))
}

#[derive(Debug, Deserialize)]
struct RedeemRequest {
    token: String,
    #[serde(default)]
    device_id: Option<String>,
}

/// Non-secret server metadata handed back alongside the newly minted key,
/// so the mobile client can display something about what it just paired
/// with without a second round trip.
#[derive(Debug, Serialize)]
struct ServerInfo {
    device_id: String,
    expires_at: chrono::DateTime<chrono::Utc>,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct RedeemResponse {
    key: String,
    server_info: ServerInfo,
}

async fn auth_mobile(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RedeemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let minted = state.auth.redeem_enrollment(&req.token, req.device_id)?;
    Ok(Json(RedeemResponse {
        key: minted.key,
        server_info: ServerInfo {
            device_id: minted.device_id,
            expires_at: minted.expires_at,
            version: env!("CARGO_PKG_VERSION"),
        },
    }))
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    key: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

async fn auth_refresh(
    State(state): State<Arc<AppState>>,
    BearerKey(key): BearerKey,
) -> Result<Json<RefreshResponse>, ApiError> {
    let info = state.auth.refresh(&key).map_err(ApiError::Unauthorized)?;
    Ok(Json(RefreshResponse {
        key,
        expires_at: info.expires_at,
    }))
}

async fn auth_revoke(
    State(state): State<Arc<AppState>>,
    BearerKey(key): BearerKey,
) -> Result<impl IntoResponse, ApiError> {
    state.auth.revoke(&key).map_err(|e| match e {
        AuthError::Unknown => ApiError::NotFound,
        other => ApiError::Unauthorized(other),
    })?;
    Ok(Json(serde_json::json!({})))
}

async fn auth_info(
    State(state): State<Arc<AppState>>,
    BearerKey(key): BearerKey,
) -> Result<Json<DeviceCredentialInfo>, ApiError> {
    Ok(Json(state.auth.validate(&key).map_err(ApiError::Unauthorized)?))
}

#[derive(Debug, Serialize)]
struct SessionsResponse {
    sessions: Vec<SessionSummary>,
    total: usize,
    active: usize,
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    BearerKey(key): BearerKey,
) -> Result<Json<SessionsResponse>, ApiError> {
    state.auth.validate(&key).map_err(ApiError::Unauthorized)?;
    let sessions = state.registry.list();
    let active = sessions
        .iter()
        .filter(|s| s.status == relay_protocol::DescriptorStatus::Active)
        .count();
    Ok(Json(SessionsResponse {
        total: sessions.len(),
        active,
        sessions,
    }))
}

enum ApiError {
    /// Differentiated status per error variant — used where the route's
    /// documented status table distinguishes expired/revoked/unknown.
    Auth(AuthError),
    /// Same underlying errors, collapsed to 401 — used where the route's
    /// documented status table lists only `401` regardless of cause.
    Unauthorized(AuthError),
    NotFound,
    Internal,
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::Auth(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match self {
            ApiError::Auth(AuthError::Unknown) => (StatusCode::UNAUTHORIZED, "unknown", "unknown token or credential"),
            ApiError::Auth(AuthError::AlreadyConsumed) => (StatusCode::CONFLICT, "already_consumed", "token already used"),
            ApiError::Auth(AuthError::Expired) => (StatusCode::GONE, "expired", "token or credential expired"),
            ApiError::Auth(AuthError::Revoked) => (StatusCode::FORBIDDEN, "revoked", "credential revoked"),
            ApiError::Unauthorized(AuthError::Unknown) => (StatusCode::UNAUTHORIZED, "unknown", "unknown credential"),
            ApiError::Unauthorized(AuthError::AlreadyConsumed) => (StatusCode::UNAUTHORIZED, "unknown", "credential not valid"),
            ApiError::Unauthorized(AuthError::Expired) => (StatusCode::UNAUTHORIZED, "expired", "credential expired"),
            ApiError::Unauthorized(AuthError::Revoked) => (StatusCode::UNAUTHORIZED, "revoked", "credential revoked"),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not_found", "no such credential"),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error"),
        };
        (status, Json(serde_json::json!({ "code": code, "message": message }))).into_response()
    }
}
