use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;

use crate::AppState;
use crate::models::search::LogSearchRequest;
use crate::searches;

/// Identity arrives as `X-User-Id` set by the upstream auth proxy.
fn user_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Log a search. Silently a no-op for anonymous callers and PII queries.
pub async fn log_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<LogSearchRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let logged = searches::log_recent_search(
        &state.store,
        user_id(&headers),
        &req.query,
        req.city.as_deref(),
        req.result_count.unwrap_or(0),
        Utc::now(),
    )
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "logged": logged })))
}

#[derive(Debug, Deserialize)]
pub struct PopularQuery {
    pub city: Option<String>,
    pub limit: Option<u32>,
}

pub async fn popular_searches(
    State(state): State<AppState>,
    Query(params): Query<PopularQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let limit = params.limit.unwrap_or(10).min(50);
    let popular = searches::popular_searches(&state.store, params.city.as_deref(), limit)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "searches": popular })))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<u32>,
}

pub async fn my_recent_searches(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<RecentQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let Some(user) = user_id(&headers) else {
        return Err((StatusCode::UNAUTHORIZED, "authentication required".to_string()));
    };
    let limit = params.limit.unwrap_or(10).min(50);
    let recent = searches::my_recent_searches(&state.store, user, limit)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "searches": recent })))
}

pub async fn clear_my_search_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let Some(user) = user_id(&headers) else {
        return Err((StatusCode::UNAUTHORIZED, "authentication required".to_string()));
    };
    let deleted = searches::clear_my_history(&state.store, user)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
