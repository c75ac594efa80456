use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;

use crate::AppState;
use crate::models::mode::SetModeRequest;

pub async fn get_service_mode(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let record = state
        .mode
        .current(Utc::now())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let flags = state
        .store
        .flags_all()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "mode": record, "flags": flags })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}

pub async fn get_service_mode_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let limit = params.limit.unwrap_or(20).min(200);
    let history = state
        .mode
        .history(limit)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({ "history": history })))
}

/// Manual mode override. Reasons are recorded with a `manual_` prefix.
pub async fn set_service_mode(
    State(state): State<AppState>,
    Json(req): Json<SetModeRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if !(0..=3).contains(&req.mode) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("INVALID_INPUT: mode must be an integer 0..3, got {}", req.mode),
        ));
    }
    let reason = format!(
        "manual_{}",
        req.reason.as_deref().unwrap_or("override").trim().replace(' ', "_")
    );
    let record = state
        .mode
        .set_mode(req.mode, &reason, Utc::now())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(record))
}
