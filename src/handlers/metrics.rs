use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;

use crate::AppState;
use crate::metrics;

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub name: String,
    pub minutes: Option<i64>,
    pub endpoint: Option<String>,
}

/// Windowed percentile summary for one metric name.
pub async fn metric_summary(
    State(state): State<AppState>,
    Query(params): Query<SummaryQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let minutes = params.minutes.unwrap_or(60).clamp(1, 24 * 60);
    let summary = metrics::summary(
        &state.store,
        &params.name,
        minutes,
        params.endpoint.as_deref(),
        Utc::now(),
    )
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({
        "name": params.name,
        "windowMinutes": minutes,
        "summary": summary,
    })))
}

#[derive(Debug, Deserialize)]
pub struct HitRateQuery {
    pub minutes: Option<i64>,
    pub endpoint: Option<String>,
}

pub async fn cache_hit_rate(
    State(state): State<AppState>,
    Query(params): Query<HitRateQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let minutes = params.minutes.unwrap_or(60).clamp(1, 24 * 60);
    let rate = metrics::cache_hit_rate(
        &state.store,
        params.endpoint.as_deref(),
        minutes,
        Utc::now(),
    )
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(rate))
}
