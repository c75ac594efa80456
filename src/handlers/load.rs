use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use crate::AppState;

pub async fn get_load_state(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let snapshot = state
        .shedder
        .snapshot()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(snapshot))
}
