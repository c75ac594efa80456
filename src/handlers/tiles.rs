use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Deserialize;

use crate::AppState;
use crate::models::provider::BoundingBox;
use crate::tile_cache::{self, TileRef};

#[derive(Debug, Deserialize)]
pub struct CheckTilesRequest {
    pub tiles: Vec<TileRef>,
}

/// Batch cache check for a set of tiles.
pub async fn check_tile_cache(
    State(state): State<AppState>,
    Json(req): Json<CheckTilesRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let batch = tile_cache::check_batch(&state.store, &req.tiles)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(batch))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteTileRequest {
    pub tile_key: String,
    pub zoom: u8,
    pub place_keys: Vec<String>,
    #[serde(default = "default_provider")]
    pub provider: String,
}

fn default_provider() -> String {
    crate::gateway::PROVIDER_NAME.to_string()
}

/// Full-refresh write of one tile. Payload is place keys only.
pub async fn write_tile_cache(
    State(state): State<AppState>,
    Json(req): Json<WriteTileRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    tile_cache::write(&state.store, &req.tile_key, req.zoom, &req.place_keys, &req.provider)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(serde_json::json!({
        "tileKey": req.tile_key,
        "stored": req.place_keys.len().min(tile_cache::CHUNK_SIZE * tile_cache::MAX_CHUNKS),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ViewportRequest {
    pub bounds: BoundingBox,
    pub zoom: u8,
}

/// Tile set for a viewport plus each tile's cache state.
pub async fn tiles_for_viewport(
    State(state): State<AppState>,
    Json(req): Json<ViewportRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let batch = tile_cache::tiles_for_viewport(&state.store, &req.bounds, req.zoom)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(batch))
}
