//! Geohash-tile cache for map viewports. ID-only, chunked, full-refresh
//! writes. A tile is only a hit when every chunk is unexpired; missing or
//! stale chunks turn the whole tile into a miss, so a partially-written tile
//! is never observable.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::geohash;
use crate::models::provider::BoundingBox;
use crate::store::{Store, format_ts, now_ts};

pub const TTL_MINUTES: i64 = 45;
pub const CHUNK_SIZE: usize = 100;
pub const MAX_CHUNKS: usize = 10;
const PURGE_BATCH: u32 = 500;

/// One stored chunk of a tile.
#[derive(Debug, Clone)]
pub struct TileChunk {
    pub chunk_index: i64,
    pub place_keys: Vec<String>,
    pub expires_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TileHit {
    pub tile_key: String,
    pub place_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileRef {
    pub tile_key: String,
    pub zoom: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct TileBatch {
    pub hits: Vec<TileHit>,
    pub misses: Vec<TileRef>,
}

/// `gh:{precision}:{geohash}`.
pub fn tile_key(hash: &str) -> String {
    format!("gh:{}:{}", hash.len(), hash)
}

/// Concatenated place keys for the tile, or None when any chunk is missing
/// or expired.
pub fn lookup(store: &Store, tile_key: &str, zoom: u8) -> anyhow::Result<Option<Vec<String>>> {
    let chunks = store.tile_chunks(tile_key, zoom)?;
    if chunks.is_empty() {
        return Ok(None);
    }
    let now = now_ts();
    if chunks.iter().any(|c| c.expires_at <= now) {
        return Ok(None);
    }
    let mut keys = Vec::new();
    for chunk in chunks {
        keys.extend(chunk.place_keys);
    }
    Ok(Some(keys))
}

/// Full refresh: drop existing chunks, truncate the input to the tile cap,
/// insert ceil(len/chunk) chunks. An empty input still writes one empty
/// chunk so the tile reads as "checked and empty" rather than unknown.
pub fn write(
    store: &Store,
    tile_key: &str,
    zoom: u8,
    place_keys: &[String],
    provider: &str,
) -> anyhow::Result<()> {
    let capped = &place_keys[..place_keys.len().min(CHUNK_SIZE * MAX_CHUNKS)];
    let mut chunks: Vec<Vec<String>> = capped.chunks(CHUNK_SIZE).map(|c| c.to_vec()).collect();
    if chunks.is_empty() {
        chunks.push(Vec::new());
    }
    let now = Utc::now();
    store.tile_cache_replace(
        tile_key,
        zoom,
        &chunks,
        provider,
        &format_ts(now),
        &format_ts(now + Duration::minutes(TTL_MINUTES)),
    )
}

/// One-pass classification of a tile set into hits and misses.
pub fn check_batch(store: &Store, tiles: &[TileRef]) -> anyhow::Result<TileBatch> {
    let mut hits = Vec::new();
    let mut misses = Vec::new();
    for tile in tiles {
        match lookup(store, &tile.tile_key, tile.zoom)? {
            Some(place_keys) => hits.push(TileHit {
                tile_key: tile.tile_key.clone(),
                place_keys,
            }),
            None => misses.push(tile.clone()),
        }
    }
    Ok(TileBatch { hits, misses })
}

/// Tile set for a viewport plus its cache state in one call.
pub fn tiles_for_viewport(
    store: &Store,
    bounds: &BoundingBox,
    zoom: u8,
) -> anyhow::Result<TileBatch> {
    let refs: Vec<TileRef> = geohash::tiles_for_bounds(bounds, zoom)
        .into_iter()
        .map(|hash| TileRef {
            tile_key: tile_key(&hash),
            zoom,
        })
        .collect();
    check_batch(store, &refs)
}

pub fn purge_expired(store: &Store) -> anyhow::Result<usize> {
    store.tile_cache_purge_expired(&now_ts(), PURGE_BATCH)
}
