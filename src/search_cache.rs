//! ID-only search-result cache. Stores place keys, never provider content.

use chrono::{Duration, Utc};

use crate::models::provider::{BoundingBox, LocationBias};
use crate::store::{Store, format_ts, now_ts};

pub const TTL_MINUTES: i64 = 15;
pub const MAX_PLACE_KEYS: usize = 50;
const PURGE_BATCH: u32 = 100;

#[derive(Debug, Clone, Default)]
pub struct SearchKeyParams<'a> {
    pub query: &'a str,
    pub city: Option<&'a str>,
    pub language: Option<&'a str>,
    pub location_bias: Option<LocationBias>,
    pub location_restriction: Option<BoundingBox>,
}

pub(crate) fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

pub fn normalize_query(q: &str) -> String {
    q.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic, human-readable cache key. The same inputs always produce
/// the same key; unrelated option fields never affect it.
pub fn generate_cache_key(p: &SearchKeyParams) -> String {
    let mut parts = vec![format!("q:{}", normalize_query(p.query))];
    if let Some(city) = p.city {
        let city = city.trim().to_lowercase();
        if !city.is_empty() {
            parts.push(format!("c:{city}"));
        }
    }
    parts.push(format!("l:{}", p.language.unwrap_or("en")));
    if let Some(lb) = p.location_bias {
        parts.push(format!(
            "lb:{},{},{}",
            round3(lb.lat),
            round3(lb.lng),
            lb.radius_meters
        ));
    }
    if let Some(lr) = p.location_restriction {
        parts.push(format!(
            "lr:{},{},{},{}",
            round3(lr.north),
            round3(lr.south),
            round3(lr.east),
            round3(lr.west)
        ));
    }
    parts.join("|")
}

/// Expired rows count as misses; the purge loop deletes them later.
pub fn lookup(store: &Store, cache_key: &str) -> anyhow::Result<Option<Vec<String>>> {
    store.search_cache_lookup(cache_key, &now_ts())
}

/// Upsert, truncated to the key cap, with a fresh TTL.
pub fn write(
    store: &Store,
    cache_key: &str,
    place_keys: &[String],
    provider: &str,
) -> anyhow::Result<()> {
    let keys = &place_keys[..place_keys.len().min(MAX_PLACE_KEYS)];
    let now = Utc::now();
    store.search_cache_write(
        cache_key,
        keys,
        provider,
        &format_ts(now),
        &format_ts(now + Duration::minutes(TTL_MINUTES)),
    )
}

pub fn purge_expired(store: &Store) -> anyhow::Result<usize> {
    store.search_cache_purge_expired(&now_ts(), PURGE_BATCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic() {
        let p = SearchKeyParams {
            query: "  Tagine   Restaurant ",
            city: Some("Marrakech"),
            language: None,
            location_bias: Some(LocationBias {
                lat: 31.62951,
                lng: -7.98111,
                radius_meters: 5000.0,
            }),
            location_restriction: None,
        };
        assert_eq!(generate_cache_key(&p), generate_cache_key(&p));
        assert_eq!(
            generate_cache_key(&p),
            "q:tagine restaurant|c:marrakech|l:en|lb:31.63,-7.981,5000"
        );
    }

    #[test]
    fn key_matches_the_wire_example() {
        let p = SearchKeyParams {
            query: "tagine",
            city: None,
            language: Some("en"),
            location_bias: Some(LocationBias {
                lat: 31.6295,
                lng: -7.9811,
                radius_meters: 5000.0,
            }),
            location_restriction: None,
        };
        assert_eq!(generate_cache_key(&p), "q:tagine|l:en|lb:31.63,-7.981,5000");
    }

    #[test]
    fn rounding_is_stable_at_three_decimals() {
        let a = SearchKeyParams {
            query: "cafe",
            location_bias: Some(LocationBias {
                lat: 31.629_500_1,
                lng: -7.981_099_9,
                radius_meters: 500.0,
            }),
            ..Default::default()
        };
        let b = SearchKeyParams {
            query: "cafe",
            location_bias: Some(LocationBias {
                lat: 31.629_500_2,
                lng: -7.981_100_1,
                radius_meters: 500.0,
            }),
            ..Default::default()
        };
        assert_eq!(generate_cache_key(&a), generate_cache_key(&b));
    }

    #[test]
    fn restriction_key_orders_n_s_e_w() {
        let p = SearchKeyParams {
            query: "riad",
            location_restriction: Some(BoundingBox {
                north: 31.66,
                south: 31.6,
                east: -7.95,
                west: -8.02,
            }),
            ..Default::default()
        };
        assert_eq!(generate_cache_key(&p), "q:riad|l:en|lr:31.66,31.6,-7.95,-8.02");
    }

    #[test]
    fn write_truncates_to_fifty_keys() {
        let store = Store::open_in_memory().unwrap();
        let keys: Vec<String> = (0..80).map(|i| format!("g:place{i}")).collect();
        write(&store, "q:big|l:en", &keys, "google").unwrap();
        let got = lookup(&store, "q:big|l:en").unwrap().unwrap();
        assert_eq!(got.len(), MAX_PLACE_KEYS);
        assert_eq!(got[0], "g:place0");
        assert_eq!(got[49], "g:place49");
    }

    #[test]
    fn expired_rows_miss_without_deletion() {
        let store = Store::open_in_memory().unwrap();
        store
            .search_cache_write(
                "q:old|l:en",
                &["g:x".to_string()],
                "google",
                "2026-01-01T00:00:00Z",
                "2026-01-01T00:15:00Z",
            )
            .unwrap();
        assert!(lookup(&store, "q:old|l:en").unwrap().is_none());
        // Still present until purged
        assert_eq!(purge_expired(&store).unwrap(), 1);
        assert_eq!(purge_expired(&store).unwrap(), 0);
    }

    #[test]
    fn write_refreshes_existing_entries() {
        let store = Store::open_in_memory().unwrap();
        write(&store, "q:k|l:en", &["g:a".to_string()], "google").unwrap();
        write(&store, "q:k|l:en", &["g:b".to_string(), "g:c".to_string()], "google").unwrap();
        let got = lookup(&store, "q:k|l:en").unwrap().unwrap();
        assert_eq!(got, vec!["g:b".to_string(), "g:c".to_string()]);
    }
}
