//! Background retention enforcement: hourly cache purges and a daily sweep
//! of metric events past their retention window. Heavy deletes run in
//! batches so a pass never holds the store for long.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::search_cache;
use crate::store::{Store, format_ts};
use crate::tile_cache;

pub const DEFAULT_METRICS_RETENTION_DAYS: i64 = 7;

const CACHE_PURGE_INTERVAL_SECS: u64 = 3600;
const METRICS_PURGE_INTERVAL_SECS: u64 = 24 * 3600;
const METRICS_PURGE_BATCH: u32 = 1000;
/// Upper bound on batches per pass; the next pass picks up the rest.
const MAX_BATCHES_PER_PASS: u32 = 100;

/// Spawn the retention loops (fire-and-forget).
pub fn spawn_retention_enforcer(store: Arc<Store>, metrics_retention_days: i64) {
    {
        let store = store.clone();
        tokio::spawn(async move {
            // Let startup settle before the first purge.
            tokio::time::sleep(Duration::from_secs(60)).await;
            let mut interval = tokio::time::interval(Duration::from_secs(CACHE_PURGE_INTERVAL_SECS));
            loop {
                interval.tick().await;
                purge_caches(&store);
            }
        });
    }
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(120)).await;
        let mut interval = tokio::time::interval(Duration::from_secs(METRICS_PURGE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            purge_metrics(&store, metrics_retention_days);
        }
    });
}

fn purge_caches(store: &Store) {
    match search_cache::purge_expired(store) {
        Ok(0) => {}
        Ok(n) => tracing::info!("retention: purged {n} expired search cache rows"),
        Err(e) => tracing::warn!("retention: search cache purge failed: {e}"),
    }
    match tile_cache::purge_expired(store) {
        Ok(0) => {}
        Ok(n) => tracing::info!("retention: purged {n} expired tile chunks"),
        Err(e) => tracing::warn!("retention: tile cache purge failed: {e}"),
    }
}

fn purge_metrics(store: &Store, retention_days: i64) {
    let cutoff = format_ts(Utc::now() - ChronoDuration::days(retention_days));
    let mut total = 0usize;
    for _ in 0..MAX_BATCHES_PER_PASS {
        match store.metrics_purge_before(&cutoff, METRICS_PURGE_BATCH) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) => {
                tracing::warn!("retention: metrics purge failed: {e}");
                break;
            }
        }
    }
    if total > 0 {
        tracing::info!("retention: purged {total} metric events older than {cutoff}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metrics::MetricEvent;

    #[test]
    fn metrics_purge_respects_the_cutoff() {
        let store = Store::open_in_memory().unwrap();
        store
            .metrics_insert_batch(&[
                MetricEvent::new("api_call_success", 1.0, "2026-07-01T00:00:00Z".to_string()),
                MetricEvent::new("api_call_success", 1.0, format_ts(Utc::now())),
            ])
            .unwrap();
        purge_metrics(&store, DEFAULT_METRICS_RETENTION_DAYS);
        let remaining = store
            .metrics_count("api_call_success", "1970-01-01T00:00:00Z", None)
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn cache_purge_sweeps_both_caches() {
        let store = Store::open_in_memory().unwrap();
        store
            .search_cache_write(
                "q:stale|l:en",
                &["g:x".to_string()],
                "google",
                "2026-01-01T00:00:00Z",
                "2026-01-01T00:15:00Z",
            )
            .unwrap();
        store
            .tile_cache_replace(
                "gh:5:evd7f",
                12,
                &[vec!["g:y".to_string()]],
                "google",
                "2026-01-01T00:00:00Z",
                "2026-01-01T00:45:00Z",
            )
            .unwrap();
        purge_caches(&store);
        assert!(store
            .search_cache_lookup("q:stale|l:en", "2026-01-01T00:00:01Z")
            .unwrap()
            .is_none());
        assert!(store.tile_chunks("gh:5:evd7f", 12).unwrap().is_empty());
    }
}
