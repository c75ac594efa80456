//! Metric ingest and windowed queries.
//!
//! Emission is fire-and-forget through an unbounded channel; a background
//! writer batches events into the store. Queries pull raw values for a
//! window and compute nearest-rank percentiles in memory.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;

use crate::models::metrics::{CacheHitRate, MetricEvent, MetricSummary};
use crate::store::{Store, format_ts};

pub const API_CALL_SUCCESS: &str = "api_call_success";
pub const API_CALL_ERROR: &str = "api_call_error";
pub const CACHE_HIT: &str = "cache_hit";
pub const CACHE_MISS: &str = "cache_miss";
pub const SEARCH_LATENCY: &str = "search_latency";
pub const REQUEST_SHED: &str = "request_shed";

const FLUSH_INTERVAL_SECS: u64 = 5;
const FLUSH_AT: usize = 500;

/// Handle for emitting metric events. Never blocks the caller.
#[derive(Clone)]
pub struct MetricsSink {
    tx: mpsc::UnboundedSender<MetricEvent>,
}

impl MetricsSink {
    pub fn emit(&self, event: MetricEvent) {
        let _ = self.tx.send(event);
    }
}

/// Spawn the background metric writer and return the sink handle.
pub fn spawn(store: Arc<Store>) -> MetricsSink {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(writer(rx, store));
    MetricsSink { tx }
}

async fn writer(mut rx: mpsc::UnboundedReceiver<MetricEvent>, store: Arc<Store>) {
    let mut buffer: Vec<MetricEvent> = Vec::new();
    let mut interval = tokio::time::interval(StdDuration::from_secs(FLUSH_INTERVAL_SECS));
    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= FLUSH_AT {
                            flush(&store, std::mem::take(&mut buffer));
                        }
                    }
                    // All senders dropped: final flush and stop.
                    None => {
                        flush(&store, std::mem::take(&mut buffer));
                        return;
                    }
                }
            }
            _ = interval.tick() => {
                if !buffer.is_empty() {
                    flush(&store, std::mem::take(&mut buffer));
                }
            }
        }
    }
}

fn flush(store: &Store, batch: Vec<MetricEvent>) {
    if batch.is_empty() {
        return;
    }
    let n = batch.len();
    if let Err(e) = store.metrics_insert_batch(&batch) {
        tracing::warn!("metrics: failed to flush {n} events: {e}");
    } else {
        tracing::debug!("metrics: flushed {n} events");
    }
}

/// Nearest-rank percentile over a sorted slice: index floor(n × q), clamped
/// to the last element when the rank overshoots.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * q).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

pub fn summarize(values: &mut [f64]) -> MetricSummary {
    if values.is_empty() {
        return MetricSummary {
            count: 0,
            sum: 0.0,
            avg: 0.0,
            min: 0.0,
            max: 0.0,
            p50: 0.0,
            p95: 0.0,
            p99: 0.0,
        };
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let count = values.len() as u64;
    let sum: f64 = values.iter().sum();
    MetricSummary {
        count,
        sum,
        avg: sum / count as f64,
        min: values[0],
        max: values[values.len() - 1],
        p50: percentile(values, 0.50),
        p95: percentile(values, 0.95),
        p99: percentile(values, 0.99),
    }
}

/// Summary of one metric over the trailing window.
pub fn summary(
    store: &Store,
    name: &str,
    window_minutes: i64,
    endpoint: Option<&str>,
    now: DateTime<Utc>,
) -> anyhow::Result<MetricSummary> {
    let since = format_ts(now - Duration::minutes(window_minutes));
    let mut values = store.metrics_values(name, &since, endpoint)?;
    Ok(summarize(&mut values))
}

/// Hit rate across the cache probe events, optionally per endpoint.
pub fn cache_hit_rate(
    store: &Store,
    endpoint: Option<&str>,
    window_minutes: i64,
    now: DateTime<Utc>,
) -> anyhow::Result<CacheHitRate> {
    let since = format_ts(now - Duration::minutes(window_minutes));
    let hits = store.metrics_count(CACHE_HIT, &since, endpoint)?;
    let misses = store.metrics_count(CACHE_MISS, &since, endpoint)?;
    let total = hits + misses;
    let hit_rate = if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    };
    Ok(CacheHitRate {
        hits,
        misses,
        hit_rate,
    })
}

/// errors / (errors + successes) over the window. None when no calls landed.
pub fn error_rate(
    store: &Store,
    window_minutes: i64,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<f64>> {
    let since = format_ts(now - Duration::minutes(window_minutes));
    let errors = store.metrics_count(API_CALL_ERROR, &since, None)?;
    let successes = store.metrics_count(API_CALL_SUCCESS, &since, None)?;
    let total = errors + successes;
    if total == 0 {
        return Ok(None);
    }
    Ok(Some(errors as f64 / total as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn percentile_uses_floor_rank_and_clamps() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert_eq!(percentile(&values, 0.50), 6.0);
        assert_eq!(percentile(&values, 0.95), 10.0);
        assert_eq!(percentile(&values, 0.99), 10.0);
        assert_eq!(percentile(&[42.0], 0.95), 42.0);
        assert_eq!(percentile(&[], 0.95), 0.0);
    }

    #[test]
    fn summarize_computes_the_full_shape() {
        let mut values = vec![30.0, 10.0, 20.0];
        let s = summarize(&mut values);
        assert_eq!(s.count, 3);
        assert_eq!(s.sum, 60.0);
        assert_eq!(s.avg, 20.0);
        assert_eq!(s.min, 10.0);
        assert_eq!(s.max, 30.0);
        assert_eq!(s.p50, 20.0);
    }

    #[test]
    fn windowed_summary_excludes_old_events() {
        let store = Store::open_in_memory().unwrap();
        let now = DateTime::parse_from_rfc3339("2026-08-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut fresh = MetricEvent::new(SEARCH_LATENCY, 100.0, ts("2026-08-01T11:58:00Z"));
        fresh.endpoint = Some("text_search".to_string());
        let stale = MetricEvent::new(SEARCH_LATENCY, 9000.0, ts("2026-08-01T11:00:00Z"));
        store.metrics_insert_batch(&[fresh, stale]).unwrap();

        let s = summary(&store, SEARCH_LATENCY, 10, None, now).unwrap();
        assert_eq!(s.count, 1);
        assert_eq!(s.max, 100.0);

        let by_endpoint = summary(&store, SEARCH_LATENCY, 10, Some("text_search"), now).unwrap();
        assert_eq!(by_endpoint.count, 1);
        let other = summary(&store, SEARCH_LATENCY, 10, Some("autocomplete"), now).unwrap();
        assert_eq!(other.count, 0);
    }

    #[test]
    fn hit_rate_partitions_hits_and_misses() {
        let store = Store::open_in_memory().unwrap();
        let now = DateTime::parse_from_rfc3339("2026-08-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let t = ts("2026-08-01T11:59:00Z");
        store
            .metrics_insert_batch(&[
                MetricEvent::new(CACHE_HIT, 1.0, t.clone()),
                MetricEvent::new(CACHE_HIT, 1.0, t.clone()),
                MetricEvent::new(CACHE_HIT, 1.0, t.clone()),
                MetricEvent::new(CACHE_MISS, 1.0, t.clone()),
            ])
            .unwrap();
        let rate = cache_hit_rate(&store, None, 60, now).unwrap();
        assert_eq!(rate.hits, 3);
        assert_eq!(rate.misses, 1);
        assert_eq!(rate.hit_rate, 0.75);
    }

    #[test]
    fn error_rate_is_none_without_traffic() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        assert_eq!(error_rate(&store, 5, now).unwrap(), None);
        store
            .metrics_insert_batch(&[
                MetricEvent::new(API_CALL_SUCCESS, 12.0, format_ts(now)),
                MetricEvent::new(API_CALL_ERROR, 0.0, format_ts(now)),
            ])
            .unwrap();
        assert_eq!(error_rate(&store, 5, now).unwrap(), Some(0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn sink_flushes_on_the_interval() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let sink = spawn(store.clone());
        sink.emit(MetricEvent::new(API_CALL_SUCCESS, 42.0, format_ts(Utc::now())));
        tokio::time::sleep(StdDuration::from_secs(FLUSH_INTERVAL_SECS + 2)).await;
        let count = store
            .metrics_count(API_CALL_SUCCESS, "1970-01-01T00:00:00Z", None)
            .unwrap();
        assert_eq!(count, 1);
    }
}
