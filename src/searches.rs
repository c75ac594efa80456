//! Search-popularity pipeline: PII-filtered raw log with a strict 24 h
//! lifetime, and k-anonymous daily aggregates kept for 30 days.
//!
//! User IDs are hashed before they touch the store; queries that look like
//! contact details never get logged at all.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use regex::Regex;
use uuid::Uuid;

use crate::models::search::{PopularSearch, RecentSearch, RecentSearchRow, SearchAggregateRow};
use crate::store::{Store, format_ts};

pub const K_ANONYMITY_THRESHOLD: i64 = 20;
pub const RAW_RETENTION_HOURS: i64 = 24;
pub const AGGREGATE_RETENTION_DAYS: i64 = 30;
pub const GLOBAL_CITY: &str = "global";

const RAW_PURGE_BATCH: u32 = 500;
const AGGREGATE_PURGE_BATCH: u32 = 500;
const MAX_QUERY_CHARS: usize = 200;

const AGGREGATION_HOUR_UTC: u32 = 4;
const AGGREGATE_PURGE_HOUR_UTC: u32 = 5;
const RAW_PURGE_INTERVAL_SECS: u64 = 6 * 3600;

fn pii_patterns() -> &'static [Regex; 4] {
    static PATTERNS: OnceLock<[Regex; 4]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            // Email addresses
            Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap(),
            // Long digit runs (phone numbers with or without separators)
            Regex::new(r"[0-9][0-9 .-]{8,}[0-9]").unwrap(),
            // Moroccan phone formats
            Regex::new(r"(\+212|0)[5-7]([ .-]?[0-9]){8}").unwrap(),
            // URLs
            Regex::new(r"(?i)(https?://|www\.)\S+").unwrap(),
        ]
    })
}

/// True when the raw query looks like contact details rather than a search.
pub fn contains_pii(query: &str) -> bool {
    pii_patterns().iter().any(|re| re.is_match(query))
}

/// Fold the accented latin characters common in Moroccan French queries so
/// "pâtisserie" and "patisserie" aggregate together.
fn fold_char(c: char) -> char {
    match c {
        'à' | 'â' | 'ä' | 'á' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'î' | 'ï' | 'í' => 'i',
        'ô' | 'ö' | 'ó' => 'o',
        'ù' | 'û' | 'ü' | 'ú' => 'u',
        'ç' => 'c',
        'ñ' => 'n',
        other => other,
    }
}

pub fn normalize(query: &str) -> String {
    query
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .map(fold_char)
        .take(MAX_QUERY_CHARS)
        .collect()
}

pub fn hash_user_id(user_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Log one search. No-op (returning false) for anonymous callers and for
/// queries that fail the PII filter.
pub fn log_recent_search(
    store: &Store,
    user_id: Option<&str>,
    query: &str,
    city: Option<&str>,
    result_count: i64,
    now: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let Some(user_id) = user_id else {
        return Ok(false);
    };
    if query.trim().is_empty() || contains_pii(query) {
        return Ok(false);
    }
    let row = RecentSearchRow {
        id: Uuid::new_v4().to_string(),
        user_hash: hash_user_id(user_id),
        query: query.trim().to_string(),
        normalized_query: normalize(query),
        city: city
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty()),
        result_count,
        searched_at: format_ts(now),
    };
    store.recent_search_insert(&row)?;
    Ok(true)
}

pub fn my_recent_searches(
    store: &Store,
    user_id: &str,
    limit: u32,
) -> anyhow::Result<Vec<RecentSearch>> {
    let rows = store.recent_searches_for_user(&hash_user_id(user_id), limit)?;
    Ok(rows.into_iter().map(RecentSearch::from).collect())
}

pub fn clear_my_history(store: &Store, user_id: &str) -> anyhow::Result<usize> {
    store.recent_searches_clear_user(&hash_user_id(user_id))
}

/// Popular searches for a city (or the global bucket). Exposes counts only;
/// unique-user numbers stay server-side.
pub fn popular_searches(
    store: &Store,
    city: Option<&str>,
    limit: u32,
) -> anyhow::Result<Vec<PopularSearch>> {
    let city = city
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| GLOBAL_CITY.to_string());
    let rows = store.search_aggregates_popular(&city, limit)?;
    Ok(rows.into_iter().map(PopularSearch::from).collect())
}

/// The 24 h window ending at today's (or yesterday's) aggregation hour, so
/// re-running the job within a day stays idempotent.
fn aggregation_window(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let today_run = now
        .date_naive()
        .and_hms_opt(AGGREGATION_HOUR_UTC, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now);
    let end = if now >= today_run {
        today_run
    } else {
        today_run - ChronoDuration::hours(24)
    };
    (end - ChronoDuration::hours(24), end)
}

/// Daily aggregation pass. Groups the last 24 h of raw searches per city and
/// globally, discards groups below the k-anonymity floor, and upserts the
/// rest. Returns how many aggregate rows were written.
pub fn aggregate_daily(store: &Store, now: DateTime<Utc>) -> anyhow::Result<usize> {
    let (start, end) = aggregation_window(now);
    let from = format_ts(start);
    let to = format_ts(end);
    let mut written = 0;

    for (city, normalized_query, count, unique_users) in
        store.search_groups_by_city(&from, &to, K_ANONYMITY_THRESHOLD)?
    {
        store.search_aggregate_upsert(&SearchAggregateRow {
            id: Uuid::new_v4().to_string(),
            normalized_query,
            city,
            count,
            unique_users,
            period_start: from.clone(),
            period_end: to.clone(),
        })?;
        written += 1;
    }
    for (normalized_query, count, unique_users) in
        store.search_groups_global(&from, &to, K_ANONYMITY_THRESHOLD)?
    {
        store.search_aggregate_upsert(&SearchAggregateRow {
            id: Uuid::new_v4().to_string(),
            normalized_query,
            city: GLOBAL_CITY.to_string(),
            count,
            unique_users,
            period_start: from.clone(),
            period_end: to.clone(),
        })?;
        written += 1;
    }
    if written > 0 {
        tracing::info!("search aggregation: wrote {written} rows for {from}..{to}");
    }
    Ok(written)
}

/// Raw rows older than 24 h, in batches.
pub fn purge_raw(store: &Store, now: DateTime<Utc>) -> anyhow::Result<usize> {
    let cutoff = format_ts(now - ChronoDuration::hours(RAW_RETENTION_HOURS));
    store.recent_searches_purge_before(&cutoff, RAW_PURGE_BATCH)
}

/// Aggregates older than 30 d, in batches.
pub fn purge_aggregates(store: &Store, now: DateTime<Utc>) -> anyhow::Result<usize> {
    let cutoff = format_ts(now - ChronoDuration::days(AGGREGATE_RETENTION_DAYS));
    store.search_aggregates_purge_before(&cutoff, AGGREGATE_PURGE_BATCH)
}

fn secs_until_utc_hour(now: DateTime<Utc>, hour: u32) -> u64 {
    let today = now
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now);
    let next = if today > now {
        today
    } else {
        today + ChronoDuration::hours(24)
    };
    (next - now).num_seconds().max(0) as u64
}

/// Spawn the three maintenance loops: 6-hourly raw purge, daily aggregation
/// at 04:00 UTC, daily aggregate purge at 05:00 UTC.
pub fn spawn_search_maintenance(store: Arc<Store>) {
    {
        let store = store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(RAW_PURGE_INTERVAL_SECS));
            loop {
                interval.tick().await;
                match purge_raw(&store, Utc::now()) {
                    Ok(0) => {}
                    Ok(n) => tracing::info!("search maintenance: purged {n} raw rows"),
                    Err(e) => tracing::error!("search maintenance: raw purge failed: {e}"),
                }
            }
        });
    }
    {
        let store = store.clone();
        tokio::spawn(async move {
            loop {
                let wait = secs_until_utc_hour(Utc::now(), AGGREGATION_HOUR_UTC);
                tokio::time::sleep(Duration::from_secs(wait)).await;
                if let Err(e) = aggregate_daily(&store, Utc::now()) {
                    tracing::error!("search maintenance: aggregation failed: {e}");
                }
            }
        });
    }
    tokio::spawn(async move {
        loop {
            let wait = secs_until_utc_hour(Utc::now(), AGGREGATE_PURGE_HOUR_UTC);
            tokio::time::sleep(Duration::from_secs(wait)).await;
            match purge_aggregates(&store, Utc::now()) {
                Ok(0) => {}
                Ok(n) => tracing::info!("search maintenance: purged {n} aggregates"),
                Err(e) => tracing::error!("search maintenance: aggregate purge failed: {e}"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn pii_filter_catches_the_contact_shapes() {
        assert!(contains_pii("contact me at foo@bar.com"));
        assert!(contains_pii("0612345678"));
        assert!(contains_pii("+212612345678"));
        assert!(contains_pii("06 12 34 56 78"));
        assert!(contains_pii("see http://x"));
        assert!(contains_pii("WWW.EXAMPLE.COM/menu"));
        assert!(!contains_pii("couscous"));
        assert!(!contains_pii("restaurant 2026"));
        assert!(!contains_pii("riad 4 stars"));
    }

    #[test]
    fn normalization_folds_case_space_and_accents() {
        assert_eq!(normalize("  Pâtisserie   Amandine "), "patisserie amandine");
        assert_eq!(normalize("CAFÉ"), "cafe");
        let long = "x".repeat(300);
        assert_eq!(normalize(&long).chars().count(), 200);
    }

    #[test]
    fn anonymous_and_pii_queries_are_never_logged() {
        let store = Store::open_in_memory().unwrap();
        let now = ts("2026-08-01T10:00:00Z");
        assert!(!log_recent_search(&store, None, "couscous", None, 5, now).unwrap());
        assert!(
            !log_recent_search(&store, Some("u1"), "contact me at foo@bar.com", None, 5, now)
                .unwrap()
        );
        assert!(!log_recent_search(&store, Some("u1"), "0612345678", None, 0, now).unwrap());
        assert!(my_recent_searches(&store, "u1", 10).unwrap().is_empty());
    }

    #[test]
    fn raw_log_stores_hashed_user_and_normalized_query() {
        let store = Store::open_in_memory().unwrap();
        let now = ts("2026-08-01T10:00:00Z");
        assert!(
            log_recent_search(&store, Some("user-1"), " Tagine  Royal ", Some("Marrakech"), 12, now)
                .unwrap()
        );
        let rows = store
            .recent_searches_for_user(&hash_user_id("user-1"), 10)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].normalized_query, "tagine royal");
        assert_eq!(rows[0].city.as_deref(), Some("marrakech"));
        assert_ne!(rows[0].user_hash, "user-1");

        let mine = my_recent_searches(&store, "user-1", 10).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].query, "Tagine  Royal");
    }

    #[test]
    fn aggregation_enforces_the_k_anonymity_floor() {
        let store = Store::open_in_memory().unwrap();
        let logged_at = ts("2026-08-01T10:00:00Z");
        // 25 distinct users search couscous in casablanca
        for i in 0..25 {
            log_recent_search(
                &store,
                Some(&format!("user-{i}")),
                "couscous",
                Some("casablanca"),
                10,
                logged_at,
            )
            .unwrap();
        }
        // 5 users search something niche
        for i in 0..5 {
            log_recent_search(
                &store,
                Some(&format!("user-{i}")),
                "secret garden",
                Some("casablanca"),
                2,
                logged_at,
            )
            .unwrap();
        }
        let run_at = ts("2026-08-02T04:00:00Z");
        let written = aggregate_daily(&store, run_at).unwrap();
        // couscous appears per-city and globally
        assert_eq!(written, 2);

        let popular = popular_searches(&store, Some("casablanca"), 10).unwrap();
        assert_eq!(popular.len(), 1);
        assert_eq!(popular[0].normalized_query, "couscous");
        assert!(popular[0].count >= 25);

        let global = popular_searches(&store, None, 10).unwrap();
        assert_eq!(global.len(), 1);
        assert_eq!(global[0].city, GLOBAL_CITY);
    }

    #[test]
    fn aggregation_is_idempotent_for_a_period() {
        let store = Store::open_in_memory().unwrap();
        let logged_at = ts("2026-08-01T10:00:00Z");
        for i in 0..22 {
            log_recent_search(&store, Some(&format!("u{i}")), "harira", Some("fes"), 3, logged_at)
                .unwrap();
        }
        let run_at = ts("2026-08-02T04:10:00Z");
        aggregate_daily(&store, run_at).unwrap();
        aggregate_daily(&store, run_at + ChronoDuration::minutes(30)).unwrap();
        let popular = popular_searches(&store, Some("fes"), 10).unwrap();
        assert_eq!(popular.len(), 1);
        assert_eq!(popular[0].count, 22);
    }

    #[test]
    fn raw_purge_enforces_the_24h_lifetime() {
        let store = Store::open_in_memory().unwrap();
        log_recent_search(&store, Some("u1"), "old query", None, 1, ts("2026-08-01T00:00:00Z"))
            .unwrap();
        log_recent_search(&store, Some("u1"), "new query", None, 1, ts("2026-08-02T09:00:00Z"))
            .unwrap();
        let purged = purge_raw(&store, ts("2026-08-02T10:00:00Z")).unwrap();
        assert_eq!(purged, 1);
        let rows = my_recent_searches(&store, "u1", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].query, "new query");
    }

    #[test]
    fn aggregate_purge_enforces_the_30d_retention() {
        let store = Store::open_in_memory().unwrap();
        store
            .search_aggregate_upsert(&SearchAggregateRow {
                id: "old".to_string(),
                normalized_query: "tagine".to_string(),
                city: GLOBAL_CITY.to_string(),
                count: 40,
                unique_users: 25,
                period_start: "2026-06-01T04:00:00Z".to_string(),
                period_end: "2026-06-02T04:00:00Z".to_string(),
            })
            .unwrap();
        let purged = purge_aggregates(&store, ts("2026-08-01T05:00:00Z")).unwrap();
        assert_eq!(purged, 1);
        assert!(popular_searches(&store, None, 10).unwrap().is_empty());
    }

    #[test]
    fn clear_history_removes_only_that_user() {
        let store = Store::open_in_memory().unwrap();
        let now = ts("2026-08-01T10:00:00Z");
        log_recent_search(&store, Some("u1"), "tagine", None, 1, now).unwrap();
        log_recent_search(&store, Some("u2"), "couscous", None, 1, now).unwrap();
        assert_eq!(clear_my_history(&store, "u1").unwrap(), 1);
        assert!(my_recent_searches(&store, "u1", 10).unwrap().is_empty());
        assert_eq!(my_recent_searches(&store, "u2", 10).unwrap().len(), 1);
    }

    #[test]
    fn aggregation_window_is_stable_within_a_day() {
        let (s1, e1) = aggregation_window(ts("2026-08-02T04:00:00Z"));
        let (s2, e2) = aggregation_window(ts("2026-08-02T15:30:00Z"));
        assert_eq!((s1, e1), (s2, e2));
        assert_eq!(format_ts(e1), "2026-08-02T04:00:00Z");
        assert_eq!(format_ts(s1), "2026-08-01T04:00:00Z");
        // Before the run hour the window still ends at yesterday's run
        let (_, e3) = aggregation_window(ts("2026-08-02T03:00:00Z"));
        assert_eq!(format_ts(e3), "2026-08-01T04:00:00Z");
    }
}
