use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use std::sync::Mutex;

use crate::breaker::{CircuitState, CircuitStatus};
use crate::models::alert::{Alert, AlertThreshold};
use crate::models::metrics::MetricEvent;
use crate::models::mode::{FeatureFlag, ModeTransition, ModeTriggers, ServiceModeRecord};
use crate::models::search::{RecentSearchRow, SearchAggregateRow};
use crate::tile_cache::TileChunk;

/// Canonical timestamp format used across the store. Fixed-width, so
/// lexicographic comparison in SQL matches chronological order.
pub fn format_ts(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn now_ts() -> String {
    format_ts(Utc::now())
}

/// UTC day key used by budget counters and shed counts.
pub fn date_key(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d").to_string()
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS search_cache (
                cache_key  TEXT PRIMARY KEY,
                provider   TEXT NOT NULL DEFAULT 'google',
                place_keys TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_search_cache_expires ON search_cache(expires_at);

            CREATE TABLE IF NOT EXISTS tile_cache (
                tile_key    TEXT NOT NULL,
                zoom        INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                provider    TEXT NOT NULL DEFAULT 'google',
                place_keys  TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                expires_at  TEXT NOT NULL,
                PRIMARY KEY (tile_key, zoom, chunk_index)
            );
            CREATE INDEX IF NOT EXISTS idx_tile_cache_expires ON tile_cache(expires_at);

            CREATE TABLE IF NOT EXISTS budget_counters (
                endpoint_class   TEXT NOT NULL,
                date_key         TEXT NOT NULL,
                used_millicents  INTEGER NOT NULL DEFAULT 0,
                limit_millicents INTEGER NOT NULL,
                PRIMARY KEY (endpoint_class, date_key)
            );

            CREATE TABLE IF NOT EXISTS service_health (
                service              TEXT PRIMARY KEY,
                state                TEXT NOT NULL DEFAULT 'closed' CHECK(state IN ('closed','open','half_open')),
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_failure_at      TEXT,
                last_success_at      TEXT,
                opened_at            TEXT,
                half_open_attempts   INTEGER NOT NULL DEFAULT 0,
                updated_at           TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS feature_flags (
                key        TEXT PRIMARY KEY,
                enabled    INTEGER NOT NULL DEFAULT 1,
                reason     TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS service_mode (
                key              TEXT PRIMARY KEY CHECK(key = 'service_mode'),
                current_mode     INTEGER NOT NULL DEFAULT 0,
                reason           TEXT NOT NULL DEFAULT '',
                entered_at       TEXT NOT NULL,
                provider_healthy INTEGER NOT NULL DEFAULT 1,
                budget_ok        INTEGER NOT NULL DEFAULT 1,
                latency_ok       INTEGER NOT NULL DEFAULT 1,
                breaker_closed   INTEGER NOT NULL DEFAULT 1,
                updated_at       TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS service_mode_history (
                id         TEXT PRIMARY KEY,
                from_mode  INTEGER NOT NULL,
                to_mode    INTEGER NOT NULL,
                reason     TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_mode_history_created ON service_mode_history(created_at DESC);

            CREATE TABLE IF NOT EXISTS metrics (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                name         TEXT NOT NULL,
                value        REAL NOT NULL,
                endpoint     TEXT,
                cost_tier    TEXT,
                cache_hit    INTEGER,
                service_mode INTEGER,
                city         TEXT,
                timestamp    TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_name_ts ON metrics(name, timestamp);

            CREATE TABLE IF NOT EXISTS alert_thresholds (
                id              TEXT PRIMARY KEY,
                name            TEXT NOT NULL,
                metric          TEXT NOT NULL,
                op              TEXT NOT NULL CHECK(op IN ('>','>=','<','<=')),
                threshold       REAL NOT NULL,
                window_minutes  INTEGER NOT NULL DEFAULT 5,
                severity        TEXT NOT NULL DEFAULT 'warning' CHECK(severity IN ('warning','critical')),
                auto_mitigation TEXT,
                enabled         INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS alerts (
                id           TEXT PRIMARY KEY,
                threshold_id TEXT NOT NULL REFERENCES alert_thresholds(id) ON DELETE CASCADE,
                name         TEXT NOT NULL,
                severity     TEXT NOT NULL,
                value        REAL NOT NULL,
                threshold    REAL NOT NULL,
                message      TEXT NOT NULL,
                triggered_at TEXT NOT NULL,
                resolved_at  TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_threshold ON alerts(threshold_id, triggered_at DESC);

            CREATE TABLE IF NOT EXISTS recent_searches (
                id               TEXT PRIMARY KEY,
                user_hash        TEXT NOT NULL,
                query            TEXT NOT NULL,
                normalized_query TEXT NOT NULL,
                city             TEXT,
                result_count     INTEGER NOT NULL DEFAULT 0,
                searched_at      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_recent_searches_user ON recent_searches(user_hash, searched_at DESC);
            CREATE INDEX IF NOT EXISTS idx_recent_searches_time ON recent_searches(searched_at);

            CREATE TABLE IF NOT EXISTS search_aggregates (
                id               TEXT PRIMARY KEY,
                normalized_query TEXT NOT NULL,
                city             TEXT NOT NULL,
                count            INTEGER NOT NULL,
                unique_users     INTEGER NOT NULL,
                period_start     TEXT NOT NULL,
                period_end       TEXT NOT NULL,
                UNIQUE (city, normalized_query, period_start)
            );
            CREATE INDEX IF NOT EXISTS idx_search_aggregates_city ON search_aggregates(city, normalized_query);

            CREATE TABLE IF NOT EXISTS shed_counts (
                date_key TEXT NOT NULL,
                priority INTEGER NOT NULL,
                count    INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (date_key, priority)
            );
            ",
        )?;
        Ok(())
    }

    // ── Search-result cache ──

    /// Returns the cached place keys, or None when the row is absent or
    /// expired. Expired rows are left for the purge loop.
    pub fn search_cache_lookup(
        &self,
        cache_key: &str,
        now: &str,
    ) -> anyhow::Result<Option<Vec<String>>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT place_keys FROM search_cache WHERE cache_key = ?1 AND expires_at > ?2",
        )?;
        let mut rows = stmt.query_map(params![cache_key, now], |row| row.get::<_, String>(0))?;
        match rows.next().transpose()? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn search_cache_write(
        &self,
        cache_key: &str,
        place_keys: &[String],
        provider: &str,
        now: &str,
        expires_at: &str,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_string(place_keys)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO search_cache (cache_key, provider, place_keys, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(cache_key) DO UPDATE SET
               provider = excluded.provider,
               place_keys = excluded.place_keys,
               created_at = excluded.created_at,
               expires_at = excluded.expires_at",
            params![cache_key, provider, json, now, expires_at],
        )?;
        Ok(())
    }

    pub fn search_cache_purge_expired(&self, now: &str, limit: u32) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM search_cache WHERE cache_key IN (
                 SELECT cache_key FROM search_cache WHERE expires_at <= ?1 LIMIT ?2
             )",
            params![now, limit],
        )?;
        Ok(count)
    }

    // ── Tile cache ──

    /// All chunks for a tile, ordered by chunk index. Callers decide hit/miss
    /// (a single expired chunk invalidates the whole tile).
    pub fn tile_chunks(&self, tile_key: &str, zoom: u8) -> anyhow::Result<Vec<TileChunk>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT chunk_index, place_keys, expires_at FROM tile_cache
             WHERE tile_key = ?1 AND zoom = ?2 ORDER BY chunk_index",
        )?;
        let rows = stmt
            .query_map(params![tile_key, zoom], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut chunks = Vec::with_capacity(rows.len());
        for (chunk_index, json, expires_at) in rows {
            chunks.push(TileChunk {
                chunk_index,
                place_keys: serde_json::from_str(&json)?,
                expires_at,
            });
        }
        Ok(chunks)
    }

    /// Full-refresh write: delete every existing chunk for the tile, then
    /// insert the new set in one transaction.
    pub fn tile_cache_replace(
        &self,
        tile_key: &str,
        zoom: u8,
        chunks: &[Vec<String>],
        provider: &str,
        now: &str,
        expires_at: &str,
    ) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM tile_cache WHERE tile_key = ?1 AND zoom = ?2",
            params![tile_key, zoom],
        )?;
        for (i, chunk) in chunks.iter().enumerate() {
            let json = serde_json::to_string(chunk)?;
            tx.execute(
                "INSERT INTO tile_cache (tile_key, zoom, chunk_index, provider, place_keys, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![tile_key, zoom, i as i64, provider, json, now, expires_at],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn tile_cache_purge_expired(&self, now: &str, limit: u32) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM tile_cache WHERE rowid IN (
                 SELECT rowid FROM tile_cache WHERE expires_at <= ?1 LIMIT ?2
             )",
            params![now, limit],
        )?;
        Ok(count)
    }

    // ── Budget counters ──

    /// (used, limit) for the day, or None if the counter does not exist yet.
    pub fn budget_get(
        &self,
        endpoint_class: &str,
        date_key: &str,
    ) -> anyhow::Result<Option<(i64, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT used_millicents, limit_millicents FROM budget_counters
             WHERE endpoint_class = ?1 AND date_key = ?2",
        )?;
        let mut rows = stmt.query_map(params![endpoint_class, date_key], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        Ok(rows.next().transpose()?)
    }

    /// Atomically add `cost` to the day's counter, creating it with
    /// `default_limit` on first use. Returns (used_after, limit).
    pub fn budget_add(
        &self,
        endpoint_class: &str,
        date_key: &str,
        cost: i64,
        default_limit: i64,
    ) -> anyhow::Result<(i64, i64)> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO budget_counters (endpoint_class, date_key, used_millicents, limit_millicents)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(endpoint_class, date_key) DO UPDATE SET
               used_millicents = used_millicents + ?3",
            params![endpoint_class, date_key, cost, default_limit],
        )?;
        let row = conn.query_row(
            "SELECT used_millicents, limit_millicents FROM budget_counters
             WHERE endpoint_class = ?1 AND date_key = ?2",
            params![endpoint_class, date_key],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(row)
    }

    // ── Service health (circuit breaker state) ──

    pub fn service_health_get(&self, service: &str) -> anyhow::Result<Option<CircuitState>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT service, state, consecutive_failures, last_failure_at, last_success_at,
                    opened_at, half_open_attempts, updated_at
             FROM service_health WHERE service = ?1",
        )?;
        let mut rows = stmt.query_map(params![service], |row| {
            Ok(CircuitState {
                service: row.get(0)?,
                state: CircuitStatus::parse(&row.get::<_, String>(1)?),
                consecutive_failures: row.get(2)?,
                last_failure_at: row.get(3)?,
                last_success_at: row.get(4)?,
                opened_at: row.get(5)?,
                half_open_attempts: row.get(6)?,
                updated_at: row.get(7)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn service_health_put(&self, state: &CircuitState) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO service_health (service, state, consecutive_failures, last_failure_at,
                                         last_success_at, opened_at, half_open_attempts, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(service) DO UPDATE SET
               state = excluded.state,
               consecutive_failures = excluded.consecutive_failures,
               last_failure_at = excluded.last_failure_at,
               last_success_at = excluded.last_success_at,
               opened_at = excluded.opened_at,
               half_open_attempts = excluded.half_open_attempts,
               updated_at = excluded.updated_at",
            params![
                state.service,
                state.state.as_str(),
                state.consecutive_failures,
                state.last_failure_at,
                state.last_success_at,
                state.opened_at,
                state.half_open_attempts,
                state.updated_at,
            ],
        )?;
        Ok(())
    }

    // ── Feature flags ──

    pub fn flag_get(&self, key: &str) -> anyhow::Result<Option<FeatureFlag>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT key, enabled, reason, updated_at FROM feature_flags WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| {
            Ok(FeatureFlag {
                key: row.get(0)?,
                enabled: row.get(1)?,
                reason: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    /// Absent flags default to enabled (flags initialise lazily).
    pub fn flag_is_enabled(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.flag_get(key)?.map(|f| f.enabled).unwrap_or(true))
    }

    pub fn flag_set(&self, key: &str, enabled: bool, reason: &str, now: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO feature_flags (key, enabled, reason, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
               enabled = excluded.enabled,
               reason = excluded.reason,
               updated_at = excluded.updated_at",
            params![key, enabled, reason, now],
        )?;
        Ok(())
    }

    pub fn flags_all(&self) -> anyhow::Result<Vec<FeatureFlag>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT key, enabled, reason, updated_at FROM feature_flags ORDER BY key")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(FeatureFlag {
                    key: row.get(0)?,
                    enabled: row.get(1)?,
                    reason: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Service mode ──

    pub fn service_mode_get(&self) -> anyhow::Result<Option<ServiceModeRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT current_mode, reason, entered_at, provider_healthy, budget_ok, latency_ok,
                    breaker_closed, updated_at
             FROM service_mode WHERE key = 'service_mode'",
        )?;
        let mut rows = stmt.query_map([], |row| {
            Ok(ServiceModeRecord {
                current_mode: row.get(0)?,
                reason: row.get(1)?,
                entered_at: row.get(2)?,
                triggers: ModeTriggers {
                    provider_healthy: row.get(3)?,
                    budget_ok: row.get(4)?,
                    latency_ok: row.get(5)?,
                    breaker_closed: row.get(6)?,
                },
                updated_at: row.get(7)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn service_mode_put(&self, rec: &ServiceModeRecord) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO service_mode (key, current_mode, reason, entered_at, provider_healthy,
                                       budget_ok, latency_ok, breaker_closed, updated_at)
             VALUES ('service_mode', ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(key) DO UPDATE SET
               current_mode = excluded.current_mode,
               reason = excluded.reason,
               entered_at = excluded.entered_at,
               provider_healthy = excluded.provider_healthy,
               budget_ok = excluded.budget_ok,
               latency_ok = excluded.latency_ok,
               breaker_closed = excluded.breaker_closed,
               updated_at = excluded.updated_at",
            params![
                rec.current_mode,
                rec.reason,
                rec.entered_at,
                rec.triggers.provider_healthy,
                rec.triggers.budget_ok,
                rec.triggers.latency_ok,
                rec.triggers.breaker_closed,
                rec.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn mode_history_insert(
        &self,
        id: &str,
        from_mode: i64,
        to_mode: i64,
        reason: &str,
        now: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO service_mode_history (id, from_mode, to_mode, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, from_mode, to_mode, reason, now],
        )?;
        Ok(())
    }

    pub fn mode_history_list(&self, limit: u32) -> anyhow::Result<Vec<ModeTransition>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, from_mode, to_mode, reason, created_at FROM service_mode_history
             ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(ModeTransition {
                    id: row.get(0)?,
                    from_mode: row.get(1)?,
                    to_mode: row.get(2)?,
                    reason: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Metrics ──

    pub fn metrics_insert_batch(&self, events: &[MetricEvent]) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO metrics (name, value, endpoint, cost_tier, cache_hit, service_mode, city, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for e in events {
                stmt.execute(params![
                    e.name,
                    e.value,
                    e.endpoint,
                    e.cost_tier,
                    e.cache_hit,
                    e.service_mode,
                    e.city,
                    e.timestamp,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Raw values for one metric name in a window, optionally narrowed to an
    /// endpoint tag. Order does not matter; percentile math sorts in memory.
    pub fn metrics_values(
        &self,
        name: &str,
        since: &str,
        endpoint: Option<&str>,
    ) -> anyhow::Result<Vec<f64>> {
        let conn = self.conn.lock().unwrap();
        let mut sql =
            String::from("SELECT value FROM metrics WHERE name = ?1 AND timestamp >= ?2");
        if endpoint.is_some() {
            sql.push_str(" AND endpoint = ?3");
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = match endpoint {
            Some(ep) => stmt
                .query_map(params![name, since, ep], |row| row.get::<_, f64>(0))?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(params![name, since], |row| row.get::<_, f64>(0))?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    pub fn metrics_count(
        &self,
        name: &str,
        since: &str,
        endpoint: Option<&str>,
    ) -> anyhow::Result<u64> {
        let conn = self.conn.lock().unwrap();
        let mut sql =
            String::from("SELECT COUNT(*) FROM metrics WHERE name = ?1 AND timestamp >= ?2");
        if endpoint.is_some() {
            sql.push_str(" AND endpoint = ?3");
        }
        let mut stmt = conn.prepare(&sql)?;
        let count: i64 = match endpoint {
            Some(ep) => stmt.query_row(params![name, since, ep], |row| row.get(0))?,
            None => stmt.query_row(params![name, since], |row| row.get(0))?,
        };
        Ok(count as u64)
    }

    pub fn metrics_purge_before(&self, cutoff: &str, limit: u32) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM metrics WHERE id IN (
                 SELECT id FROM metrics WHERE timestamp < ?1 LIMIT ?2
             )",
            params![cutoff, limit],
        )?;
        Ok(count)
    }

    // ── Alert thresholds & alerts ──

    pub fn alert_thresholds_count(&self) -> anyhow::Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM alert_thresholds", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn alert_threshold_insert(&self, t: &AlertThreshold) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alert_thresholds (id, name, metric, op, threshold, window_minutes,
                                           severity, auto_mitigation, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                t.id,
                t.name,
                t.metric,
                t.op,
                t.threshold,
                t.window_minutes,
                t.severity,
                t.auto_mitigation,
                t.enabled,
            ],
        )?;
        Ok(())
    }

    pub fn alert_thresholds_enabled(&self) -> anyhow::Result<Vec<AlertThreshold>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, metric, op, threshold, window_minutes, severity, auto_mitigation, enabled
             FROM alert_thresholds WHERE enabled = 1",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AlertThreshold {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    metric: row.get(2)?,
                    op: row.get(3)?,
                    threshold: row.get(4)?,
                    window_minutes: row.get(5)?,
                    severity: row.get(6)?,
                    auto_mitigation: row.get(7)?,
                    enabled: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Latest unresolved alert for a threshold, if any.
    pub fn alert_open_for_threshold(&self, threshold_id: &str) -> anyhow::Result<Option<Alert>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, threshold_id, name, severity, value, threshold, message, triggered_at, resolved_at
             FROM alerts WHERE threshold_id = ?1 AND resolved_at IS NULL
             ORDER BY triggered_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![threshold_id], |row| {
            Ok(Alert {
                id: row.get(0)?,
                threshold_id: row.get(1)?,
                name: row.get(2)?,
                severity: row.get(3)?,
                value: row.get(4)?,
                threshold: row.get(5)?,
                message: row.get(6)?,
                triggered_at: row.get(7)?,
                resolved_at: row.get(8)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }

    pub fn alert_insert(&self, a: &Alert) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alerts (id, threshold_id, name, severity, value, threshold, message, triggered_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                a.id,
                a.threshold_id,
                a.name,
                a.severity,
                a.value,
                a.threshold,
                a.message,
                a.triggered_at,
                a.resolved_at,
            ],
        )?;
        Ok(())
    }

    pub fn alert_resolve(&self, id: &str, now: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alerts SET resolved_at = ?2 WHERE id = ?1 AND resolved_at IS NULL",
            params![id, now],
        )?;
        Ok(())
    }

    pub fn alerts_recent(&self, limit: u32) -> anyhow::Result<Vec<Alert>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, threshold_id, name, severity, value, threshold, message, triggered_at, resolved_at
             FROM alerts ORDER BY triggered_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(Alert {
                    id: row.get(0)?,
                    threshold_id: row.get(1)?,
                    name: row.get(2)?,
                    severity: row.get(3)?,
                    value: row.get(4)?,
                    threshold: row.get(5)?,
                    message: row.get(6)?,
                    triggered_at: row.get(7)?,
                    resolved_at: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Recent searches & aggregates ──

    pub fn recent_search_insert(&self, row: &RecentSearchRow) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO recent_searches (id, user_hash, query, normalized_query, city, result_count, searched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.id,
                row.user_hash,
                row.query,
                row.normalized_query,
                row.city,
                row.result_count,
                row.searched_at,
            ],
        )?;
        Ok(())
    }

    pub fn recent_searches_for_user(
        &self,
        user_hash: &str,
        limit: u32,
    ) -> anyhow::Result<Vec<RecentSearchRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user_hash, query, normalized_query, city, result_count, searched_at
             FROM recent_searches WHERE user_hash = ?1 ORDER BY searched_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_hash, limit], |row| {
                Ok(RecentSearchRow {
                    id: row.get(0)?,
                    user_hash: row.get(1)?,
                    query: row.get(2)?,
                    normalized_query: row.get(3)?,
                    city: row.get(4)?,
                    result_count: row.get(5)?,
                    searched_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn recent_searches_clear_user(&self, user_hash: &str) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM recent_searches WHERE user_hash = ?1",
            params![user_hash],
        )?;
        Ok(count)
    }

    pub fn recent_searches_purge_before(&self, cutoff: &str, limit: u32) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM recent_searches WHERE id IN (
                 SELECT id FROM recent_searches WHERE searched_at <= ?1 LIMIT ?2
             )",
            params![cutoff, limit],
        )?;
        Ok(count)
    }

    /// Per-city groups over a window that clear the k-anonymity floor.
    /// Rows without a city are excluded here and only count toward 'global'.
    pub fn search_groups_by_city(
        &self,
        from: &str,
        to: &str,
        min_unique_users: i64,
    ) -> anyhow::Result<Vec<(String, String, i64, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT city, normalized_query, COUNT(*), COUNT(DISTINCT user_hash)
             FROM recent_searches
             WHERE searched_at >= ?1 AND searched_at < ?2 AND city IS NOT NULL
             GROUP BY city, normalized_query
             HAVING COUNT(DISTINCT user_hash) >= ?3",
        )?;
        let rows = stmt
            .query_map(params![from, to, min_unique_users], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Same, ignoring city (the 'global' bucket).
    pub fn search_groups_global(
        &self,
        from: &str,
        to: &str,
        min_unique_users: i64,
    ) -> anyhow::Result<Vec<(String, i64, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT normalized_query, COUNT(*), COUNT(DISTINCT user_hash)
             FROM recent_searches
             WHERE searched_at >= ?1 AND searched_at < ?2
             GROUP BY normalized_query
             HAVING COUNT(DISTINCT user_hash) >= ?3",
        )?;
        let rows = stmt
            .query_map(params![from, to, min_unique_users], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Re-running aggregation for the same period overwrites rather than
    /// accumulates, so the job is idempotent.
    pub fn search_aggregate_upsert(&self, row: &SearchAggregateRow) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO search_aggregates (id, normalized_query, city, count, unique_users, period_start, period_end)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(city, normalized_query, period_start) DO UPDATE SET
               count = excluded.count,
               unique_users = excluded.unique_users,
               period_end = excluded.period_end",
            params![
                row.id,
                row.normalized_query,
                row.city,
                row.count,
                row.unique_users,
                row.period_start,
                row.period_end,
            ],
        )?;
        Ok(())
    }

    pub fn search_aggregates_popular(
        &self,
        city: &str,
        limit: u32,
    ) -> anyhow::Result<Vec<SearchAggregateRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, normalized_query, city, count, unique_users, period_start, period_end
             FROM search_aggregates WHERE city = ?1
             ORDER BY count DESC, period_start DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![city, limit], |row| {
                Ok(SearchAggregateRow {
                    id: row.get(0)?,
                    normalized_query: row.get(1)?,
                    city: row.get(2)?,
                    count: row.get(3)?,
                    unique_users: row.get(4)?,
                    period_start: row.get(5)?,
                    period_end: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn search_aggregates_purge_before(
        &self,
        cutoff: &str,
        limit: u32,
    ) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "DELETE FROM search_aggregates WHERE id IN (
                 SELECT id FROM search_aggregates WHERE period_start <= ?1 LIMIT ?2
             )",
            params![cutoff, limit],
        )?;
        Ok(count)
    }

    // ── Shed counts ──

    pub fn shed_count_increment(&self, date_key: &str, priority: u8) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO shed_counts (date_key, priority, count) VALUES (?1, ?2, 1)
             ON CONFLICT(date_key, priority) DO UPDATE SET count = count + 1",
            params![date_key, priority],
        )?;
        Ok(())
    }

    pub fn shed_counts_for_day(&self, date_key: &str) -> anyhow::Result<Vec<(i64, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT priority, count FROM shed_counts WHERE date_key = ?1 ORDER BY priority",
        )?;
        let rows = stmt
            .query_map(params![date_key], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
impl Store {
    /// Direct SQL escape hatch for tests that need to manufacture states the
    /// public surface never produces (e.g. a single expired chunk).
    pub fn raw_execute(&self, sql: &str) -> anyhow::Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute(sql, [])?)
    }
}
