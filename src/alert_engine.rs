//! Threshold evaluation over the collected metrics, with auto-mitigation
//! into the service-mode controller. The dependency is one-directional: this
//! engine calls the mode setter; the controller never reaches back.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::metrics;
use crate::models::alert::{Alert, AlertThreshold};
use crate::service_mode::{MODE_COST_SAVER, MODE_PROVIDER_LIMITED, ModeController};
use crate::store::{Store, format_ts, parse_ts};

/// A breach is not re-alerted while an unresolved alert younger than this
/// exists for the same threshold.
const DEDUP_WINDOW_MINUTES: i64 = 5;

pub fn spawn_alert_engine(store: Arc<Store>, mode: Arc<ModeController>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            if let Err(e) = eval_thresholds(&store, &mode, Utc::now()) {
                tracing::error!("alert engine error: {e}");
            }
        }
    });
}

/// First-run defaults. Rates are fractions; latencies are milliseconds.
pub fn seed_default_thresholds(store: &Store) -> anyhow::Result<()> {
    if store.alert_thresholds_count()? > 0 {
        return Ok(());
    }
    let defaults = [
        AlertThreshold {
            id: Uuid::new_v4().to_string(),
            name: "api_error_rate_high".to_string(),
            metric: "api_error_rate".to_string(),
            op: ">".to_string(),
            threshold: 0.05,
            window_minutes: 5,
            severity: "critical".to_string(),
            auto_mitigation: Some("set_service_mode_2".to_string()),
            enabled: true,
        },
        AlertThreshold {
            id: Uuid::new_v4().to_string(),
            name: "search_latency_p95_high".to_string(),
            metric: "search_latency_p95".to_string(),
            op: ">".to_string(),
            threshold: 2000.0,
            window_minutes: 10,
            severity: "warning".to_string(),
            auto_mitigation: None,
            enabled: true,
        },
        AlertThreshold {
            id: Uuid::new_v4().to_string(),
            name: "cache_hit_rate_low".to_string(),
            metric: "cache_hit_rate".to_string(),
            op: "<".to_string(),
            threshold: 0.5,
            window_minutes: 60,
            severity: "warning".to_string(),
            auto_mitigation: None,
            enabled: true,
        },
        AlertThreshold {
            id: Uuid::new_v4().to_string(),
            name: "review_spam_rate_high".to_string(),
            metric: "review_spam_rate".to_string(),
            op: ">".to_string(),
            threshold: 10.0,
            window_minutes: 60,
            severity: "warning".to_string(),
            auto_mitigation: None,
            enabled: true,
        },
    ];
    for threshold in &defaults {
        store.alert_threshold_insert(threshold)?;
    }
    tracing::info!("alert engine: seeded {} default thresholds", defaults.len());
    Ok(())
}

/// Evaluate the windowed value for a threshold. None means no data, which
/// never breaches.
fn compute_metric(
    store: &Store,
    threshold: &AlertThreshold,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<f64>> {
    let window = threshold.window_minutes;
    match threshold.metric.as_str() {
        "api_error_rate" => metrics::error_rate(store, window, now),
        "cache_hit_rate" => {
            let rate = metrics::cache_hit_rate(store, None, window, now)?;
            if rate.hits + rate.misses == 0 {
                Ok(None)
            } else {
                Ok(Some(rate.hit_rate))
            }
        }
        name if name.ends_with("_p95") => {
            let base = name.trim_end_matches("_p95");
            let summary = metrics::summary(store, base, window, None, now)?;
            if summary.count == 0 {
                Ok(None)
            } else {
                Ok(Some(summary.p95))
            }
        }
        name => {
            let summary = metrics::summary(store, name, window, None, now)?;
            if summary.count == 0 {
                Ok(None)
            } else {
                Ok(Some(summary.avg))
            }
        }
    }
}

fn breached(value: f64, op: &str, threshold: f64) -> bool {
    match op {
        ">" => value > threshold,
        ">=" => value >= threshold,
        "<" => value < threshold,
        "<=" => value <= threshold,
        _ => false,
    }
}

fn apply_mitigation(
    store: &Store,
    mode: &ModeController,
    threshold: &AlertThreshold,
    mitigation: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let reason = format!("auto_mitigation_{}", threshold.name);
    match mitigation {
        "set_service_mode_1" => {
            mode.set_mode(MODE_COST_SAVER, &reason, now)?;
        }
        "set_service_mode_2" => {
            mode.set_mode(MODE_PROVIDER_LIMITED, &reason, now)?;
        }
        "disable_photos" => {
            store.flag_set("photos_enabled", false, &reason, &format_ts(now))?;
        }
        other => {
            tracing::warn!("alert engine: unknown mitigation '{other}' on {}", threshold.name);
        }
    }
    Ok(())
}

pub fn eval_thresholds(
    store: &Store,
    mode: &ModeController,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    seed_default_thresholds(store)?;

    for threshold in store.alert_thresholds_enabled()? {
        let Some(value) = compute_metric(store, &threshold, now)? else {
            continue;
        };
        let open = store.alert_open_for_threshold(&threshold.id)?;

        if breached(value, &threshold.op, threshold.threshold) {
            if let Some(open) = &open {
                let recent = parse_ts(&open.triggered_at)
                    .map(|t| now - t < ChronoDuration::minutes(DEDUP_WINDOW_MINUTES))
                    .unwrap_or(false);
                if recent {
                    continue;
                }
            }
            let message = format!(
                "{}: {} = {:.4} (threshold {} {})",
                threshold.name, threshold.metric, value, threshold.op, threshold.threshold
            );
            store.alert_insert(&Alert {
                id: Uuid::new_v4().to_string(),
                threshold_id: threshold.id.clone(),
                name: threshold.name.clone(),
                severity: threshold.severity.clone(),
                value,
                threshold: threshold.threshold,
                message,
                triggered_at: format_ts(now),
                resolved_at: None,
            })?;
            tracing::warn!(
                "alert '{}' firing: {} = {:.4}",
                threshold.name,
                threshold.metric,
                value
            );
            if let Some(mitigation) = &threshold.auto_mitigation {
                apply_mitigation(store, mode, &threshold, mitigation, now)?;
            }
        } else if let Some(open) = open {
            store.alert_resolve(&open.id, &format_ts(now))?;
            tracing::info!("alert '{}' resolved", threshold.name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetEnforcer;
    use crate::models::metrics::MetricEvent;
    use std::collections::HashMap;

    fn setup() -> (Arc<Store>, Arc<ModeController>, DateTime<Utc>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let budget = Arc::new(BudgetEnforcer::new(store.clone(), HashMap::new()));
        let mode = ModeController::new(store.clone(), budget);
        let now = DateTime::parse_from_rfc3339("2026-08-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        (store, mode, now)
    }

    fn emit_calls(store: &Store, errors: usize, successes: usize, at: &str) {
        let mut batch = Vec::new();
        for _ in 0..errors {
            batch.push(MetricEvent::new(metrics::API_CALL_ERROR, 100.0, at.to_string()));
        }
        for _ in 0..successes {
            batch.push(MetricEvent::new(metrics::API_CALL_SUCCESS, 100.0, at.to_string()));
        }
        store.metrics_insert_batch(&batch).unwrap();
    }

    #[test]
    fn seeding_is_idempotent() {
        let (store, _, _) = setup();
        seed_default_thresholds(&store).unwrap();
        seed_default_thresholds(&store).unwrap();
        assert_eq!(store.alert_thresholds_count().unwrap(), 4);
    }

    #[test]
    fn error_rate_breach_alerts_and_mitigates_to_mode_two() {
        let (store, mode, now) = setup();
        emit_calls(&store, 3, 7, "2026-08-01T11:58:00Z");
        eval_thresholds(&store, &mode, now).unwrap();

        let alerts = store.alerts_recent(10).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].name, "api_error_rate_high");
        assert_eq!(alerts[0].severity, "critical");
        assert!(alerts[0].resolved_at.is_none());

        let record = store.service_mode_get().unwrap().unwrap();
        assert_eq!(record.current_mode, MODE_PROVIDER_LIMITED);
        assert!(record.reason.starts_with("auto_mitigation_"));
    }

    #[test]
    fn breaches_deduplicate_within_the_window() {
        let (store, mode, now) = setup();
        emit_calls(&store, 5, 5, "2026-08-01T11:58:00Z");
        eval_thresholds(&store, &mode, now).unwrap();
        eval_thresholds(&store, &mode, now + ChronoDuration::minutes(1)).unwrap();
        assert_eq!(store.alerts_recent(10).unwrap().len(), 1);
        // Past the dedup window the breach fires again.
        emit_calls(&store, 5, 5, "2026-08-01T12:05:00Z");
        eval_thresholds(&store, &mode, now + ChronoDuration::minutes(6)).unwrap();
        assert_eq!(store.alerts_recent(10).unwrap().len(), 2);
    }

    #[test]
    fn recovery_resolves_the_open_alert() {
        let (store, mode, now) = setup();
        emit_calls(&store, 5, 5, "2026-08-01T11:58:00Z");
        eval_thresholds(&store, &mode, now).unwrap();
        // Clean traffic in a later window
        emit_calls(&store, 0, 50, "2026-08-01T12:09:00Z");
        eval_thresholds(&store, &mode, now + ChronoDuration::minutes(10)).unwrap();
        let alerts = store.alerts_recent(10).unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].resolved_at.is_some());
    }

    #[test]
    fn no_data_never_breaches() {
        let (store, mode, now) = setup();
        // cache_hit_rate is 0/0 and search latency has no samples
        eval_thresholds(&store, &mode, now).unwrap();
        assert!(store.alerts_recent(10).unwrap().is_empty());
    }

    #[test]
    fn latency_p95_uses_the_percentile_query() {
        let (store, mode, now) = setup();
        let mut batch = Vec::new();
        for i in 0..20 {
            let value = if i < 19 { 100.0 } else { 9000.0 };
            batch.push(MetricEvent::new(
                metrics::SEARCH_LATENCY,
                value,
                "2026-08-01T11:55:00Z".to_string(),
            ));
        }
        store.metrics_insert_batch(&batch).unwrap();
        eval_thresholds(&store, &mode, now).unwrap();
        let alerts = store.alerts_recent(10).unwrap();
        // p95 of 20 samples lands on the 9000ms outlier
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].name, "search_latency_p95_high");
    }
}
