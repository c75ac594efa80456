//! Service-mode state machine: 0 Normal, 1 Cost-Saver, 2 Provider-Limited,
//! 3 Offline/Owned (manual only). A one-minute loop re-evaluates the trigger
//! signals and rewrites the feature-flag table on every transition.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::breaker::{CircuitStatus, PROVIDER_SERVICE};
use crate::budget::{BudgetEnforcer, WARNING_PERCENT};
use crate::field_sets::EndpointClass;
use crate::models::mode::{ModeTransition, ModeTriggers, ServiceModeRecord};
use crate::store::{Store, format_ts};

pub const MODE_NORMAL: i64 = 0;
pub const MODE_COST_SAVER: i64 = 1;
pub const MODE_PROVIDER_LIMITED: i64 = 2;
pub const MODE_OFFLINE: i64 = 3;

/// Flags the controller owns. Everything here depends on the provider.
const MANAGED_FLAGS: &[&str] = &[
    "photos_enabled",
    "open_now_enabled",
    "text_search_enabled",
    "nearby_search_enabled",
    "autocomplete_enabled",
    "place_details_enhanced",
];

/// Per-mode flag table.
fn flag_states(mode: i64) -> Vec<(&'static str, bool)> {
    MANAGED_FLAGS
        .iter()
        .map(|&flag| {
            let enabled = match mode {
                MODE_NORMAL => true,
                MODE_COST_SAVER => !matches!(flag, "photos_enabled" | "open_now_enabled"),
                _ => false,
            };
            (flag, enabled)
        })
        .collect()
}

/// Budget classes whose worst usage feeds the budget trigger.
const BUDGET_WATCH: &[EndpointClass] = &[
    EndpointClass::PlaceDetails,
    EndpointClass::TextSearch,
    EndpointClass::Autocomplete,
    EndpointClass::Photos,
];

pub struct ModeController {
    store: Arc<Store>,
    budget: Arc<BudgetEnforcer>,
}

impl ModeController {
    pub fn new(store: Arc<Store>, budget: Arc<BudgetEnforcer>) -> Arc<Self> {
        Arc::new(Self { store, budget })
    }

    /// Current record, lazily initialised to Normal on first read.
    pub fn current(&self, now: DateTime<Utc>) -> anyhow::Result<ServiceModeRecord> {
        if let Some(record) = self.store.service_mode_get()? {
            return Ok(record);
        }
        let ts = format_ts(now);
        let record = ServiceModeRecord {
            current_mode: MODE_NORMAL,
            reason: "init".to_string(),
            entered_at: ts.clone(),
            triggers: ModeTriggers::default(),
            updated_at: ts,
        };
        self.store.service_mode_put(&record)?;
        Ok(record)
    }

    pub fn history(&self, limit: u32) -> anyhow::Result<Vec<ModeTransition>> {
        self.store.mode_history_list(limit)
    }

    fn gather_triggers(&self, now: DateTime<Utc>) -> anyhow::Result<ModeTriggers> {
        // Breaker state doubles as the provider health record; absent row
        // means the provider has never misbehaved.
        let provider_healthy = self
            .store
            .service_health_get(PROVIDER_SERVICE)?
            .map(|s| s.state == CircuitStatus::Closed)
            .unwrap_or(true);
        let budget_ok = self.budget.worst_usage_percent(BUDGET_WATCH, now)? < WARNING_PERCENT;
        Ok(ModeTriggers {
            provider_healthy,
            budget_ok,
            latency_ok: self.latency_ok(),
            breaker_closed: provider_healthy,
        })
    }

    /// Placeholder wired for a P95 check against the search-latency metric;
    /// plugging `metrics::summary` in here changes no contracts.
    fn latency_ok(&self) -> bool {
        true
    }

    fn mode_for(triggers: &ModeTriggers) -> (i64, &'static str) {
        if !triggers.provider_healthy || !triggers.breaker_closed {
            (MODE_PROVIDER_LIMITED, "auto_provider_unhealthy")
        } else if !triggers.budget_ok || !triggers.latency_ok {
            (MODE_COST_SAVER, "auto_budget_pressure")
        } else {
            (MODE_NORMAL, "auto_recovered")
        }
    }

    /// One controller tick. Manual Offline mode is never overridden by the
    /// automatic evaluation; only a manual call leaves mode 3.
    pub fn evaluate(&self, now: DateTime<Utc>) -> anyhow::Result<ServiceModeRecord> {
        let current = self.current(now)?;
        let triggers = self.gather_triggers(now)?;

        if current.current_mode == MODE_OFFLINE {
            let record = ServiceModeRecord {
                triggers,
                updated_at: format_ts(now),
                ..current
            };
            self.store.service_mode_put(&record)?;
            return Ok(record);
        }

        let (mode, reason) = Self::mode_for(&triggers);
        self.apply(current, mode, reason, triggers, now)
    }

    /// Manual or auto-mitigation override. The caller supplies the prefixed
    /// reason (`manual_*`, `auto_mitigation_*`).
    pub fn set_mode(
        &self,
        mode: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ServiceModeRecord> {
        anyhow::ensure!((0..=3).contains(&mode), "mode must be in 0..=3, got {mode}");
        let current = self.current(now)?;
        let triggers = current.triggers;
        self.apply(current, mode, reason, triggers, now)
    }

    /// Shared transition discipline: flags follow the mode table, history
    /// records every change, entered_at refreshes only on actual transitions.
    fn apply(
        &self,
        current: ServiceModeRecord,
        mode: i64,
        reason: &str,
        triggers: ModeTriggers,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ServiceModeRecord> {
        let ts = format_ts(now);
        let changed = current.current_mode != mode;
        if changed {
            self.store.mode_history_insert(
                &Uuid::new_v4().to_string(),
                current.current_mode,
                mode,
                reason,
                &ts,
            )?;
            for (flag, enabled) in flag_states(mode) {
                self.store.flag_set(flag, enabled, reason, &ts)?;
            }
            tracing::info!(
                "service mode: {} -> {mode} ({reason})",
                current.current_mode
            );
        }
        let record = ServiceModeRecord {
            current_mode: mode,
            reason: if changed {
                reason.to_string()
            } else {
                current.reason
            },
            entered_at: if changed { ts.clone() } else { current.entered_at },
            triggers,
            updated_at: ts,
        };
        self.store.service_mode_put(&record)?;
        Ok(record)
    }
}

/// Spawn the one-minute controller loop.
pub fn spawn_mode_controller(controller: Arc<ModeController>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            if let Err(e) = controller.evaluate(Utc::now()) {
                tracing::error!("mode controller error: {e}");
            }
        }
    });
}
