//! Daily provider-spend budgets, tracked per endpoint class in millicents.
//! Crossing the critical or exhausted threshold on an increment disables the
//! class's auto-mitigation feature flag.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::field_sets::EndpointClass;
use crate::store::{Store, date_key, format_ts};

pub const WARNING_PERCENT: f64 = 80.0;
pub const CRITICAL_PERCENT: f64 = 95.0;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetCheck {
    pub allowed: bool,
    pub used: i64,
    pub limit: i64,
    pub usage_percent: f64,
    pub warning: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_level: Option<&'static str>,
}

fn percent(used: i64, limit: i64) -> f64 {
    if limit <= 0 {
        return 100.0;
    }
    used as f64 / limit as f64 * 100.0
}

fn check_from(used: i64, limit: i64) -> BudgetCheck {
    let usage_percent = percent(used, limit);
    let warning_level = if usage_percent >= CRITICAL_PERCENT {
        Some("critical")
    } else if usage_percent >= WARNING_PERCENT {
        Some("approaching")
    } else {
        None
    };
    BudgetCheck {
        allowed: used < limit,
        used,
        limit,
        usage_percent,
        warning: warning_level.is_some(),
        warning_level,
    }
}

pub struct BudgetEnforcer {
    store: Arc<Store>,
    limit_overrides: HashMap<EndpointClass, i64>,
}

impl BudgetEnforcer {
    pub fn new(store: Arc<Store>, limit_overrides: HashMap<EndpointClass, i64>) -> Self {
        Self {
            store,
            limit_overrides,
        }
    }

    pub fn limit_for(&self, class: EndpointClass) -> i64 {
        self.limit_overrides
            .get(&class)
            .copied()
            .unwrap_or_else(|| class.default_daily_limit_millicents())
    }

    /// Current standing for today's counter. A counter that does not exist
    /// yet reads as zero spend.
    pub fn check(&self, class: EndpointClass, now: DateTime<Utc>) -> anyhow::Result<BudgetCheck> {
        let day = date_key(now);
        let (used, limit) = self
            .store
            .budget_get(class.as_str(), &day)?
            .unwrap_or((0, self.limit_for(class)));
        Ok(check_from(used, limit))
    }

    /// Add spend to today's counter. If this increment crosses the critical
    /// or exhausted threshold, the class's mitigation flag is disabled with a
    /// reason naming the class.
    pub fn record(
        &self,
        class: EndpointClass,
        cost_millicents: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<BudgetCheck> {
        let day = date_key(now);
        let (used_after, limit) = self.store.budget_add(
            class.as_str(),
            &day,
            cost_millicents,
            self.limit_for(class),
        )?;
        let used_before = used_after - cost_millicents;
        let pct_before = percent(used_before, limit);
        let pct_after = percent(used_after, limit);

        if let Some(flag) = class.budget_flag() {
            let reason = if pct_before < 100.0 && pct_after >= 100.0 {
                Some(format!("budget_exhausted_{}", class.as_str()))
            } else if pct_before < CRITICAL_PERCENT && pct_after >= CRITICAL_PERCENT {
                Some(format!("budget_critical_{}", class.as_str()))
            } else {
                None
            };
            if let Some(reason) = reason {
                self.store.flag_set(flag, false, &reason, &format_ts(now))?;
                tracing::warn!(
                    "budget: {} at {:.1}% of daily limit, disabled {flag} ({reason})",
                    class.as_str(),
                    pct_after
                );
            }
        }

        Ok(check_from(used_after, limit))
    }

    /// Worst usage across the classes the mode controller watches.
    pub fn worst_usage_percent(
        &self,
        classes: &[EndpointClass],
        now: DateTime<Utc>,
    ) -> anyhow::Result<f64> {
        let mut worst: f64 = 0.0;
        for class in classes {
            let check = self.check(*class, now)?;
            worst = worst.max(check.usage_percent);
        }
        Ok(worst)
    }
}
