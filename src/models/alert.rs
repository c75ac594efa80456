use serde::Serialize;

/// A configured alert threshold. `metric` names the windowed signal
/// (`api_error_rate`, `search_latency_p95`, `cache_hit_rate`, …);
/// `auto_mitigation`, when set, names the action the engine fires on breach.
#[derive(Debug, Clone)]
pub struct AlertThreshold {
    pub id: String,
    pub name: String,
    pub metric: String,
    pub op: String,
    pub threshold: f64,
    pub window_minutes: i64,
    pub severity: String,
    pub auto_mitigation: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub threshold_id: String,
    pub name: String,
    pub severity: String,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub triggered_at: String,
    pub resolved_at: Option<String>,
}
