use serde::Serialize;

/// A single metric event emitted by the gateway or an engine.
#[derive(Debug, Clone)]
pub struct MetricEvent {
    pub name: String,
    pub value: f64,
    pub endpoint: Option<String>,
    pub cost_tier: Option<String>,
    pub cache_hit: Option<bool>,
    pub service_mode: Option<i64>,
    pub city: Option<String>,
    pub timestamp: String,
}

impl MetricEvent {
    pub fn new(name: impl Into<String>, value: f64, timestamp: String) -> Self {
        Self {
            name: name.into(),
            value,
            endpoint: None,
            cost_tier: None,
            cache_hit: None,
            service_mode: None,
            city: None,
            timestamp,
        }
    }
}

/// Windowed summary with nearest-rank percentiles.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub count: u64,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHitRate {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}
