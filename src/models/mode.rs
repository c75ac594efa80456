use serde::{Deserialize, Serialize};

/// The four trigger signals the mode controller evaluates each tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeTriggers {
    pub provider_healthy: bool,
    pub budget_ok: bool,
    pub latency_ok: bool,
    pub breaker_closed: bool,
}

impl Default for ModeTriggers {
    fn default() -> Self {
        Self {
            provider_healthy: true,
            budget_ok: true,
            latency_ok: true,
            breaker_closed: true,
        }
    }
}

/// Singleton service-mode record. Mode 0 = Normal, 1 = Cost-Saver,
/// 2 = Provider-Limited, 3 = Offline/Owned (manual only).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceModeRecord {
    pub current_mode: i64,
    pub reason: String,
    pub entered_at: String,
    pub triggers: ModeTriggers,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeTransition {
    pub id: String,
    pub from_mode: i64,
    pub to_mode: i64,
    pub reason: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    pub enabled: bool,
    pub reason: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModeRequest {
    pub mode: i64,
    #[serde(default)]
    pub reason: Option<String>,
}
