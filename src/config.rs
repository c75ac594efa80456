use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::field_sets::EndpointClass;

/// Top-level config loaded from `medina.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MedinaConfig {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub load: LoadSection,
    #[serde(default)]
    pub retention: RetentionSection,
    /// Daily budget limits in millicents, keyed by endpoint class. Classes
    /// not listed fall back to the built-in defaults.
    #[serde(default)]
    pub budgets: HashMap<String, i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            base_url: default_base_url(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_base_url() -> String {
    crate::gateway::PROVIDER_BASE_URL.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: i64,
    #[serde(default = "default_half_open_delay")]
    pub half_open_delay_secs: i64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            half_open_delay_secs: default_half_open_delay(),
        }
    }
}

fn default_failure_threshold() -> i64 {
    5
}

fn default_half_open_delay() -> i64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_queue_cap_p2")]
    pub queue_cap_p2: u32,
    #[serde(default = "default_queue_cap_p3")]
    pub queue_cap_p3: u32,
    #[serde(default = "default_queue_cap_p4")]
    pub queue_cap_p4: u32,
}

impl Default for LoadSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            queue_cap_p2: default_queue_cap_p2(),
            queue_cap_p3: default_queue_cap_p3(),
            queue_cap_p4: default_queue_cap_p4(),
        }
    }
}

fn default_max_concurrent() -> u32 {
    25
}

fn default_queue_cap_p2() -> u32 {
    50
}

fn default_queue_cap_p3() -> u32 {
    20
}

fn default_queue_cap_p4() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionSection {
    #[serde(default = "default_metrics_days")]
    pub metrics_days: i64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            metrics_days: default_metrics_days(),
        }
    }
}

fn default_metrics_days() -> i64 {
    7
}

impl MedinaConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: MedinaConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Budget overrides as typed endpoint classes; unknown keys are logged
    /// and skipped.
    pub fn budget_overrides(&self) -> HashMap<EndpointClass, i64> {
        let mut out = HashMap::new();
        for (key, limit) in &self.budgets {
            match EndpointClass::parse(key) {
                Some(class) => {
                    out.insert(class, *limit);
                }
                None => tracing::warn!("config: unknown budget class '{key}' ignored"),
            }
        }
        out
    }

    pub fn queue_caps(&self) -> [u32; 4] {
        [
            u32::MAX,
            self.load.queue_cap_p2,
            self.load.queue_cap_p3,
            self.load.queue_cap_p4,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_limits() {
        let config = MedinaConfig::default();
        assert_eq!(config.gateway.timeout_secs, 10);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.half_open_delay_secs, 30);
        assert_eq!(config.load.max_concurrent, 25);
        assert_eq!(config.queue_caps(), [u32::MAX, 50, 20, 5]);
        assert_eq!(config.retention.metrics_days, 7);
        assert!(config.budget_overrides().is_empty());
    }

    #[test]
    fn toml_overrides_parse_into_typed_classes() {
        let config: MedinaConfig = toml::from_str(
            r#"
            [gateway]
            timeout_secs = 5

            [budgets]
            photos = 100000
            text_search = 250000
            not_a_class = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.timeout_secs, 5);
        let overrides = config.budget_overrides();
        assert_eq!(overrides.get(&EndpointClass::Photos), Some(&100_000));
        assert_eq!(overrides.get(&EndpointClass::TextSearch), Some(&250_000));
        assert_eq!(overrides.len(), 2);
    }
}
