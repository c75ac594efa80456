//! Per-service circuit breaker. State lives in the `service_health` table so
//! operators can inspect it and the mode controller can project provider
//! health from the same row. Store-level serialisation makes transitions per
//! service sequential.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::store::{Store, format_ts, parse_ts};

/// The one upstream service this deployment breaks on.
pub const PROVIDER_SERVICE: &str = "google_places";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "open" => CircuitStatus::Open,
            "half_open" => CircuitStatus::HalfOpen,
            _ => CircuitStatus::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitState {
    pub service: String,
    pub state: CircuitStatus,
    pub consecutive_failures: i64,
    pub last_failure_at: Option<String>,
    pub last_success_at: Option<String>,
    pub opened_at: Option<String>,
    pub half_open_attempts: i64,
    pub updated_at: String,
}

impl CircuitState {
    fn fresh(service: &str, now: &str) -> Self {
        Self {
            service: service.to_string(),
            state: CircuitStatus::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            last_success_at: None,
            opened_at: None,
            half_open_attempts: 0,
            updated_at: now.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: i64,
    pub half_open_delay_secs: i64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            half_open_delay_secs: 30,
        }
    }
}

/// Outcome of the admission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; call through normally.
    Proceed,
    /// Half-open trial call; its outcome decides the next state.
    Probe,
    /// Circuit open and still cooling down.
    Rejected,
}

pub struct Breaker {
    store: Arc<Store>,
    config: BreakerConfig,
}

impl Breaker {
    pub fn new(store: Arc<Store>, config: BreakerConfig) -> Self {
        Self { store, config }
    }

    fn load(&self, service: &str, now: DateTime<Utc>) -> anyhow::Result<CircuitState> {
        Ok(self
            .store
            .service_health_get(service)?
            .unwrap_or_else(|| CircuitState::fresh(service, &format_ts(now))))
    }

    /// Gate a request. Open circuits reject until the half-open delay has
    /// elapsed; then exactly one caller is admitted as a probe and the state
    /// moves to half_open until the probe reports back.
    pub fn admit(&self, service: &str, now: DateTime<Utc>) -> anyhow::Result<Admission> {
        let mut state = self.load(service, now)?;
        match state.state {
            CircuitStatus::Closed => Ok(Admission::Proceed),
            CircuitStatus::Open => {
                let opened = state.opened_at.as_deref().and_then(parse_ts);
                let cooled = match opened {
                    Some(t) => (now - t).num_seconds() >= self.config.half_open_delay_secs,
                    // No opened_at on an open circuit is unexpected; treat as cooled.
                    None => true,
                };
                if !cooled {
                    return Ok(Admission::Rejected);
                }
                state.state = CircuitStatus::HalfOpen;
                state.half_open_attempts = 1;
                state.updated_at = format_ts(now);
                self.store.service_health_put(&state)?;
                Ok(Admission::Probe)
            }
            CircuitStatus::HalfOpen => {
                if state.half_open_attempts > 0 {
                    // A probe is already in flight.
                    return Ok(Admission::Rejected);
                }
                state.half_open_attempts = 1;
                state.updated_at = format_ts(now);
                self.store.service_health_put(&state)?;
                Ok(Admission::Probe)
            }
        }
    }

    /// Success resets the breaker to closed from any state.
    pub fn record_success(&self, service: &str, now: DateTime<Utc>) -> anyhow::Result<()> {
        let mut state = self.load(service, now)?;
        state.state = CircuitStatus::Closed;
        state.consecutive_failures = 0;
        state.half_open_attempts = 0;
        state.opened_at = None;
        state.last_success_at = Some(format_ts(now));
        state.updated_at = format_ts(now);
        self.store.service_health_put(&state)
    }

    /// Count a provider-facing failure. Trips to open at the threshold;
    /// a half-open probe failure reopens immediately with a fresh cooldown.
    pub fn record_failure(&self, service: &str, now: DateTime<Utc>) -> anyhow::Result<()> {
        let mut state = self.load(service, now)?;
        let ts = format_ts(now);
        state.last_failure_at = Some(ts.clone());
        state.updated_at = ts.clone();
        match state.state {
            CircuitStatus::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = CircuitStatus::Open;
                    state.opened_at = Some(ts);
                }
            }
            CircuitStatus::HalfOpen => {
                state.state = CircuitStatus::Open;
                state.opened_at = Some(ts);
                state.half_open_attempts = 0;
                state.consecutive_failures += 1;
            }
            CircuitStatus::Open => {
                // Stragglers from calls admitted before the trip.
                state.consecutive_failures += 1;
            }
        }
        self.store.service_health_put(&state)
    }

    /// Health projection used by the mode controller: a missing row means
    /// the service has never misbehaved.
    pub fn is_healthy(&self, service: &str) -> anyhow::Result<bool> {
        Ok(self
            .store
            .service_health_get(service)?
            .map(|s| s.state == CircuitStatus::Closed)
            .unwrap_or(true))
    }

    pub fn state(&self, service: &str) -> anyhow::Result<Option<CircuitState>> {
        self.store.service_health_get(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn setup() -> (Breaker, DateTime<Utc>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let breaker = Breaker::new(store, BreakerConfig::default());
        let now = DateTime::parse_from_rfc3339("2026-08-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        (breaker, now)
    }

    #[test]
    fn five_consecutive_failures_open_the_circuit() {
        let (breaker, now) = setup();
        for i in 0..4 {
            breaker.record_failure(PROVIDER_SERVICE, now + Duration::seconds(i)).unwrap();
            assert_eq!(breaker.admit(PROVIDER_SERVICE, now).unwrap(), Admission::Proceed);
        }
        breaker.record_failure(PROVIDER_SERVICE, now + Duration::seconds(4)).unwrap();
        let state = breaker.state(PROVIDER_SERVICE).unwrap().unwrap();
        assert_eq!(state.state, CircuitStatus::Open);
        assert_eq!(state.consecutive_failures, 5);
        assert_eq!(
            breaker.admit(PROVIDER_SERVICE, now + Duration::seconds(5)).unwrap(),
            Admission::Rejected
        );
    }

    #[test]
    fn success_resets_the_failure_count() {
        let (breaker, now) = setup();
        for _ in 0..4 {
            breaker.record_failure(PROVIDER_SERVICE, now).unwrap();
        }
        breaker.record_success(PROVIDER_SERVICE, now).unwrap();
        let state = breaker.state(PROVIDER_SERVICE).unwrap().unwrap();
        assert_eq!(state.state, CircuitStatus::Closed);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn open_circuit_admits_one_probe_after_the_delay() {
        let (breaker, now) = setup();
        for _ in 0..5 {
            breaker.record_failure(PROVIDER_SERVICE, now).unwrap();
        }
        // Still cooling down
        assert_eq!(
            breaker.admit(PROVIDER_SERVICE, now + Duration::seconds(29)).unwrap(),
            Admission::Rejected
        );
        // Cooldown elapsed: exactly one probe
        let probe_time = now + Duration::seconds(30);
        assert_eq!(breaker.admit(PROVIDER_SERVICE, probe_time).unwrap(), Admission::Probe);
        assert_eq!(
            breaker.state(PROVIDER_SERVICE).unwrap().unwrap().state,
            CircuitStatus::HalfOpen
        );
        // Concurrent caller while the probe is in flight
        assert_eq!(breaker.admit(PROVIDER_SERVICE, probe_time).unwrap(), Admission::Rejected);
    }

    #[test]
    fn probe_success_closes_probe_failure_reopens() {
        let (breaker, now) = setup();
        for _ in 0..5 {
            breaker.record_failure(PROVIDER_SERVICE, now).unwrap();
        }
        let probe_time = now + Duration::seconds(30);
        assert_eq!(breaker.admit(PROVIDER_SERVICE, probe_time).unwrap(), Admission::Probe);
        breaker.record_failure(PROVIDER_SERVICE, probe_time + Duration::seconds(1)).unwrap();
        let state = breaker.state(PROVIDER_SERVICE).unwrap().unwrap();
        assert_eq!(state.state, CircuitStatus::Open);
        // Fresh cooldown from the probe failure
        assert_eq!(
            breaker
                .admit(PROVIDER_SERVICE, probe_time + Duration::seconds(20))
                .unwrap(),
            Admission::Rejected
        );
        let second_probe = probe_time + Duration::seconds(31);
        assert_eq!(breaker.admit(PROVIDER_SERVICE, second_probe).unwrap(), Admission::Probe);
        breaker.record_success(PROVIDER_SERVICE, second_probe).unwrap();
        let state = breaker.state(PROVIDER_SERVICE).unwrap().unwrap();
        assert_eq!(state.state, CircuitStatus::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(
            breaker.admit(PROVIDER_SERVICE, second_probe + Duration::seconds(1)).unwrap(),
            Admission::Proceed
        );
    }

    #[test]
    fn unknown_service_is_healthy() {
        let (breaker, now) = setup();
        assert!(breaker.is_healthy(PROVIDER_SERVICE).unwrap());
        for _ in 0..5 {
            breaker.record_failure(PROVIDER_SERVICE, now).unwrap();
        }
        assert!(!breaker.is_healthy(PROVIDER_SERVICE).unwrap());
    }
}
