//! The provider gateway: the only path to the external Places provider.
//!
//! Every call runs the same gauntlet — field-set validation, cache probe,
//! singleflight coalescing, load shedding, circuit breaker, budget gate —
//! before anything leaves the process. Outbound execution sits behind the
//! `ProviderTransport` trait so tests drive the whole pipeline without a
//! network.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::breaker::{Admission, Breaker, PROVIDER_SERVICE};
use crate::budget::BudgetEnforcer;
use crate::field_sets::{self, EndpointClass, FieldSet};
use crate::load_shed::LoadShedder;
use crate::metrics::{self, MetricsSink};
use crate::models::metrics::MetricEvent;
use crate::models::provider::{
    CallMetadata, ErrorCode, ProviderError, ProviderRequestParams, ProviderResult,
};
use crate::redact;
use crate::search_cache::{self, SearchKeyParams, round3};
use crate::singleflight::Singleflight;
use crate::store::{Store, now_ts};

pub const PROVIDER_BASE_URL: &str = "https://places.googleapis.com/v1";
pub const PROVIDER_NAME: &str = "google";
pub const DEFAULT_LANGUAGE: &str = "en";
pub const DEFAULT_REGION: &str = "MA";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

const DEFAULT_AUTOCOMPLETE_TYPES: &[&str] = &["restaurant", "cafe", "bakery", "food"];

// ── Outbound transport seam ──

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<serde_json::Value>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct OutboundResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
}

#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn execute(&self, req: OutboundRequest) -> Result<OutboundResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderTransport for ReqwestTransport {
    async fn execute(&self, req: OutboundRequest) -> Result<OutboundResponse, TransportError> {
        let mut builder = match req.method {
            "POST" => self.client.post(&req.url),
            _ => self.client.get(&req.url),
        };
        for (name, value) in &req.headers {
            builder = builder.header(*name, value);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }
        // reqwest drops the in-flight request when the timeout elapses.
        let response = builder.timeout(req.timeout).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network(e.to_string())
            }
        })?;
        let status = response.status().as_u16();
        let body = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or_else(|_| json!({}));
        Ok(OutboundResponse { status, body })
    }
}

// ── Gateway ──

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub timeout_secs: u64,
    pub base_url: String,
    /// Set at startup from `GOOGLE_PLACES_API_KEY`; falls back to the process
    /// env on each call so key rotation does not need a restart.
    pub api_key: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            base_url: PROVIDER_BASE_URL.to_string(),
            api_key: None,
        }
    }
}

/// Payload shared between singleflight passengers. Metadata stays per-caller.
#[derive(Debug, Clone)]
struct SharedOutcome {
    data: Option<serde_json::Value>,
    error: Option<ProviderError>,
    cost_class: String,
    cache_hit: bool,
}

impl SharedOutcome {
    fn failure(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            data: None,
            error: Some(ProviderError::new(code, redact::redact(&message.into()), retryable)),
            cost_class: "none".to_string(),
            cache_hit: false,
        }
    }
}

pub struct Gateway {
    store: Arc<Store>,
    breaker: Breaker,
    budget: Arc<BudgetEnforcer>,
    shedder: Arc<LoadShedder>,
    singleflight: Singleflight<SharedOutcome>,
    metrics: MetricsSink,
    transport: Arc<dyn ProviderTransport>,
    config: GatewayConfig,
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        breaker: Breaker,
        budget: Arc<BudgetEnforcer>,
        shedder: Arc<LoadShedder>,
        metrics: MetricsSink,
        transport: Arc<dyn ProviderTransport>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            store,
            breaker,
            budget,
            shedder,
            singleflight: Singleflight::new(),
            metrics,
            transport,
            config,
        }
    }

    /// Single public entry point for all provider access.
    pub async fn provider_request(&self, params: ProviderRequestParams) -> ProviderResult {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let refusal = |code: ErrorCode, message: &str| {
            ProviderResult::err(
                ProviderError::new(code, message, false),
                CallMetadata {
                    request_id: request_id.clone(),
                    latency_ms: 0,
                    cost_class: "none".to_string(),
                    field_set: params.field_set.clone(),
                    endpoint_class: params.endpoint_class.clone(),
                    cache_hit: false,
                },
            )
        };

        // 1. Validation. Refusals charge zero latency.
        let Some(mut field_set) = field_sets::get(&params.field_set) else {
            return refusal(
                ErrorCode::InvalidFieldSet,
                &format!("unknown field set: {}", params.field_set),
            );
        };
        let Some(class) = EndpointClass::parse(&params.endpoint_class) else {
            return refusal(
                ErrorCode::InvalidEndpointClass,
                &format!("unknown endpoint class: {}", params.endpoint_class),
            );
        };
        match class {
            EndpointClass::PlaceDetails => {
                if params.place_id.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return refusal(ErrorCode::MissingParameter, "placeId is required");
                }
            }
            EndpointClass::TextSearch => {
                if params.query.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return refusal(ErrorCode::MissingParameter, "query is required");
                }
            }
            EndpointClass::Autocomplete => {
                let input = params.input.as_deref().map(str::trim).unwrap_or("");
                if input.is_empty() {
                    return refusal(ErrorCode::MissingParameter, "input is required");
                }
                if input.chars().count() < 2 {
                    return refusal(
                        ErrorCode::InvalidParameter,
                        "input must be at least 2 characters",
                    );
                }
            }
            EndpointClass::Health | EndpointClass::NearbySearch | EndpointClass::Photos => {
                return refusal(
                    ErrorCode::EndpointNotImplemented,
                    &format!("endpoint class not implemented: {}", class.as_str()),
                );
            }
        }

        // 2. Defaults.
        let language = params
            .language
            .clone()
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());
        let region = params
            .region_code
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        // Budget mitigation downgrade: enhanced details fall back to the
        // standard mask while place_details_enhanced is off.
        if field_set.name == "PLACE_DETAILS_WITH_PHOTOS" {
            match self.store.flag_is_enabled("place_details_enhanced") {
                Ok(true) => {}
                Ok(false) => {
                    if let Some(standard) = field_sets::get("PLACE_DETAILS_STANDARD") {
                        field_set = standard;
                    }
                }
                Err(e) => tracing::warn!("gateway: flag read failed: {e}"),
            }
        }

        // 3. Text-search cache probe.
        let mut cache_key = None;
        if class == EndpointClass::TextSearch {
            let key = search_cache::generate_cache_key(&SearchKeyParams {
                query: params.query.as_deref().unwrap_or(""),
                city: params.city.as_deref(),
                language: Some(&language),
                location_bias: params.location_bias,
                location_restriction: params.location_restriction,
            });
            match search_cache::lookup(&self.store, &key) {
                Ok(Some(place_keys)) if params.allow_id_only_search_cache_response => {
                    self.emit_cache_probe(class, true);
                    let places: Vec<serde_json::Value> =
                        place_keys.iter().map(|k| json!({ "placeKey": k })).collect();
                    return ProviderResult::ok(
                        json!({ "places": places, "cachedResult": true }),
                        CallMetadata {
                            request_id,
                            latency_ms: started.elapsed().as_millis() as i64,
                            cost_class: "none".to_string(),
                            field_set: field_set.name.to_string(),
                            endpoint_class: class.as_str().to_string(),
                            cache_hit: true,
                        },
                    );
                }
                // A hit the caller cannot use as a response still counts in
                // the hit-rate stream, but skips nothing: UI flows need full
                // provider fields.
                Ok(Some(_)) => self.emit_cache_probe(class, true),
                Ok(None) => self.emit_cache_probe(class, false),
                Err(e) => tracing::warn!("gateway: search cache probe failed: {e}"),
            }
            cache_key = Some(key);
        }

        // 4. Priority and singleflight key.
        let priority = params
            .priority
            .filter(|p| (1..=4).contains(p))
            .unwrap_or_else(|| class.default_priority());
        let sf_key = singleflight_key(class, &params, field_set, &language, &region, cache_key.as_deref(), priority);

        let exec = || {
            self.execute_call(
                class,
                field_set,
                &params,
                priority,
                cache_key.clone(),
                &language,
                &region,
            )
        };
        let (outcome, _was_owner) = self.singleflight.run(&sf_key, exec).await;

        // 11. One redacted metric per caller, with its own latency.
        let latency_ms = started.elapsed().as_millis() as i64;
        self.emit_call_metric(class, field_set, &outcome, latency_ms);

        let metadata = CallMetadata {
            request_id,
            latency_ms,
            cost_class: outcome.cost_class.clone(),
            field_set: field_set.name.to_string(),
            endpoint_class: class.as_str().to_string(),
            cache_hit: outcome.cache_hit,
        };
        match outcome.error {
            Some(error) => ProviderResult::err(error, metadata),
            None => ProviderResult {
                success: true,
                data: outcome.data,
                error: None,
                metadata,
            },
        }
    }

    /// Steps 5–10: the gates and the outbound call. Runs once per
    /// singleflight group.
    async fn execute_call(
        &self,
        class: EndpointClass,
        field_set: &'static FieldSet,
        params: &ProviderRequestParams,
        priority: u8,
        cache_key: Option<String>,
        language: &str,
        region: &str,
    ) -> SharedOutcome {
        // (a) Load shedder. The permit releases on every exit path below.
        let _permit = match self.shedder.acquire(priority).await {
            Ok(permit) => permit,
            Err(reason) => {
                return SharedOutcome::failure(
                    ErrorCode::LoadShed,
                    format!("request shed ({})", reason.as_str()),
                    true,
                );
            }
        };

        // (b) Circuit breaker.
        match self.breaker.admit(PROVIDER_SERVICE, Utc::now()) {
            Ok(Admission::Proceed) | Ok(Admission::Probe) => {}
            Ok(Admission::Rejected) => {
                return SharedOutcome::failure(
                    ErrorCode::CircuitOpen,
                    "provider circuit is open",
                    true,
                );
            }
            Err(e) => {
                return SharedOutcome::failure(
                    ErrorCode::InternalError,
                    format!("breaker state unavailable: {e}"),
                    true,
                );
            }
        }

        // (c) Budget gate. skip_budget_check is only honoured for the
        // health-check mask.
        let skip_budget = params.skip_budget_check && field_set.name == "HEALTH_CHECK";
        if !skip_budget {
            match self.budget.check(class, Utc::now()) {
                Ok(check) if !check.allowed => {
                    return SharedOutcome::failure(
                        ErrorCode::BudgetExceeded,
                        format!(
                            "daily budget exhausted for {} ({} of {} millicents)",
                            class.as_str(),
                            check.used,
                            check.limit
                        ),
                        false,
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    return SharedOutcome::failure(
                        ErrorCode::InternalError,
                        format!("budget state unavailable: {e}"),
                        true,
                    );
                }
            }
        }

        // (d) API key.
        let Some(api_key) = self
            .config
            .api_key
            .clone()
            .or_else(|| std::env::var("GOOGLE_PLACES_API_KEY").ok())
        else {
            return SharedOutcome::failure(
                ErrorCode::ConfigError,
                "GOOGLE_PLACES_API_KEY is not configured",
                false,
            );
        };

        // 6–7. Build and execute the outbound call.
        let outbound = self.build_outbound(class, field_set, params, language, region, &api_key);
        let result = self.transport.execute(outbound).await;

        // 8. Budget usage at the declared max cost, never blocking the reply.
        if !skip_budget {
            if let Err(e) = self
                .budget
                .record(class, field_set.max_cost_millicents, Utc::now())
            {
                tracing::warn!("gateway: budget record failed: {e}");
            }
        }

        // 9–10. Breaker bookkeeping and the cache write.
        match result {
            Err(TransportError::Timeout) => {
                self.note_breaker_failure();
                SharedOutcome::failure(ErrorCode::Timeout, "provider request timed out", true)
            }
            Err(TransportError::Network(message)) => {
                self.note_breaker_failure();
                SharedOutcome::failure(ErrorCode::NetworkError, message, true)
            }
            Ok(response) if (200..300).contains(&response.status) => {
                if let Err(e) = self.breaker.record_success(PROVIDER_SERVICE, Utc::now()) {
                    tracing::warn!("gateway: breaker update failed: {e}");
                }
                if class == EndpointClass::TextSearch {
                    if let Some(key) = cache_key {
                        self.write_search_cache(key, &response.body);
                    }
                }
                SharedOutcome {
                    data: Some(response.body),
                    error: None,
                    cost_class: field_set.cost_tier.as_str().to_string(),
                    cache_hit: false,
                }
            }
            Ok(response) => {
                if redact::is_retryable(response.status) {
                    self.note_breaker_failure();
                } else if let Err(e) = self.breaker.record_success(PROVIDER_SERVICE, Utc::now()) {
                    // A plain 4xx means the provider is up; it still closes
                    // a half-open probe.
                    tracing::warn!("gateway: breaker update failed: {e}");
                }
                let code = redact::status_to_code(response.status);
                SharedOutcome::failure(
                    code,
                    format!("provider returned HTTP {}", response.status),
                    redact::is_retryable(response.status),
                )
            }
        }
    }

    fn note_breaker_failure(&self) {
        if let Err(e) = self.breaker.record_failure(PROVIDER_SERVICE, Utc::now()) {
            tracing::warn!("gateway: breaker update failed: {e}");
        }
    }

    /// Asynchronous ID-only cache write. Failures are logged and dropped;
    /// they must never fail the user-visible response.
    fn write_search_cache(&self, cache_key: String, body: &serde_json::Value) {
        let place_keys = extract_place_keys(body);
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = search_cache::write(&store, &cache_key, &place_keys, PROVIDER_NAME) {
                tracing::warn!("gateway: search cache write failed: {e}");
            }
        });
    }

    fn emit_cache_probe(&self, class: EndpointClass, hit: bool) {
        let name = if hit { metrics::CACHE_HIT } else { metrics::CACHE_MISS };
        let mut event = MetricEvent::new(name, 1.0, now_ts());
        event.endpoint = Some(class.as_str().to_string());
        event.cache_hit = Some(hit);
        self.metrics.emit(event);
    }

    fn emit_call_metric(
        &self,
        class: EndpointClass,
        field_set: &FieldSet,
        outcome: &SharedOutcome,
        latency_ms: i64,
    ) {
        let name = if outcome.error.is_none() {
            metrics::API_CALL_SUCCESS
        } else {
            metrics::API_CALL_ERROR
        };
        let mut event = MetricEvent::new(name, latency_ms as f64, now_ts());
        event.endpoint = Some(class.as_str().to_string());
        event.cost_tier = Some(field_set.cost_tier.as_str().to_string());
        event.cache_hit = Some(outcome.cache_hit);
        self.metrics.emit(event);
        if class == EndpointClass::TextSearch {
            let mut latency = MetricEvent::new(metrics::SEARCH_LATENCY, latency_ms as f64, now_ts());
            latency.endpoint = Some(class.as_str().to_string());
            self.metrics.emit(latency);
        }
    }

    /// Outbound request per §6 of the provider contract. The session token
    /// goes in the header for everything except autocomplete, where the
    /// provider expects it in the body.
    fn build_outbound(
        &self,
        class: EndpointClass,
        field_set: &FieldSet,
        params: &ProviderRequestParams,
        language: &str,
        region: &str,
        api_key: &str,
    ) -> OutboundRequest {
        let mut headers: Vec<(&'static str, String)> = vec![
            ("Content-Type", "application/json".to_string()),
            ("X-Goog-Api-Key", api_key.to_string()),
            ("X-Goog-FieldMask", field_set.mask.to_string()),
        ];
        if class != EndpointClass::Autocomplete {
            if let Some(token) = &params.session_token {
                headers.push(("X-Goog-Session-Token", token.clone()));
            }
        }
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let base = &self.config.base_url;

        match class {
            EndpointClass::PlaceDetails => OutboundRequest {
                method: "GET",
                url: format!(
                    "{base}/places/{}?languageCode={}&regionCode={}",
                    urlencoding::encode(params.place_id.as_deref().unwrap_or("")),
                    urlencoding::encode(language),
                    urlencoding::encode(region),
                ),
                headers,
                body: None,
                timeout,
            },
            EndpointClass::Autocomplete => {
                let mut body = json!({
                    "input": params.input.as_deref().unwrap_or(""),
                    "languageCode": language,
                    "regionCode": region,
                    "includedPrimaryTypes": effective_types(params),
                });
                if let Some(token) = &params.session_token {
                    body["sessionToken"] = json!(token);
                }
                if let Some(lb) = params.location_bias {
                    body["locationBias"] = json!({
                        "circle": {
                            "center": { "latitude": lb.lat, "longitude": lb.lng },
                            "radius": lb.radius_meters,
                        }
                    });
                }
                OutboundRequest {
                    method: "POST",
                    url: format!("{base}/places:autocomplete"),
                    headers,
                    body: Some(body),
                    timeout,
                }
            }
            // Only the three implemented classes reach this point.
            _ => {
                let mut body = json!({
                    "textQuery": params.query.as_deref().unwrap_or(""),
                    "languageCode": language,
                    "regionCode": region,
                });
                if let Some(lb) = params.location_bias {
                    body["locationBias"] = json!({
                        "circle": {
                            "center": { "latitude": lb.lat, "longitude": lb.lng },
                            "radius": lb.radius_meters,
                        }
                    });
                }
                if let Some(lr) = params.location_restriction {
                    body["locationRestriction"] = json!({
                        "rectangle": {
                            "low": { "latitude": lr.south, "longitude": lr.west },
                            "high": { "latitude": lr.north, "longitude": lr.east },
                        }
                    });
                }
                OutboundRequest {
                    method: "POST",
                    url: format!("{base}/places:searchText"),
                    headers,
                    body: Some(body),
                    timeout,
                }
            }
        }
    }
}

fn effective_types(params: &ProviderRequestParams) -> Vec<String> {
    match &params.included_primary_types {
        Some(types) if !types.is_empty() => types.clone(),
        _ => DEFAULT_AUTOCOMPLETE_TYPES.iter().map(|t| t.to_string()).collect(),
    }
}

/// Coalescing key per call shape, suffixed with the priority class so that
/// different priorities never share an outcome.
fn singleflight_key(
    class: EndpointClass,
    params: &ProviderRequestParams,
    field_set: &FieldSet,
    language: &str,
    region: &str,
    cache_key: Option<&str>,
    priority: u8,
) -> String {
    match class {
        EndpointClass::PlaceDetails => format!(
            "details:{}|fs:{}|lang:{language}|region:{region}:p{priority}",
            params.place_id.as_deref().unwrap_or(""),
            field_set.name,
        ),
        EndpointClass::Autocomplete => {
            let lb = params
                .location_bias
                .map(|lb| format!("{},{},{}", round3(lb.lat), round3(lb.lng), lb.radius_meters))
                .unwrap_or_default();
            let mut types = effective_types(params);
            types.sort();
            format!(
                "autocomplete:{}|lang:{language}|region:{region}|lb:{lb}|types:{}|fs:{}:p{priority}",
                params.input.as_deref().unwrap_or(""),
                types.join(","),
                field_set.name,
            )
        }
        _ => format!(
            "text_search:{region}|{}|{}:p{priority}",
            field_set.name,
            cache_key.unwrap_or(""),
        ),
    }
}

/// Pull provider place IDs out of a search response and re-tag them as
/// opaque place keys. `name` is `places/{id}`; `id` is the bare form.
fn extract_place_keys(body: &serde_json::Value) -> Vec<String> {
    body.get("places")
        .and_then(|p| p.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|place| {
                    if let Some(name) = place.get("name").and_then(|v| v.as_str()) {
                        if let Some(id) = name.strip_prefix("places/") {
                            return Some(format!("g:{id}"));
                        }
                    }
                    place
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(|id| format!("g:{id}"))
                })
                .collect()
        })
        .unwrap_or_default()
}
