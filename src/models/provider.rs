use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Stable wire codes for every error the gateway can surface.
/// `Http(n)` covers statuses without a named mapping as `HTTP_<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidFieldSet,
    InvalidEndpointClass,
    EndpointNotImplemented,
    MissingParameter,
    InvalidParameter,
    InvalidInput,
    LoadShed,
    CircuitOpen,
    BudgetExceeded,
    ConfigError,
    Timeout,
    NetworkError,
    InvalidRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RateLimited,
    InternalError,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    Http(u16),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::InvalidFieldSet => "INVALID_FIELD_SET",
            ErrorCode::InvalidEndpointClass => "INVALID_ENDPOINT_CLASS",
            ErrorCode::EndpointNotImplemented => "ENDPOINT_NOT_IMPLEMENTED",
            ErrorCode::MissingParameter => "MISSING_PARAMETER",
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::LoadShed => "LOAD_SHED",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::BudgetExceeded => "BUDGET_EXCEEDED",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::BadGateway => "BAD_GATEWAY",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::GatewayTimeout => "GATEWAY_TIMEOUT",
            ErrorCode::Http(n) => return write!(f, "HTTP_{n}"),
        };
        f.write_str(s)
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Typed error carried in a `ProviderResult`. The message has already been
/// through redaction by the time it is constructed.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn new(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
        }
    }
}

/// Circular location bias for searches and autocomplete.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationBias {
    pub lat: f64,
    pub lng: f64,
    pub radius_meters: f64,
}

/// Rectangular viewport, degrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

/// Parameters accepted by the gateway entry point.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRequestParams {
    pub field_set: String,
    pub endpoint_class: String,
    #[serde(default)]
    pub place_id: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub region_code: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub location_bias: Option<LocationBias>,
    #[serde(default)]
    pub location_restriction: Option<BoundingBox>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub included_primary_types: Option<Vec<String>>,
    /// Caller override for the load-shedder priority class (1..=4).
    #[serde(default)]
    pub priority: Option<u8>,
    /// Only honoured for HEALTH_CHECK.
    #[serde(default)]
    pub skip_budget_check: bool,
    /// Lets a text search return ID-only places straight from cache.
    #[serde(default)]
    pub allow_id_only_search_cache_response: bool,
}

/// Per-call metadata. Coalesced passengers get their own request_id and
/// latency around the shared payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMetadata {
    pub request_id: String,
    pub latency_ms: i64,
    pub cost_class: String,
    pub field_set: String,
    pub endpoint_class: String,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProviderError>,
    pub metadata: CallMetadata,
}

impl ProviderResult {
    pub fn ok(data: serde_json::Value, metadata: CallMetadata) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata,
        }
    }

    pub fn err(error: ProviderError, metadata: CallMetadata) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_to_wire_names() {
        assert_eq!(ErrorCode::CircuitOpen.to_string(), "CIRCUIT_OPEN");
        assert_eq!(ErrorCode::BudgetExceeded.to_string(), "BUDGET_EXCEEDED");
        assert_eq!(ErrorCode::Http(418).to_string(), "HTTP_418");
        let json = serde_json::to_string(&ErrorCode::GatewayTimeout).unwrap();
        assert_eq!(json, "\"GATEWAY_TIMEOUT\"");
    }

    #[test]
    fn params_accept_camel_case_wire_form() {
        let params: ProviderRequestParams = serde_json::from_value(serde_json::json!({
            "fieldSet": "TEXT_SEARCH",
            "endpointClass": "text_search",
            "query": "tagine",
            "locationBias": {"lat": 31.6295, "lng": -7.9811, "radiusMeters": 5000.0},
            "allowIdOnlySearchCacheResponse": true,
        }))
        .unwrap();
        assert_eq!(params.field_set, "TEXT_SEARCH");
        assert!(params.allow_id_only_search_cache_response);
        assert!(!params.skip_budget_check);
        assert_eq!(params.location_bias.unwrap().radius_meters, 5000.0);
    }
}
