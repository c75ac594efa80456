//! Provider-content redaction and HTTP status mapping.
//!
//! No provider field value may leave the core through an error message or a
//! log line. `redact` elides the value of any key/value fragment whose key is
//! on the denylist, whatever the surrounding syntax (JSON, query string,
//! prose).

use std::sync::OnceLock;

use regex::Regex;

use crate::models::provider::ErrorCode;

/// Keys whose values are provider content.
const DENYLIST: &[&str] = &[
    "displayName",
    "formattedAddress",
    "shortFormattedAddress",
    "nationalPhoneNumber",
    "internationalPhoneNumber",
    "websiteUri",
    "rating",
    "userRatingCount",
    "reviews",
    "photos",
    "regularOpeningHours",
    "currentOpeningHours",
    "editorialSummary",
    "priceLevel",
];

fn denylist_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let keys = DENYLIST.join("|");
        // Matches `"key": "value"`, `key=value`, `key: value` — the value is
        // a quoted string or a run of non-delimiter characters.
        Regex::new(&format!(
            r#"(?i)("?(?:{keys})"?\s*[:=]\s*)("(?:[^"\\]|\\.)*"|[^,}}\]\s]+)"#
        ))
        .expect("denylist regex must compile")
    })
}

/// Replace every denylisted value with `[REDACTED]`, keeping the key.
pub fn redact(text: &str) -> String {
    denylist_regex()
        .replace_all(text, "${1}[REDACTED]")
        .into_owned()
}

/// True when the text still contains an unredacted denylisted value.
/// Used by tests to assert the zero-leak property. The unquoted-value
/// pattern stops before `]`, so an already-elided value scans as
/// `[REDACTED` without the closing bracket.
pub fn contains_provider_content(text: &str) -> bool {
    denylist_regex()
        .captures_iter(text)
        .any(|c| !c[2].starts_with("[REDACTED"))
}

/// Map a transport status to the stable wire code.
pub fn status_to_code(status: u16) -> ErrorCode {
    match status {
        400 => ErrorCode::InvalidRequest,
        401 => ErrorCode::Unauthorized,
        403 => ErrorCode::Forbidden,
        404 => ErrorCode::NotFound,
        429 => ErrorCode::RateLimited,
        500 => ErrorCode::InternalError,
        502 => ErrorCode::BadGateway,
        503 => ErrorCode::ServiceUnavailable,
        504 => ErrorCode::GatewayTimeout,
        n => ErrorCode::Http(n),
    }
}

/// 429 and the 5xx gateway statuses are worth retrying; other 4xx are not.
pub fn is_retryable(status: u16) -> bool {
    status == 429 || (500..=504).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_json_fragments() {
        let input = r#"{"displayName": "Cafe Clock", "id": "abc123"}"#;
        let out = redact(input);
        assert!(out.contains(r#""displayName": [REDACTED]"#), "{out}");
        assert!(out.contains("abc123"));
        assert!(!out.contains("Cafe Clock"));
    }

    #[test]
    fn redacts_key_value_prose() {
        let out = redact("provider rejected formattedAddress=12 Rue de la Kasbah, retry later");
        assert!(!out.contains("Rue de la Kasbah"));
        assert!(out.contains("[REDACTED]"));
    }

    #[test]
    fn redaction_is_case_insensitive_and_total() {
        let input = r#"nationalPhoneNumber: +212 5 24 42 93 05; websiteUri=https://example.ma"#;
        let out = redact(input);
        assert!(!contains_provider_content(&out), "{out}");
        assert!(!out.contains("example.ma"));
    }

    #[test]
    fn leaves_clean_text_alone() {
        let input = "budget exceeded for text_search (97%)";
        assert_eq!(redact(input), input);
        assert!(!contains_provider_content(input));
    }

    #[test]
    fn status_mapping_is_stable() {
        assert_eq!(status_to_code(404), ErrorCode::NotFound);
        assert_eq!(status_to_code(429), ErrorCode::RateLimited);
        assert_eq!(status_to_code(503), ErrorCode::ServiceUnavailable);
        assert_eq!(status_to_code(418), ErrorCode::Http(418));
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable(429));
        assert!(is_retryable(500));
        assert!(is_retryable(504));
        assert!(!is_retryable(400));
        assert!(!is_retryable(404));
        assert!(!is_retryable(505));
    }
}
