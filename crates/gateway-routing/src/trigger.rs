//! Fallback trigger detection.
//!
//! A failure advances to the next fallback entry when its status is in
//! [`TRIGGER_STATUS_CODES`] or its body names a quota, rate-limit, capacity,
//! authentication or model-availability problem. Success statuses never
//! trigger, whatever the body says.

use gateway_core::GatewayError;

/// Statuses that always trigger fallback
pub const TRIGGER_STATUS_CODES: [u16; 7] = [429, 503, 500, 400, 401, 403, 422];

/// Lowercase body phrases that trigger fallback
pub const TRIGGER_PATTERNS: &[&str] = &[
    // quota
    "quota exceeded",
    "quota_exceeded",
    "exceeded your current quota",
    "insufficient_quota",
    "usage limit",
    "resource exhausted",
    "resource_exhausted",
    // rate limit
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    // capacity
    "overloaded",
    "capacity",
    "temporarily unavailable",
    // authentication
    "unauthorized",
    "unauthenticated",
    "invalid api key",
    "invalid_api_key",
    "invalid x-api-key",
    "authentication",
    "permission denied",
    // model availability
    "model not found",
    "model_not_found",
    "does not exist",
    "not supported model",
];

/// Whether an upstream status (and optional body) should trigger fallback
#[must_use]
pub fn should_trigger_fallback(status_code: u16, body: Option<&str>) -> bool {
    if (200..300).contains(&status_code) {
        return false;
    }
    if TRIGGER_STATUS_CODES.contains(&status_code) {
        return true;
    }
    body.is_some_and(|body| {
        let body = body.to_ascii_lowercase();
        TRIGGER_PATTERNS.iter().any(|p| body.contains(p))
    })
}

/// Whether a dispatch error should advance to the next fallback entry.
///
/// Besides the status rules, transport failures, timeouts and an open
/// circuit advance too. Cancellation never does.
#[must_use]
pub fn should_trigger_for_error(error: &GatewayError) -> bool {
    match error.root_cause() {
        GatewayError::Cancelled => false,
        GatewayError::Network { .. }
        | GatewayError::Timeout { .. }
        | GatewayError::CircuitOpen { .. } => true,
        root => should_trigger_fallback(root.status_code(), error.body()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::NetworkErrorKind;
    use std::time::Duration;

    #[test]
    fn test_success_never_triggers() {
        assert!(!should_trigger_fallback(200, Some("quota exceeded")));
        assert!(!should_trigger_fallback(200, Some("")));
        assert!(!should_trigger_fallback(204, None));
    }

    #[test]
    fn test_status_codes_trigger() {
        assert!(should_trigger_fallback(429, Some("")));
        for status in TRIGGER_STATUS_CODES {
            assert!(should_trigger_fallback(status, None), "{status}");
        }
    }

    #[test]
    fn test_body_patterns() {
        assert!(should_trigger_fallback(500, Some("quota exceeded for today")));
        assert!(should_trigger_fallback(404, Some(r#"{"error":{"code":"model_not_found"}}"#)));
        assert!(should_trigger_fallback(529, Some("Overloaded")));
        assert!(should_trigger_fallback(402, Some("You EXCEEDED YOUR CURRENT QUOTA")));
        assert!(!should_trigger_fallback(404, Some("no such route")));
        assert!(!should_trigger_fallback(502, None));
    }

    #[test]
    fn test_error_classification() {
        assert!(should_trigger_for_error(&GatewayError::status("a", 401, "bad key")));
        assert!(should_trigger_for_error(&GatewayError::RetryExhausted {
            attempts: 3,
            last_error: Box::new(GatewayError::status("a", 504, "rate limit reached")),
        }));
        assert!(should_trigger_for_error(&GatewayError::network(
            NetworkErrorKind::ConnectionRefused,
            "refused"
        )));
        assert!(should_trigger_for_error(&GatewayError::timeout(Duration::from_secs(1), "call")));
        assert!(!should_trigger_for_error(&GatewayError::Cancelled));
        assert!(!should_trigger_for_error(&GatewayError::status("a", 404, "not here")));
    }
}
