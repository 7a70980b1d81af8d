//! Unified error envelope for the gateway HTTP surface.
//!
//! Every non-OAuth error response rendered by the service uses this JSON
//! shape, so the admin SPA and device firmware can route on `error_type`
//! and `code` without parsing free-form messages. The RFC-8628 token
//! endpoint is the one exception: it speaks bare `{"error": "..."}` bodies
//! as the device-flow RFC requires.

use serde::{Deserialize, Serialize};

/// Standard API error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short human-readable title ("Unauthorized", "Too Many Requests").
    pub error: String,

    /// User-facing message.
    pub message: String,

    /// HTTP status code, duplicated in the body for clients that lose it.
    pub status: u16,

    /// Coarse category for client-side routing:
    /// `validation_error`, `authentication_error`, `authorization_error`,
    /// `not_found_error`, `conflict_error`, `rate_limit_error`,
    /// `upstream_error`, `server_error`.
    pub error_type: String,

    /// Stable machine code, see [`error_codes`].
    pub code: String,

    /// Extra context, only populated for server-side failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    /// Seconds the client should wait before retrying (rate-limit errors).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,

    /// Unix timestamp the caller may retry at (rate-limit errors).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<i64>,

    /// ISO 8601 timestamp of the response.
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, status: u16, error_type: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            status,
            error_type: error_type.to_string(),
            code: code.to_string(),
            details: None,
            retry_after: None,
            blocked_until: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, retry_after: u64) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_blocked_until(mut self, blocked_until: i64) -> Self {
        self.blocked_until = Some(blocked_until);
        self
    }
}

/// Stable error codes emitted by the gateway.
pub mod error_codes {
    // Input
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNKNOWN_CLIENT: &str = "UNKNOWN_CLIENT";
    pub const INVALID_SECTION: &str = "INVALID_SECTION";

    // Authentication
    pub const TOKEN_MISSING: &str = "TOKEN_MISSING";
    pub const TOKEN_INVALID: &str = "TOKEN_INVALID";
    pub const GRANT_REVOKED: &str = "GRANT_REVOKED";
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    pub const CSRF_INVALID: &str = "CSRF_INVALID";

    // Upstream
    pub const UPSTREAM_UNAVAILABLE: &str = "UPSTREAM_UNAVAILABLE";
    pub const REFRESH_FAILED: &str = "REFRESH_FAILED";
    pub const USER_BLOCKED: &str = "USER_BLOCKED";
    pub const SERVICE_BLOCKED: &str = "SERVICE_BLOCKED";
    pub const NOT_IN_TERM: &str = "NOT_IN_TERM";

    // Write path
    pub const LOCK_CONTENTION: &str = "LOCK_CONTENTION";
    pub const DUPLICATE_UPDATE: &str = "DUPLICATE_UPDATE";

    // Infrastructure
    pub const DATABASE_ERROR: &str = "DATABASE_ERROR";
    pub const CACHE_ERROR: &str = "CACHE_ERROR";
    pub const RATE_LIMIT_ERROR: &str = "RATE_LIMIT_ERROR";
    pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_are_omitted_when_unset() {
        let body = ErrorResponse::new("Unauthorized", "bad token", 401, "authentication_error", error_codes::TOKEN_INVALID);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], 401);
        assert_eq!(json["code"], "TOKEN_INVALID");
        assert!(json.get("details").is_none());
        assert!(json.get("retry_after").is_none());
        assert!(json.get("blocked_until").is_none());
    }

    #[test]
    fn rate_limit_fields_round_trip() {
        let body = ErrorResponse::new("Too Many Requests", "blocked", 429, "rate_limit_error", error_codes::USER_BLOCKED)
            .with_retry_after(1800)
            .with_blocked_until(1_700_001_800);
        let json = serde_json::to_string(&body).unwrap();
        let back: ErrorResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.retry_after, Some(1800));
        assert_eq!(back.blocked_until, Some(1_700_001_800));
    }
}
