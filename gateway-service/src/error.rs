use actix_web::http::header;
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use error_types::{error_codes, ErrorResponse};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown client_id")]
    UnknownClient,

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Upstream grant revoked")]
    GrantRevoked,

    #[error("CSRF token missing or invalid")]
    CsrfRejected,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No active term covers today for this section")]
    NotInTerm,

    #[error("Upstream rate limit: user blocked")]
    UserBlocked {
        retry_after: i64,
        blocked_until: i64,
    },

    #[error("Upstream rate limit: service blocked")]
    ServiceBlocked,

    #[error("Upstream unavailable: {0}")]
    Upstream(String),

    #[error("Token refresh failed")]
    RefreshFailed,

    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: u64 },

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Redis(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::UnknownClient => StatusCode::BAD_REQUEST,
            AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::GrantRevoked => StatusCode::UNAUTHORIZED,
            AppError::CsrfRejected => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::NotInTerm => StatusCode::CONFLICT,
            AppError::UserBlocked { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::ServiceBlocked => StatusCode::TOO_MANY_REQUESTS,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::RefreshFailed => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();
        let (error_type, code) = match self {
            AppError::Database(_) => ("server_error", error_codes::DATABASE_ERROR),
            AppError::Redis(_) => ("server_error", error_codes::CACHE_ERROR),
            AppError::Validation(_) => ("validation_error", error_codes::INVALID_REQUEST),
            AppError::UnknownClient => ("validation_error", error_codes::UNKNOWN_CLIENT),
            AppError::Authentication(_) => ("authentication_error", error_codes::TOKEN_INVALID),
            AppError::GrantRevoked => ("authentication_error", error_codes::GRANT_REVOKED),
            AppError::CsrfRejected => ("authorization_error", error_codes::CSRF_INVALID),
            AppError::NotFound(_) => ("not_found_error", error_codes::INVALID_REQUEST),
            AppError::NotInTerm => ("conflict_error", error_codes::NOT_IN_TERM),
            AppError::UserBlocked { .. } => ("rate_limit_error", error_codes::USER_BLOCKED),
            AppError::ServiceBlocked => ("rate_limit_error", error_codes::SERVICE_BLOCKED),
            AppError::Upstream(_) => ("upstream_error", error_codes::UPSTREAM_UNAVAILABLE),
            AppError::RefreshFailed => ("server_error", error_codes::REFRESH_FAILED),
            AppError::RateLimitExceeded { .. } => {
                ("rate_limit_error", error_codes::RATE_LIMIT_ERROR)
            }
            AppError::Internal(_) => ("server_error", error_codes::INTERNAL_SERVER_ERROR),
        };

        let message = self.to_string();
        let details = match self {
            AppError::Database(e) => Some(e.to_string()),
            AppError::Redis(e) => Some(e.to_string()),
            AppError::Upstream(e) => Some(e.to_string()),
            _ => None,
        };

        let mut body = ErrorResponse::new(
            match status_code {
                StatusCode::BAD_REQUEST => "Bad Request",
                StatusCode::UNAUTHORIZED => "Unauthorized",
                StatusCode::FORBIDDEN => "Forbidden",
                StatusCode::NOT_FOUND => "Not Found",
                StatusCode::CONFLICT => "Conflict",
                StatusCode::TOO_MANY_REQUESTS => "Too Many Requests",
                StatusCode::BAD_GATEWAY => "Bad Gateway",
                StatusCode::INTERNAL_SERVER_ERROR => "Internal Server Error",
                _ => "Error",
            },
            &message,
            status_code.as_u16(),
            error_type,
            code,
        );
        if let Some(detail) = details {
            body = body.with_details(detail);
        }

        let mut builder = HttpResponse::build(status_code);
        match self {
            AppError::UserBlocked {
                retry_after,
                blocked_until,
            } => {
                body = body
                    .with_retry_after((*retry_after).max(1) as u64)
                    .with_blocked_until(*blocked_until);
                builder.insert_header((header::RETRY_AFTER, (*retry_after).max(1).to_string()));
            }
            AppError::ServiceBlocked => {
                body = body.with_retry_after(60);
                builder.insert_header((header::RETRY_AFTER, "60"));
            }
            AppError::RateLimitExceeded { retry_after } => {
                let retry_after = (*retry_after).max(1);
                body = body.with_retry_after(retry_after);
                builder.insert_header((header::RETRY_AFTER, retry_after.to_string()));
            }
            AppError::Authentication(_) | AppError::GrantRevoked => {
                builder.insert_header((header::WWW_AUTHENTICATE, "Bearer realm=\"API\""));
            }
            _ => {}
        }

        builder.json(body)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON serialization error: {}", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::MessageBody;

    fn body_json(resp: HttpResponse) -> serde_json::Value {
        let bytes = resp
            .into_body()
            .try_into_bytes()
            .ok()
            .expect("body is not in-memory");
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn user_blocked_carries_retry_after_header_and_body() {
        let err = AppError::UserBlocked {
            retry_after: 1800,
            blocked_until: 1_700_001_800,
        };
        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get(header::RETRY_AFTER).unwrap(),
            "1800"
        );
        let json = body_json(resp);
        assert_eq!(json["retry_after"], 1800);
        assert_eq!(json["blocked_until"], 1_700_001_800i64);
        assert_eq!(json["code"], "USER_BLOCKED");
    }

    #[test]
    fn rate_limited_retry_after_is_at_least_one() {
        let err = AppError::RateLimitExceeded { retry_after: 0 };
        let resp = err.error_response();
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }

    #[test]
    fn auth_errors_advertise_bearer_realm() {
        let resp = AppError::Authentication("bad token".into()).error_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer realm=\"API\""
        );
    }

    #[test]
    fn not_in_term_maps_to_conflict() {
        let resp = AppError::NotInTerm.error_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp)["code"], "NOT_IN_TERM");
    }
}
