use axum::Json;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header::RETRY_AFTER};
use axum::response::{IntoResponse, Response};
use tollgate_api_types::{ErrorBody, ErrorMessage, RateLimitRejection};

use crate::application::admission::Rejection;
use crate::application::error::ErrorReport;
use crate::application::quota::QuotaError;
use crate::application::repos::RepoError;
use crate::cache::CacheError;
use crate::domain::error::DomainError;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const NOT_FOUND: &str = "not_found";
    pub const UNKNOWN_TIER: &str = "unknown_tier";
    pub const ENTRY_TOO_LARGE: &str = "entry_too_large";
    pub const INVALID_INPUT: &str = "invalid_input";
    pub const DB_TIMEOUT: &str = "db_timeout";
    pub const DB_UNAVAILABLE: &str = "db_unavailable";
    pub const REPO: &str = "repo_error";
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn not_found(message: &'static str) -> Self {
        Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, message, None)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// `429` with the rejection body and rate-limit headers.
    pub fn rate_limited(rejection: &Rejection) -> Response {
        let body = RateLimitRejection::from(rejection);
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        apply_rate_limit_headers(response.headers_mut(), rejection);
        ErrorReport::from_message(
            "infra::http::rate_limit",
            StatusCode::TOO_MANY_REQUESTS,
            format!(
                "{}: limited_by={} retry_after={:?}",
                rejection.reason.code(),
                rejection.limited_by.as_str(),
                rejection.retry_after_secs
            ),
        )
        .attach(&mut response);
        response
    }
}

/// `Retry-After` and `X-RateLimit-*` for a refused call.
fn apply_rate_limit_headers(headers: &mut HeaderMap, rejection: &Rejection) {
    let pairs = [
        (
            RETRY_AFTER,
            rejection.retry_after_secs.map(|secs| secs.to_string()),
        ),
        (X_RATELIMIT_LIMIT, Some(rejection.tier.clone())),
        (
            X_RATELIMIT_REMAINING,
            Some(rejection.tokens_remaining.to_string()),
        ),
        (X_RATELIMIT_RESET, Some(rejection.reset_time_ms.to_string())),
    ];
    for (name, value) in pairs {
        if let Some(value) = value
            && let Ok(value) = HeaderValue::from_str(&value)
        {
            headers.insert(name, value);
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let hint = self.hint.clone();
        let body = ErrorBody {
            error: ErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        ErrorReport::from_message(
            "infra::http::api",
            self.status,
            format!("{}: {}", self.code, hint.as_deref().unwrap_or(self.message)),
        )
        .attach(&mut response);
        response
    }
}

impl From<RepoError> for ApiError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::InvalidInput { message } => Self::new(
                StatusCode::BAD_REQUEST,
                codes::INVALID_INPUT,
                "Invalid input",
                Some(message),
            ),
            RepoError::Timeout => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::DB_TIMEOUT,
                "Database timeout",
                None,
            ),
            RepoError::Unavailable => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                codes::DB_UNAVAILABLE,
                "Database unavailable",
                None,
            ),
            RepoError::Persistence(message) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::REPO,
                "Persistence error",
                Some(message),
            ),
        }
    }
}

impl From<QuotaError> for ApiError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Repo(repo) => repo.into(),
            QuotaError::Domain(DomainError::UnknownTier { name }) => Self::new(
                StatusCode::BAD_REQUEST,
                codes::UNKNOWN_TIER,
                "Unknown tier",
                Some(name),
            ),
            QuotaError::Domain(other) => Self::new(
                StatusCode::BAD_REQUEST,
                codes::INVALID_INPUT,
                "Invalid input",
                Some(other.to_string()),
            ),
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            codes::ENTRY_TOO_LARGE,
            "Entry too large for cache",
            Some(err.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use tollgate_api_types::LimitedBy;

    use super::*;
    use crate::application::admission::RejectionReason;

    #[test]
    fn rate_limited_sets_headers() {
        let rejection = Rejection {
            limited_by: LimitedBy::Global,
            reason: RejectionReason::Exhausted,
            tier: "user".to_string(),
            retry_after_secs: Some(4),
            tokens_remaining: 2,
            reset_time_ms: 9_000,
        };

        let response = ApiError::rate_limited(&rejection);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers[RETRY_AFTER], "4");
        assert_eq!(headers[X_RATELIMIT_LIMIT], "user");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "2");
        assert_eq!(headers[X_RATELIMIT_RESET], "9000");
        assert!(response.extensions().get::<ErrorReport>().is_some());
    }

    #[test]
    fn cost_above_burst_omits_retry_after() {
        let rejection = Rejection {
            limited_by: LimitedBy::User,
            reason: RejectionReason::CostExceedsBurst,
            tier: "guest".to_string(),
            retry_after_secs: None,
            tokens_remaining: 100,
            reset_time_ms: 9_000,
        };

        let response = ApiError::rate_limited(&rejection);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get(RETRY_AFTER).is_none());
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "100");
    }

    #[test]
    fn unknown_tier_maps_to_bad_request() {
        let err: ApiError = QuotaError::from(DomainError::unknown_tier("gold")).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn repo_timeout_maps_to_unavailable() {
        let err: ApiError = RepoError::Timeout.into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
