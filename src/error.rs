use std::fmt::{Debug, Display};
use std::net::IpAddr;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::rate_limit::RateLimitStatus;
use crate::reflink::{AiFeature, ReflinkRejection};

/// Crate-wide error type.
///
/// Errors are constructed close to the point of detection (inside the owning
/// manager) and propagate unchanged through the facade to the route handler,
/// which maps them to HTTP via [`IntoResponse`]. The enum is closed so callers
/// exhaustively handle every denial reason.
#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new`
// method and log the error. Boxed per the `clippy::result_large_err` lint.
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }

    /// Build the `(status, body)` pair routes return for this error.
    ///
    /// Blacklist denials are deliberately generic toward the caller: the
    /// requester's own IP and the internal violation reason are logged
    /// server-side but never echoed back.
    pub fn to_response_json(&self) -> (StatusCode, Value) {
        let status = self.status_code();
        let body = match self.get_details() {
            ErrorDetails::RateLimitExceeded { status } => json!({
                "error": {
                    "code": "RATE_LIMIT_EXCEEDED",
                    "message": self.to_string(),
                    "details": {
                        "requests_remaining": status.requests_remaining,
                        "daily_limit": status.daily_limit,
                        "reset_time": status.reset_at.to_rfc3339(),
                        "tier": status.tier,
                        "retry_after": status.retry_after_secs(),
                    }
                }
            }),
            ErrorDetails::SecurityViolation {
                violation_count, ..
            } => json!({
                "error": {
                    "code": "SECURITY_VIOLATION_ERROR",
                    "message": "Access temporarily restricted",
                    "details": {
                        "reason": "policy_violation",
                        "violation_count": violation_count,
                    }
                }
            }),
            ErrorDetails::Reflink { code, reason } => json!({
                "error": {
                    "code": "REFLINK_ERROR",
                    "message": self.to_string(),
                    "details": { "code": code, "reason": reason }
                }
            }),
            ErrorDetails::ReflinkNotFound { id } => json!({
                "error": {
                    "code": "REFLINK_ERROR",
                    "message": self.to_string(),
                    "details": { "id": id, "reason": ReflinkRejection::NotFound }
                }
            }),
            ErrorDetails::FeatureDisabled { feature } => json!({
                "error": {
                    "code": "FEATURE_DISABLED",
                    "message": self.to_string(),
                    "details": { "feature": feature.to_string() }
                }
            }),
            ErrorDetails::StoreUnavailable { .. } => json!({
                "error": {
                    "code": "STORE_UNAVAILABLE",
                    "message": "Access control backend temporarily unavailable",
                }
            }),
            ErrorDetails::InvalidRequest { message } => json!({
                "error": { "code": "INVALID_REQUEST", "message": message }
            }),
            ErrorDetails::Config { .. } | ErrorDetails::InternalError { .. } => json!({
                "error": { "code": "INTERNAL_ERROR", "message": "Internal server error" }
            }),
        };
        (status, body)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, PartialEq)]
pub enum ErrorDetails {
    /// The caller's daily request quota is exhausted. Recoverable after
    /// `status.reset_at`; always surfaced with remaining-quota telemetry.
    RateLimitExceeded { status: RateLimitStatus },
    /// An operation was attempted against an actively blacklisted IP.
    SecurityViolation {
        reason: String,
        ip_address: IpAddr,
        violation_count: u32,
    },
    /// An invalid/expired/exhausted/unknown reflink code was supplied.
    Reflink {
        code: String,
        reason: ReflinkRejection,
    },
    /// Administrative lookup by id missed.
    ReflinkNotFound { id: Uuid },
    /// The reflink is valid but does not grant the requested feature.
    FeatureDisabled { feature: AiFeature },
    /// Backing-store failure or timeout. Mapped to fail-open/fail-closed by
    /// the owning manager; never surfaced as a distinct user-facing taxonomy.
    StoreUnavailable {
        operation: &'static str,
        message: String,
    },
    InvalidRequest { message: String },
    Config { message: String },
    InternalError { message: String },
}

impl ErrorDetails {
    /// Defines the log level for this error
    fn level(&self) -> tracing::Level {
        match self {
            ErrorDetails::RateLimitExceeded { .. } => tracing::Level::DEBUG,
            ErrorDetails::SecurityViolation { .. } => tracing::Level::WARN,
            ErrorDetails::Reflink { .. } => tracing::Level::INFO,
            ErrorDetails::ReflinkNotFound { .. } => tracing::Level::INFO,
            ErrorDetails::FeatureDisabled { .. } => tracing::Level::INFO,
            ErrorDetails::StoreUnavailable { .. } => tracing::Level::ERROR,
            ErrorDetails::InvalidRequest { .. } => tracing::Level::DEBUG,
            ErrorDetails::Config { .. } => tracing::Level::ERROR,
            ErrorDetails::InternalError { .. } => tracing::Level::ERROR,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::SecurityViolation { .. } => StatusCode::FORBIDDEN,
            ErrorDetails::Reflink { reason, .. } => match reason {
                ReflinkRejection::NotFound => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_REQUEST,
            },
            ErrorDetails::ReflinkNotFound { .. } => StatusCode::NOT_FOUND,
            ErrorDetails::FeatureDisabled { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::RateLimitExceeded { status } => {
                write!(
                    f,
                    "Rate limit exceeded for tier {}: 0 of {} requests remaining, resets at {}",
                    status.tier,
                    status
                        .daily_limit
                        .map_or_else(|| "unlimited".to_string(), |l| l.to_string()),
                    status.reset_at.to_rfc3339()
                )
            }
            ErrorDetails::SecurityViolation {
                reason,
                ip_address,
                violation_count,
            } => {
                write!(
                    f,
                    "Security violation from {ip_address} ({violation_count} violation(s)): {reason}"
                )
            }
            ErrorDetails::Reflink { code, reason } => {
                write!(f, "Reflink `{code}` rejected: {reason}")
            }
            ErrorDetails::ReflinkNotFound { id } => {
                write!(f, "Reflink not found for id: {id}")
            }
            ErrorDetails::FeatureDisabled { feature } => {
                write!(f, "Feature `{feature}` is not enabled for this reflink")
            }
            ErrorDetails::StoreUnavailable { operation, message } => {
                write!(f, "Store unavailable during `{operation}`: {message}")
            }
            ErrorDetails::InvalidRequest { message } => write!(f, "{message}"),
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::InternalError { message } => write!(f, "{message}"),
        }
    }
}

impl IntoResponse for Error {
    /// Convert the error into an Axum response with the standard error body.
    fn into_response(self) -> Response {
        let (status_code, body) = self.to_response_json();
        let mut response = (status_code, Json(body)).into_response();
        if let ErrorDetails::RateLimitExceeded { status } = self.get_owned_details() {
            response.headers_mut().extend(status.to_header_map());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitTier;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_reflink_error_status_codes() {
        let not_found = Error::new_without_logging(ErrorDetails::Reflink {
            code: "rfl_missing".to_string(),
            reason: ReflinkRejection::NotFound,
        });
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);

        let expired = Error::new_without_logging(ErrorDetails::Reflink {
            code: "rfl_old".to_string(),
            reason: ReflinkRejection::Expired,
        });
        assert_eq!(expired.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_security_violation_body_is_generic() {
        let error = Error::new_without_logging(ErrorDetails::SecurityViolation {
            reason: "spam detected by classifier".to_string(),
            ip_address: "203.0.113.9".parse().expect("valid IP"),
            violation_count: 3,
        });

        assert_eq!(error.status_code(), StatusCode::FORBIDDEN);

        let (_, body) = error.to_response_json();
        let rendered = body.to_string();
        // The caller must not see its own IP or the classifier verdict.
        assert!(!rendered.contains("203.0.113.9"));
        assert!(!rendered.contains("spam"));
        assert_eq!(body["error"]["code"], "SECURITY_VIOLATION_ERROR");
        assert_eq!(body["error"]["details"]["violation_count"], 3);
    }

    #[test]
    fn test_rate_limit_exceeded_response() {
        let reset_at = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).single();
        let status = RateLimitStatus {
            allowed: false,
            requests_remaining: 0,
            daily_limit: Some(50),
            reset_at: reset_at.expect("valid timestamp"),
            tier: RateLimitTier::Standard,
        };
        let error = Error::new_without_logging(ErrorDetails::RateLimitExceeded { status });

        let (status_code, body) = error.to_response_json();
        assert_eq!(status_code, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["error"]["details"]["daily_limit"], 50);
        assert_eq!(body["error"]["details"]["tier"], "standard");

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("X-RateLimit-Limit"));
        assert!(response.headers().contains_key("Retry-After"));
    }
}
