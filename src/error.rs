//! Error types and HTTP status code mapping.
//!
//! The two denial kinds produced by the gate stay distinct all the way to
//! the wire: [`GateError::Blocked`] is a permission failure (403) while
//! [`GateError::Throttled`] is a retry-later failure (429).

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::header::{CONTENT_TYPE, HeaderValue, RETRY_AFTER};
use hyper::{Response, StatusCode};

use crate::headers;
use crate::proxy::{BoxBody, full};

/// Every failure the gateway can produce, each mapping to a specific HTTP status.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The configuration file could not be loaded, parsed or validated.
    #[error("configuration error: {0}")]
    Config(String),
    /// The upstream target URI is malformed or unparseable.
    #[error("invalid upstream: {0}")]
    InvalidUpstream(String),
    /// The client address is under an active block.
    #[error("address {address} is temporarily blocked due to repeated rate limit violations")]
    Blocked {
        address: String,
        /// Seconds until the block lapses, when known.
        retry_after_secs: Option<u64>,
    },
    /// The client exhausted its quota for the current window.
    #[error("rate limit exceeded, retry in {retry_after_secs}s")]
    Throttled {
        limit: u64,
        remaining: u64,
        reset_at: DateTime<Utc>,
        retry_after_secs: u64,
    },
    /// The user directory has no entry for the requested id.
    #[error("user {0} not found")]
    UserNotFound(u64),
    /// Missing or wrong credentials for the control surface.
    #[error("unauthorized")]
    Unauthorized,
    /// An operator supplied something that is not an IP address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// The request body or parameters could not be understood.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// No control route matches the request path.
    #[error("no route for {0}")]
    NotFound(String),
    /// The upstream server returned an error or was unreachable.
    #[error("upstream error: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
    /// The upstream did not answer within the configured request timeout.
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
    /// Too many requests are in flight.
    #[error("service unavailable: more than {limit} concurrent requests")]
    ServiceUnavailable { limit: usize },
    /// An internal error that does not fit other categories.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GateError {
    /// Returns the HTTP status code corresponding to this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Internal(_) | Self::InvalidUpstream(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Blocked { .. } => StatusCode::FORBIDDEN,
            Self::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UserNotFound(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InvalidAddress(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Machine-readable error code placed in the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::InvalidUpstream(_) => "invalid_upstream",
            Self::Blocked { .. } => "blocked",
            Self::Throttled { .. } => "rate_limited",
            Self::UserNotFound(_) => "user_not_found",
            Self::Unauthorized => "unauthorized",
            Self::InvalidAddress(_) => "invalid_address",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Upstream(_) => "upstream_error",
            Self::Timeout(_) => "gateway_timeout",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Returns `true` for the two gate denial kinds.
    pub fn is_denial(&self) -> bool {
        matches!(self, Self::Blocked { .. } | Self::Throttled { .. })
    }

    /// Converts this error into an HTTP response with a JSON body.
    ///
    /// Denials carry a `Retry-After` hint; throttled denials additionally
    /// carry the `X-RateLimit-*` counters.
    pub fn into_response(self) -> Response<BoxBody> {
        let status = self.status_code();
        let mut body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });

        let mut response = Response::new(full(Bytes::new()));
        match &self {
            Self::Blocked {
                retry_after_secs, ..
            } => {
                if let Some(secs) = retry_after_secs {
                    response
                        .headers_mut()
                        .insert(RETRY_AFTER, HeaderValue::from(*secs));
                    body["retry_after"] = (*secs).into();
                }
            }
            Self::Throttled {
                limit,
                remaining,
                reset_at,
                retry_after_secs,
            } => {
                headers::insert_rate_limit_headers(
                    response.headers_mut(),
                    *limit,
                    *remaining,
                    *reset_at,
                );
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(*retry_after_secs));
                body["retry_after"] = (*retry_after_secs).into();
                body["limit"] = (*limit).into();
                body["remaining"] = (*remaining).into();
                body["reset_at"] = reset_at.to_rfc3339().into();
            }
            _ => {}
        }

        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        *response.body_mut() = full(body.to_string());
        response
    }
}

impl From<hyper::http::Error> for GateError {
    fn from(err: hyper::http::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(err.to_string())
    }
}
