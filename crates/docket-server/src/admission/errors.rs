//! Admission rejections and their HTTP mapping.
//!
//! Every rejection carries a stable `code` and maps to a distinct status,
//! so clients can react without parsing messages:
//!
//! | Code                | Status | Extra                          |
//! |---------------------|--------|--------------------------------|
//! | `AUTH_FAILED`       | 401    |                                |
//! | `RATE_LIMITED`      | 429    | `Retry-After`, `retryAfterSecs` |
//! | `VERSION_MISMATCH`  | 426    | `minimumVersion`               |
//! | `HANDSHAKE_TIMEOUT` | 408    |                                |
//! | `INVALID_REQUEST`   | 400    |                                |
//! | `SERVER_BUSY`       | 503    |                                |

use std::time::Duration;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Why a credential was refused.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No bearer token in the header or query.
    #[error("missing credential")]
    MissingCredential,
    /// The token matched no verifier.
    #[error("invalid credential")]
    InvalidCredential,
    /// A signed token whose `exp` has passed.
    #[error("credential expired")]
    Expired,
    /// A signed token scoped to a different session.
    #[error("credential not valid for session {0}")]
    WrongSession(String),
}

/// A connection attempt rejected before any event was served.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The identity's bucket is empty.
    #[error("rate limit exceeded, retry after {retry_after:?}")]
    RateLimited {
        /// Time until one token is available again.
        retry_after: Duration,
    },

    /// The declared protocol version cannot be served.
    #[error("protocol version {requested:?} not supported (minimum {minimum})")]
    VersionMismatch {
        /// What the client declared, if anything parseable.
        requested: Option<String>,
        /// Lowest supported version.
        minimum: u32,
    },

    /// The handshake did not finish within the configured bound.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Malformed path or query parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The server is at its connection limit.
    #[error("server at connection capacity")]
    ServerBusy,
}

impl AdmissionError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(_) => "AUTH_FAILED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::VersionMismatch { .. } => "VERSION_MISMATCH",
            Self::HandshakeTimeout(_) => "HANDSHAKE_TIMEOUT",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::ServerBusy => "SERVER_BUSY",
        }
    }

    /// HTTP status for the rejection.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::VersionMismatch { .. } => StatusCode::UPGRADE_REQUIRED,
            Self::HandshakeTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::ServerBusy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Whole seconds to advertise in `Retry-After` (at least 1).
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after } => {
                Some(retry_after.as_secs_f64().ceil().max(1.0) as u64)
            }
            _ => None,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RejectionBody<'a> {
    code: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    minimum_version: Option<u32>,
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let retry_after_secs = self.retry_after_secs();
        let minimum_version = match &self {
            Self::VersionMismatch { minimum, .. } => Some(*minimum),
            _ => None,
        };
        let body = RejectionBody {
            code: self.code(),
            message: self.to_string(),
            retry_after_secs,
            minimum_version,
        };
        let mut response = (self.status(), Json(body)).into_response();
        if let Some(secs) = retry_after_secs {
            let _ = response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
