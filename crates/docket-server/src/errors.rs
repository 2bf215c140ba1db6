//! Server-level errors and their HTTP mapping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use docket_core::SessionId;
use docket_events::StreamError;
use metrics_exporter_prometheus::BuildError;
use serde_json::json;
use thiserror::Error;

use crate::admission::AdmissionError;

/// Errors surfaced by HTTP handlers and server startup.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Rejected by the admission pipeline.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// The stream core refused the operation.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// No live stream exists for the session.
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    /// The metrics recorder could not be installed.
    #[error("metrics recorder: {0}")]
    Metrics(#[from] BuildError),

    /// Listener I/O failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Admission(e) => e.code(),
            Self::Stream(e) => e.code(),
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::Metrics(_) | Self::Io(_) => "INTERNAL",
        }
    }

    /// HTTP status.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Admission(e) => e.status(),
            Self::Stream(StreamError::Encoding { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Stream(
                StreamError::SessionTerminated(_) | StreamError::SequenceExhausted { .. },
            ) => StatusCode::CONFLICT,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::Stream(_) | Self::Metrics(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        match self {
            Self::Admission(e) => e.into_response(),
            other => {
                let body = json!({"code": other.code(), "message": other.to_string()});
                (other.status(), Json(body)).into_response()
            }
        }
    }
}
