//! Maps a [`BrokerError`] onto an HTTP response (§7).
//!
//! Handlers return `Result<_, ApiError>` and let this `IntoResponse` impl
//! consult [`BrokerError::status_code`] for the mapping; idempotent-delete
//! 204-over-missing-target exceptions are handled per call site rather than
//! here, since only the caller knows whether a given `NotFound`-shaped
//! error is being surfaced or swallowed.

use axum::response::{IntoResponse, Response};
use axum::Json;
use queue_core::error::BrokerError;
use serde::Serialize;
use tracing::{debug, error};

pub struct ApiError(pub BrokerError);

impl From<BrokerError> for ApiError {
    fn from(error: BrokerError) -> Self {
        Self(error)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();

        if matches!(self.0, BrokerError::InvariantViolation { .. }) {
            error!(error = %self.0, "invariant violation reached the HTTP boundary");
        } else {
            debug!(error = %self.0, %status, "request failed");
        }

        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}
