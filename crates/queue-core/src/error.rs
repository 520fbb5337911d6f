//! Broker error kinds and their mapping to HTTP status codes.
//!
//! Error *kinds* are a transport-agnostic vocabulary; the status mapping
//! lives on [`BrokerError::status_code`] so the HTTP layer has exactly one
//! place to consult, per the design notes on error handling.

use http::StatusCode;
use thiserror::Error;

/// Errors a storage controller or the router can raise.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("queue {project}/{queue} does not exist")]
    QueueDoesNotExist { project: String, queue: String },

    #[error("queue {project}/{queue} is empty")]
    QueueIsEmpty { project: String, queue: String },

    #[error("message {id} does not exist")]
    MessageDoesNotExist { id: String },

    #[error("could not assign a marker range after retrying")]
    MessageConflict,

    #[error("claim {id} does not exist")]
    ClaimDoesNotExist { id: String },

    #[error("pool {id} does not exist")]
    PoolDoesNotExist { id: String },

    #[error("backend connection unavailable: {reason}")]
    ConnectionError { reason: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("payload too large: {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    /// A condition that should be impossible to reach through the public API
    /// (bad sort key, malformed backoff parameters). Never mapped to 4xx.
    #[error("invariant violated: {message}")]
    InvariantViolation { message: String },

    /// An admin operation that is intentionally unimplemented (see DESIGN.md).
    #[error("not implemented: {message}")]
    NotImplemented { message: String },
}

impl BrokerError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// True when retrying the operation that produced this error may help
    /// (transient backend conditions), as opposed to it being a permanent
    /// rejection of the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionError { .. } | Self::MessageConflict)
    }

    /// Status code for a *surfacing* read (get, list, create). Delete
    /// operations over a missing target use [`Self::idempotent_delete_status`]
    /// instead, since deleting something absent is itself a success.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::QueueDoesNotExist { .. }
            | Self::QueueIsEmpty { .. }
            | Self::MessageDoesNotExist { .. }
            | Self::ClaimDoesNotExist { .. }
            | Self::PoolDoesNotExist { .. } => StatusCode::NOT_FOUND,
            Self::MessageConflict | Self::ConnectionError { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidArgument { .. } | Self::PayloadTooLarge { .. } => StatusCode::BAD_REQUEST,
            Self::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            Self::InvariantViolation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
