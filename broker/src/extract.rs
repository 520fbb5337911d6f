//! Header extractors for the two identifiers every request carries (§6):
//! `X-Project-ID` (tenant) and `Client-ID` (producer/consumer UUID, used
//! for `echo` filtering).

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use queue_core::error::BrokerError;
use queue_core::validation::{self, Limits};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone)]
pub struct Project(pub String);

impl FromRequestParts<AppState> for Project {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("X-Project-ID")
            .ok_or_else(|| BrokerError::invalid_argument("X-Project-ID header is required"))?
            .to_str()
            .map_err(|_| BrokerError::invalid_argument("X-Project-ID must be ASCII"))?;

        validation::validate_project_id(header, limits(state))?;
        Ok(Self(header.to_owned()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClientId(pub Uuid);

impl FromRequestParts<AppState> for ClientId {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("Client-ID")
            .ok_or_else(|| BrokerError::invalid_argument("Client-ID header is required"))?
            .to_str()
            .map_err(|_| BrokerError::invalid_argument("Client-ID must be ASCII"))?;

        Ok(Self(validation::validate_client_id(header)?))
    }
}

fn limits(state: &AppState) -> &Limits {
    &state.limits
}
