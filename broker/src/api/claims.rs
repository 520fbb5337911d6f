//! Claim resource (§6, §4.5): create, inspect, extend, release.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use queue_core::codec::Doctype;
use queue_core::validation::{self, validate_queue_name};
use serde::Deserialize;

use crate::codec::{Document, Negotiated};
use crate::error::ApiError;
use crate::extract::Project;
use crate::response::ClaimView;
use crate::state::AppState;

const DEFAULT_CLAIM_LIMIT: usize = 20;

pub fn make_router<S>(state: AppState) -> Router<S> {
    Router::new()
        .route("/{name}/claims", post(post_claim))
        .route(
            "/{name}/claims/{id}",
            axum::routing::get(get_claim).patch(patch_claim).delete(delete_claim),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct NewClaim {
    ttl: i64,
    grace: i64,
}

#[derive(Debug, Deserialize)]
struct ClaimQuery {
    limit: Option<usize>,
}

async fn post_claim(
    State(state): State<AppState>,
    Project(project): Project,
    Path(name): Path<String>,
    Query(query): Query<ClaimQuery>,
    Negotiated(encoding): Negotiated,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    validate_queue_name(&name)?;

    let new_claim: NewClaim = queue_core::codec::decode(&body, encoding, Doctype::Object, state.limits.max_message_size)?;

    validation::validate_claim_ttl(new_claim.ttl, &state.limits)?;
    validation::validate_claim_grace(new_claim.grace, &state.limits)?;

    let limit = query.limit.unwrap_or(DEFAULT_CLAIM_LIMIT);
    let now = state.clock.now();

    let (claim, messages) = state.claims.create(&project, &name, new_claim.ttl, new_claim.grace, limit).await?;

    if messages.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let view = ClaimView::new(&name, &claim, &messages, now);
    Ok((StatusCode::CREATED, Document(view, encoding)).into_response())
}

async fn get_claim(
    State(state): State<AppState>,
    Project(project): Project,
    Path((name, id)): Path<(String, String)>,
    Negotiated(encoding): Negotiated,
) -> Result<Document<ClaimView>, ApiError> {
    let now = state.clock.now();
    let (claim, messages) = state.claims.get(&project, &name, &id).await?;
    Ok(Document(ClaimView::new(&name, &claim, &messages, now), encoding))
}

#[derive(Debug, Deserialize)]
struct ClaimUpdate {
    ttl: i64,
}

async fn patch_claim(
    State(state): State<AppState>,
    Project(project): Project,
    Path((name, id)): Path<(String, String)>,
    Negotiated(encoding): Negotiated,
    body: axum::body::Bytes,
) -> Result<StatusCode, ApiError> {
    let update: ClaimUpdate = queue_core::codec::decode(&body, encoding, Doctype::Object, state.limits.max_message_size)?;
    validation::validate_claim_ttl(update.ttl, &state.limits)?;

    state.claims.update(&project, &name, &id, update.ttl).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_claim(
    State(state): State<AppState>,
    Project(project): Project,
    Path((name, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.claims.delete(&project, &name, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
