//! Pool admin resource (§6, §4.6): register, inspect, and remove a storage
//! shard. Unlike the tenant-facing resources, these calls bypass the
//! `X-Project-ID`/`Client-ID` requirement — pools are a deployment-wide
//! concern, not a tenant one.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::put;
use axum::Router;
use queue_core::codec::Doctype;
use queue_core::model::PoolEntry;
use queue_core::traits::Backend;
use serde::Deserialize;

use crate::codec::{Document, Negotiated};
use crate::error::ApiError;
use crate::response::created_or_no_content;
use crate::state::AppState;

pub fn make_router<S>(state: AppState) -> Router<S> {
    Router::new()
        .route("/{id}", put(put_pool).get(get_pool).delete(delete_pool))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct PoolBody {
    uri: String,
    weight: u32,
    #[serde(default)]
    group: Option<String>,
}

async fn put_pool(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Negotiated(encoding): Negotiated,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let pool: PoolBody = queue_core::codec::decode(&body, encoding, Doctype::Object, state.limits.max_message_size)?;

    let already_exists = state.router.pools_get(&id).await.is_ok();

    state
        .router
        .pools_register(PoolEntry {
            id,
            uri: pool.uri,
            weight: pool.weight,
            group: pool.group,
        })
        .await?;

    Ok(created_or_no_content(!already_exists))
}

async fn get_pool(State(state): State<AppState>, Path(id): Path<String>, Negotiated(encoding): Negotiated) -> Result<Document<PoolEntry>, ApiError> {
    Ok(Document(state.router.pools_get(&id).await?, encoding))
}

async fn delete_pool(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.router.pools_remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
