//! Queue resource (§6): `PUT`/`DELETE /queues/{name}`, `GET /queues/{name}/stats`.

use axum::extract::{Path, State};
use axum::routing::{delete, get, put};
use axum::Router;
use queue_core::codec::Doctype;
use queue_core::traits::Backend;
use queue_core::validation::{self, validate_queue_name};
use serde::{Deserialize, Serialize};

use crate::codec::{Document, Negotiated};
use crate::error::ApiError;
use crate::extract::Project;
use crate::response::{created_or_no_content, MessageRefView};
use crate::state::AppState;

/// Queue metadata is stored verbatim, except for the reserved `_ttl` field
/// which becomes the queue's default message TTL.
const DEFAULT_QUEUE_TTL_SECS: i64 = 3600;

pub fn make_router<S>(state: AppState) -> Router<S> {
    Router::new()
        .route("/{name}", put(put_queue).delete(delete_queue))
        .route("/{name}/stats", get(get_stats))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct QueueMetadata {
    #[serde(rename = "_ttl")]
    ttl: Option<i64>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

async fn put_queue(
    State(state): State<AppState>,
    Project(project): Project,
    Path(name): Path<String>,
    Negotiated(encoding): Negotiated,
    body: axum::body::Bytes,
) -> Result<axum::response::Response, ApiError> {
    validate_queue_name(&name)?;
    validation::validate_post_body_size(body.len(), &state.limits)?;

    let metadata: QueueMetadata = if body.is_empty() {
        QueueMetadata {
            ttl: None,
            rest: serde_json::Map::new(),
        }
    } else {
        queue_core::codec::decode(&body, encoding, Doctype::Object, state.limits.max_message_size)?
    };

    let default_ttl = metadata.ttl.unwrap_or(DEFAULT_QUEUE_TTL_SECS);
    let now = state.clock.now();

    let created = state
        .router
        .create_queue(&project, &name, serde_json::Value::Object(metadata.rest), default_ttl, now)
        .await?;

    Ok(created_or_no_content(created))
}

async fn delete_queue(
    State(state): State<AppState>,
    Project(project): Project,
    Path(name): Path<String>,
) -> Result<axum::http::StatusCode, ApiError> {
    state.router.delete_queue(&project, &name).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct StatsBody {
    messages: MessageCounts,
    oldest: Option<MessageRefView>,
    newest: Option<MessageRefView>,
}

#[derive(Debug, Serialize)]
struct MessageCounts {
    total: i64,
    claimed: i64,
    free: i64,
}

async fn get_stats(
    State(state): State<AppState>,
    Project(project): Project,
    Path(name): Path<String>,
    Negotiated(encoding): Negotiated,
) -> Result<Document<StatsBody>, ApiError> {
    let now = state.clock.now();
    let stats = state.router.queue_stats(&project, &name, now).await?;

    Ok(Document(
        StatsBody {
            messages: MessageCounts {
                total: stats.total_messages,
                claimed: stats.claimed_messages,
                free: stats.total_messages - stats.claimed_messages,
            },
            oldest: stats.oldest.as_ref().map(|r| MessageRefView::new(&name, r)),
            newest: stats.newest.as_ref().map(|r| MessageRefView::new(&name, r)),
        },
        encoding,
    ))
}
