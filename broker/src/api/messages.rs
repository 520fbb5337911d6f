//! Message resource (§6, §4.4): post, list, bulk/single get, and
//! conditional/bulk delete.
//!
//! `GET /queues/{name}/messages` dispatches on the presence of `ids` in the
//! query string: with `ids` it is a bulk-get returning a bare JSON array;
//! without it, a paginated listing returning `{"messages": [...], "next_marker": ...}`.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use queue_core::codec::Doctype;
use queue_core::error::BrokerError;
use queue_core::traits::{ListParams, NewMessage};
use queue_core::validation::{self, validate_queue_name};
use serde::{Deserialize, Serialize};

use crate::codec::{Document, Negotiated};
use crate::error::ApiError;
use crate::extract::{ClientId, Project};
use crate::response::{message_href, MessageView};
use crate::state::AppState;

pub fn make_router<S>(state: AppState) -> Router<S> {
    Router::new()
        .route("/{name}/messages", post(post_messages).get(get_messages).delete(delete_messages))
        .route("/{name}/messages/{id}", get(get_message).delete(delete_message))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct PostedMessage {
    body: serde_json::Value,
    ttl: i64,
}

#[derive(Debug, Serialize)]
struct PostResponse {
    resources: Vec<String>,
    partial: bool,
}

async fn post_messages(
    State(state): State<AppState>,
    Project(project): Project,
    ClientId(client_id): ClientId,
    Path(name): Path<String>,
    Negotiated(encoding): Negotiated,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    validate_queue_name(&name)?;
    validation::validate_post_body_size(body.len(), &state.limits)?;

    let posted: Vec<PostedMessage> = queue_core::codec::decode(&body, encoding, Doctype::Array, state.limits.max_message_size)?;

    if posted.is_empty() {
        return Err(BrokerError::invalid_argument("message batch must not be empty").into());
    }
    validation::validate_post_batch_len(posted.len(), &state.limits)?;

    for message in &posted {
        validation::validate_message_ttl(message.ttl, &state.limits)?;
    }

    let new_messages: Vec<NewMessage> = posted
        .into_iter()
        .map(|message| NewMessage { body: message.body, ttl: message.ttl })
        .collect();

    let default_ttl = new_messages.first().map(|m| m.ttl).unwrap_or(3600);
    let ids = state.messages.post(&project, &name, client_id, default_ttl, &new_messages).await?;

    let resources: Vec<String> = ids.iter().map(|id| message_href(&name, id)).collect();
    let location = format!("/v1.1/queues/{name}/messages?ids={}", ids.join(","));

    let mut response = (
        StatusCode::CREATED,
        Document(
            PostResponse {
                resources,
                partial: false,
            },
            encoding,
        ),
    )
        .into_response();

    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(axum::http::header::LOCATION, value);
    }

    Ok(response)
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    ids: Option<String>,
    limit: Option<usize>,
    marker: Option<String>,
    #[serde(default)]
    echo: bool,
    #[serde(default)]
    include_claimed: bool,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    messages: Vec<MessageView>,
    next_marker: Option<String>,
}

async fn get_messages(
    State(state): State<AppState>,
    Project(project): Project,
    ClientId(client_id): ClientId,
    Path(name): Path<String>,
    Query(query): Query<MessagesQuery>,
    Negotiated(encoding): Negotiated,
) -> Result<Response, ApiError> {
    validate_queue_name(&name)?;
    let now = state.clock.now();

    if let Some(ids) = query.ids.as_deref() {
        let ids: Vec<String> = split_ids(ids);
        validation::validate_bulk_get_ids(&ids, &state.limits)?;

        let messages = state.messages.get_many(&project, &name, &ids).await?;
        let views: Vec<MessageView> = messages.iter().map(|message| MessageView::new(&name, message, now)).collect();
        return Ok(Document(views, encoding).into_response());
    }

    let limit = query.limit.unwrap_or(state.limits.max_list_limit);
    validation::validate_list_limit(limit, &state.limits)?;

    let params = ListParams {
        limit,
        marker: query.marker,
        echo: query.echo,
        include_claimed: query.include_claimed,
    };

    let page = state.messages.list(&project, &name, client_id, &params).await?;
    let views = page.messages.iter().map(|message| MessageView::new(&name, message, now)).collect();

    Ok(Document(
        ListResponse {
            messages: views,
            next_marker: page.next_marker,
        },
        encoding,
    )
    .into_response())
}

async fn get_message(
    State(state): State<AppState>,
    Project(project): Project,
    Path((name, id)): Path<(String, String)>,
    Negotiated(encoding): Negotiated,
) -> Result<Response, ApiError> {
    validate_queue_name(&name)?;
    let now = state.clock.now();

    let message = state.messages.get(&project, &name, &id).await?;
    let href = message_href(&name, &id);
    let view = MessageView::new(&name, &message, now);

    let mut response = Document(view, encoding).into_response();
    if let Ok(value) = HeaderValue::from_str(&href) {
        response.headers_mut().insert("Content-Location", value);
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct DeleteMessageQuery {
    claim_id: Option<String>,
}

async fn delete_message(
    State(state): State<AppState>,
    Project(project): Project,
    Path((name, id)): Path<(String, String)>,
    Query(query): Query<DeleteMessageQuery>,
) -> Result<StatusCode, ApiError> {
    state.messages.delete(&project, &name, &id, query.claim_id.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct BulkIdsQuery {
    ids: Option<String>,
}

async fn delete_messages(
    State(state): State<AppState>,
    Project(project): Project,
    Path(name): Path<String>,
    Query(query): Query<BulkIdsQuery>,
) -> Result<StatusCode, ApiError> {
    let Some(ids) = query.ids.as_deref() else {
        return Err(BrokerError::invalid_argument("bulk delete requires an `ids` query parameter").into());
    };

    let ids = split_ids(ids);
    validation::validate_bulk_delete_ids(&ids, &state.limits)?;

    state.messages.bulk_delete(&project, &name, &ids).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn split_ids(raw: &str) -> Vec<String> {
    raw.split(',').filter(|id| !id.is_empty()).map(str::to_owned).collect()
}
