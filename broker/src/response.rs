//! Response DTOs and the message URI convention shared by the `api` modules
//! (§6): `/v1.1/queues/{queue}/messages/{id}`, with an optional `claim_id`
//! query string appended while the message is under a live claim.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use queue_core::model::{Claim, Message, MessageRef};
use serde::Serialize;
use time::OffsetDateTime;

pub fn message_href(queue: &str, id: &str) -> String {
    format!("/v1.1/queues/{queue}/messages/{id}")
}

fn message_href_for(queue: &str, message: &Message, now: OffsetDateTime) -> String {
    match (&message.claim_id, message.claim_expires_at) {
        (Some(claim_id), Some(expires_at)) if now < expires_at => {
            format!("{}?claim_id={claim_id}", message_href(queue, &message.id))
        }
        _ => message_href(queue, &message.id),
    }
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub href: String,
    pub ttl: i64,
    pub age: i64,
    pub body: serde_json::Value,
}

impl MessageView {
    pub fn new(queue: &str, message: &Message, now: OffsetDateTime) -> Self {
        Self {
            href: message_href_for(queue, message, now),
            ttl: message.ttl,
            age: message.age_seconds(now),
            body: message.body.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageRefView {
    pub href: String,
    pub age: i64,
}

impl MessageRefView {
    pub fn new(queue: &str, reference: &MessageRef) -> Self {
        Self {
            href: message_href(queue, &reference.id),
            age: reference.age_seconds,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ClaimView {
    pub id: String,
    pub ttl: i64,
    pub age: i64,
    pub messages: Vec<MessageView>,
}

impl ClaimView {
    pub fn new(queue: &str, claim: &Claim, messages: &[Message], now: OffsetDateTime) -> Self {
        Self {
            id: claim.id.clone(),
            ttl: claim.ttl,
            age: (now - claim.created_at).whole_seconds().max(0),
            messages: messages.iter().map(|message| MessageView::new(queue, message, now)).collect(),
        }
    }
}

/// `PUT` on a resource is idempotent: 201 the first time, 204 on every
/// subsequent call over the same name.
pub fn created_or_no_content(created: bool) -> Response {
    if created {
        StatusCode::CREATED.into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}
