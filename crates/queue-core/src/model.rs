//! The broker's data model (§3).

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// A tenant namespace, carried on every request via `X-Project-ID`.
pub type ProjectId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub project: ProjectId,
    pub name: String,
    pub metadata: serde_json::Value,
    pub default_ttl: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub project: ProjectId,
    pub queue: String,
    pub body: serde_json::Value,
    pub ttl: i64,
    pub marker: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub client_id: Uuid,
    pub claim_id: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub claim_expires_at: Option<OffsetDateTime>,
}

impl Message {
    /// A message is visible to list/claim iff it has not expired and is not
    /// currently under a live claim.
    pub fn is_visible(&self, now: OffsetDateTime) -> bool {
        let not_expired = now < self.created_at + time::Duration::seconds(self.ttl);
        let not_claimed = match self.claim_expires_at {
            Some(expires_at) => now >= expires_at,
            None => true,
        };
        not_expired && not_claimed
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.created_at + time::Duration::seconds(self.ttl)
    }

    pub fn age_seconds(&self, now: OffsetDateTime) -> i64 {
        (now - self.created_at).whole_seconds().max(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: String,
    pub project: ProjectId,
    pub queue: String,
    pub ttl: i64,
    pub grace: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub message_ids: Vec<String>,
}

impl Claim {
    pub fn is_live(&self, now: OffsetDateTime) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEntry {
    pub id: String,
    pub uri: String,
    pub weight: u32,
    pub group: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogueEntry {
    pub project: ProjectId,
    pub queue: String,
    pub pool_id: String,
}

/// A page of messages returned by `list`, plus the opaque marker to resume
/// pagination from.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub next_marker: Option<String>,
}

/// Queue-level counters and boundary refs returned by the stats endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_messages: i64,
    pub claimed_messages: i64,
    pub oldest: Option<MessageRef>,
    pub newest: Option<MessageRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: String,
    pub marker: i64,
    pub age_seconds: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(ttl: i64, created_offset_secs: i64, claim_expires_offset_secs: Option<i64>) -> Message {
        let now = OffsetDateTime::now_utc();
        Message {
            id: "m1".into(),
            project: "p".into(),
            queue: "q".into(),
            body: serde_json::json!({}),
            ttl,
            marker: 2,
            created_at: now + time::Duration::seconds(created_offset_secs),
            client_id: Uuid::new_v4(),
            claim_id: claim_expires_offset_secs.map(|_| "c1".into()),
            claim_expires_at: claim_expires_offset_secs.map(|offset| now + time::Duration::seconds(offset)),
        }
    }

    #[test]
    fn visible_when_unexpired_and_unclaimed() {
        let msg = message(200, -10, None);
        assert!(msg.is_visible(OffsetDateTime::now_utc()));
    }

    #[test]
    fn not_visible_when_claim_still_live() {
        let msg = message(200, -10, Some(100));
        assert!(!msg.is_visible(OffsetDateTime::now_utc()));
    }

    #[test]
    fn visible_again_once_claim_expires() {
        let msg = message(200, -10, Some(-1));
        assert!(msg.is_visible(OffsetDateTime::now_utc()));
    }

    #[test]
    fn not_visible_once_ttl_elapsed() {
        let msg = message(60, -61, None);
        assert!(!msg.is_visible(OffsetDateTime::now_utc()));
    }
}
