//! Storage capability traits (§4.4–§4.6, §9 "backend polymorphism").
//!
//! Each backend (document-store, relational) provides one [`Backend`]
//! implementation covering all four controller families: Queue, Message,
//! Claim, and Catalogue/Pools. The pooling router in `queue-router` is
//! itself a `Backend` implementation that delegates to a backend shard
//! resolved through the catalogue.

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BrokerResult;
use crate::model::{Claim, Message, MessagePage, PoolEntry, Queue, QueueStats};

/// Direction for [`Backend::first_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sort {
    Oldest,
    Newest,
}

/// A freshly posted message, before a marker has been assigned.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub body: serde_json::Value,
    pub ttl: i64,
}

/// Parameters for [`Backend::list_messages`].
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub limit: usize,
    pub marker: Option<String>,
    pub echo: bool,
    pub include_claimed: bool,
}

#[async_trait]
pub trait Backend: Send + Sync {
    // -- Queue -----------------------------------------------------------

    /// Create a queue explicitly. Returns `true` if this call created it,
    /// `false` if it already existed (PUT is idempotent: 201 vs 204).
    async fn create_queue(
        &self,
        project: &str,
        name: &str,
        metadata: serde_json::Value,
        default_ttl: i64,
        now: OffsetDateTime,
    ) -> BrokerResult<bool>;

    /// Create the queue only if absent, with no metadata. Used by `post`'s
    /// implicit-creation path; never observes an invalid queue name since
    /// validation always runs first.
    async fn ensure_queue(&self, project: &str, name: &str, default_ttl: i64, now: OffsetDateTime) -> BrokerResult<()>;

    /// Delete a queue and cascade-purge its messages and claims.
    async fn delete_queue(&self, project: &str, name: &str) -> BrokerResult<()>;

    async fn get_queue(&self, project: &str, name: &str) -> BrokerResult<Option<Queue>>;

    async fn queue_stats(&self, project: &str, name: &str, now: OffsetDateTime) -> BrokerResult<QueueStats>;

    // -- Counter -----------------------------------------------------------

    async fn get_counter(&self, project: &str, queue: &str) -> BrokerResult<i64>;

    /// Atomic read-modify-write. `window` gates the increment on elapsed
    /// time since the counter was last modified; `Ok(None)` means the
    /// window has not elapsed and nothing was mutated.
    async fn inc_counter(
        &self,
        project: &str,
        queue: &str,
        amount: i64,
        window: Option<time::Duration>,
        now: OffsetDateTime,
    ) -> BrokerResult<Option<i64>>;

    // -- Message -----------------------------------------------------------

    /// Insert a batch of messages at a pre-reserved, contiguous marker
    /// range, in input order. Fails with [`crate::error::BrokerError::MessageConflict`]
    /// on a `(project, queue, marker)` unique-index collision; the caller
    /// (the message controller) retries with backoff and a fresh marker
    /// range.
    async fn insert_messages(
        &self,
        project: &str,
        queue: &str,
        client_id: Uuid,
        first_marker: i64,
        messages: &[NewMessage],
        now: OffsetDateTime,
    ) -> BrokerResult<Vec<String>>;

    async fn list_messages(
        &self,
        project: &str,
        queue: &str,
        client_id: Uuid,
        params: &ListParams,
        now: OffsetDateTime,
    ) -> BrokerResult<MessagePage>;

    async fn get_message(&self, project: &str, queue: &str, id: &str, now: OffsetDateTime) -> BrokerResult<Message>;

    async fn get_messages(&self, project: &str, queue: &str, ids: &[String], now: OffsetDateTime) -> BrokerResult<Vec<Message>>;

    /// Delete a message. If `claim_id` is `Some`, the delete is conditional:
    /// it only proceeds if that claim currently owns the message and the
    /// claim is live, otherwise this is a silent no-op success.
    async fn delete_message(
        &self,
        project: &str,
        queue: &str,
        id: &str,
        claim_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BrokerResult<()>;

    /// Best-effort bulk delete; unknown ids are silently ignored.
    async fn delete_messages(&self, project: &str, queue: &str, ids: &[String]) -> BrokerResult<()>;

    async fn pop_messages(&self, project: &str, queue: &str, limit: usize, now: OffsetDateTime) -> BrokerResult<Vec<Message>>;

    async fn first_message(&self, project: &str, queue: &str, sort: Sort, now: OffsetDateTime) -> BrokerResult<Message>;

    // -- Claim -----------------------------------------------------------

    /// Atomically select up to `limit` visible, unclaimed messages ordered
    /// by marker, stamp them with a new claim, and extend their TTL by
    /// `grace`. Returns an empty batch (not an error) when none are
    /// available.
    async fn create_claim(
        &self,
        project: &str,
        queue: &str,
        ttl: i64,
        grace: i64,
        limit: usize,
        now: OffsetDateTime,
    ) -> BrokerResult<(Claim, Vec<Message>)>;

    /// An expired claim behaves as if it does not exist.
    async fn get_claim(&self, project: &str, queue: &str, claim_id: &str, now: OffsetDateTime) -> BrokerResult<(Claim, Vec<Message>)>;

    async fn update_claim(&self, project: &str, queue: &str, claim_id: &str, ttl: i64, now: OffsetDateTime) -> BrokerResult<()>;

    /// Idempotent: clears the claim from every referenced message.
    async fn delete_claim(&self, project: &str, queue: &str, claim_id: &str, now: OffsetDateTime) -> BrokerResult<()>;

    // -- Catalogue & pools -----------------------------------------------

    async fn catalogue_insert(&self, project: &str, queue: &str, pool_id: &str) -> BrokerResult<()>;

    async fn catalogue_get(&self, project: &str, queue: &str) -> BrokerResult<Option<String>>;

    async fn catalogue_delete(&self, project: &str, queue: &str) -> BrokerResult<()>;

    async fn catalogue_drop_all(&self, project: &str, queue: &str) -> BrokerResult<()>;

    async fn pools_register(&self, pool: PoolEntry) -> BrokerResult<()>;

    async fn pools_remove(&self, id: &str) -> BrokerResult<()>;

    async fn pools_get(&self, id: &str) -> BrokerResult<PoolEntry>;

    async fn pools_list(&self) -> BrokerResult<Vec<PoolEntry>>;
}
