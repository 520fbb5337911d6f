//! The Message and Claim controllers (§4.4, §4.5): the backend-independent
//! orchestration layered on top of a [`Backend`]'s atomic primitives.

use std::sync::Arc;

use uuid::Uuid;

use crate::backoff::{calculate_backoff, BackoffConfig};
use crate::clock::Clock;
use crate::error::{BrokerError, BrokerResult};
use crate::model::{Claim, Message, MessagePage};
use crate::traits::{Backend, ListParams, NewMessage, Sort};

/// Orchestrates `post`, `list`, `get`, `delete`, `pop`, `first` over a
/// single backend shard. The pooling router constructs one of these per
/// resolved shard and delegates to it.
pub struct MessageController {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    backoff: BackoffConfig,
}

impl MessageController {
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>, backoff: BackoffConfig) -> Self {
        Self { backend, clock, backoff }
    }

    /// Reserve a marker range and insert the batch, retrying on a
    /// `(project, queue, marker)` collision with the configured backoff
    /// schedule. Returns ids in input order.
    pub async fn post(
        &self,
        project: &str,
        queue: &str,
        client_id: Uuid,
        default_ttl: i64,
        messages: &[NewMessage],
    ) -> BrokerResult<Vec<String>> {
        let now = self.clock.now();
        self.backend.ensure_queue(project, queue, default_ttl, now).await?;

        let amount = i64::try_from(messages.len()).map_err(|_| BrokerError::invariant("batch length overflowed i64"))?;

        let mut rng = rand::thread_rng();
        for attempt in 0..self.backoff.max_attempts {
            let new_counter = self
                .backend
                .inc_counter(project, queue, amount, None, now)
                .await?
                .ok_or_else(|| BrokerError::invariant("unwindowed inc_counter returned no value"))?;
            // `new_counter` is the value *after* incrementing by `amount`; the
            // first marker of this batch is `new_counter - amount + 1`.
            let first_marker = new_counter - amount + 1;

            match self
                .backend
                .insert_messages(project, queue, client_id, first_marker, messages, now)
                .await
            {
                Ok(ids) => return Ok(ids),
                Err(BrokerError::MessageConflict) => {
                    let delay = calculate_backoff(attempt, &self.backoff, &mut rng)?;
                    debug!(project, queue, attempt, ?delay, "marker collision, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(other) => return Err(other),
            }
        }

        Err(BrokerError::MessageConflict)
    }

    pub async fn list(
        &self,
        project: &str,
        queue: &str,
        client_id: Uuid,
        params: &ListParams,
    ) -> BrokerResult<MessagePage> {
        let now = self.clock.now();
        self.backend.list_messages(project, queue, client_id, params, now).await
    }

    pub async fn get(&self, project: &str, queue: &str, id: &str) -> BrokerResult<Message> {
        let now = self.clock.now();
        self.backend.get_message(project, queue, id, now).await
    }

    pub async fn get_many(&self, project: &str, queue: &str, ids: &[String]) -> BrokerResult<Vec<Message>> {
        let now = self.clock.now();
        self.backend.get_messages(project, queue, ids, now).await
    }

    pub async fn delete(&self, project: &str, queue: &str, id: &str, claim_id: Option<&str>) -> BrokerResult<()> {
        let now = self.clock.now();
        self.backend.delete_message(project, queue, id, claim_id, now).await
    }

    pub async fn bulk_delete(&self, project: &str, queue: &str, ids: &[String]) -> BrokerResult<()> {
        self.backend.delete_messages(project, queue, ids).await
    }

    pub async fn pop(&self, project: &str, queue: &str, limit: usize) -> BrokerResult<Vec<Message>> {
        let now = self.clock.now();
        self.backend.pop_messages(project, queue, limit, now).await
    }

    pub async fn first(&self, project: &str, queue: &str, sort: i32) -> BrokerResult<Message> {
        let sort = match sort {
            1 => Sort::Oldest,
            -1 => Sort::Newest,
            other => {
                return Err(BrokerError::invariant(format!(
                    "sort must be 1 or -1, got {other}"
                )))
            }
        };
        let now = self.clock.now();
        self.backend.first_message(project, queue, sort, now).await
    }
}

/// Orchestrates claim `create`/`get`/`update`/`delete` over a single backend
/// shard. The atomic select-and-stamp and release operations themselves are
/// implemented by the backend (§5 atomic units 3–4); this controller only
/// reads the clock and delegates.
pub struct ClaimController {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
}

impl ClaimController {
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    pub async fn create(
        &self,
        project: &str,
        queue: &str,
        ttl: i64,
        grace: i64,
        limit: usize,
    ) -> BrokerResult<(Claim, Vec<Message>)> {
        let now = self.clock.now();
        self.backend.create_claim(project, queue, ttl, grace, limit, now).await
    }

    pub async fn get(&self, project: &str, queue: &str, claim_id: &str) -> BrokerResult<(Claim, Vec<Message>)> {
        let now = self.clock.now();
        self.backend.get_claim(project, queue, claim_id, now).await
    }

    pub async fn update(&self, project: &str, queue: &str, claim_id: &str, ttl: i64) -> BrokerResult<()> {
        let now = self.clock.now();
        self.backend.update_claim(project, queue, claim_id, ttl, now).await
    }

    pub async fn delete(&self, project: &str, queue: &str, claim_id: &str) -> BrokerResult<()> {
        let now = self.clock.now();
        self.backend.delete_claim(project, queue, claim_id, now).await
    }
}
