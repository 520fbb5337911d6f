//! The pooling router (§4.6–§4.7).
//!
//! Every non-control call is resolved to a backend shard through a
//! catalogue lookup (cached, bounded TTL) and delegated there. Catalogue
//! and pool admin calls bypass routing entirely and go straight to the
//! `control` backend, which is where the catalogue and pool registry live.
//! A queue with no catalogue entry is placed on first write by a weighted
//! random draw over the registered pools (§4.6); the assignment is
//! persisted so later calls are stable.

#[macro_use]
extern crate tracing;

mod placement;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use queue_core::clock::Clock;
use queue_core::error::{BrokerError, BrokerResult};
use queue_core::model::{Claim, Message, MessagePage, PoolEntry, Queue, QueueStats};
use queue_core::traits::{Backend, ListParams, NewMessage, Sort};
use time::OffsetDateTime;
use uuid::Uuid;

pub use placement::weighted_pick;

#[derive(Clone)]
struct CacheEntry {
    pool_id: Option<String>,
    expires_at: OffsetDateTime,
}

/// Bounded-TTL cache over catalogue lookups. Negative lookups (no
/// catalogue entry yet) are cached too, but more briefly, so placement
/// racing on a brand new queue settles quickly without repeatedly hitting
/// the catalogue store.
struct CatalogueCache {
    entries: Mutex<HashMap<(String, String), CacheEntry>>,
    positive_ttl: time::Duration,
    negative_ttl: time::Duration,
}

impl CatalogueCache {
    fn new(positive_ttl: time::Duration, negative_ttl: time::Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            positive_ttl,
            negative_ttl,
        }
    }

    fn get(&self, project: &str, queue: &str, now: OffsetDateTime) -> Option<Option<String>> {
        let key = (project.to_owned(), queue.to_owned());
        let entries = self.entries.lock().expect("catalogue cache mutex poisoned");
        match entries.get(&key) {
            Some(entry) if entry.expires_at > now => Some(entry.pool_id.clone()),
            _ => None,
        }
    }

    fn put(&self, project: &str, queue: &str, pool_id: Option<String>, now: OffsetDateTime) {
        let ttl = if pool_id.is_some() { self.positive_ttl } else { self.negative_ttl };
        let key = (project.to_owned(), queue.to_owned());
        let mut entries = self.entries.lock().expect("catalogue cache mutex poisoned");
        entries.insert(key, CacheEntry { pool_id, expires_at: now + ttl });
    }

    fn invalidate(&self, project: &str, queue: &str) {
        let key = (project.to_owned(), queue.to_owned());
        let mut entries = self.entries.lock().expect("catalogue cache mutex poisoned");
        entries.remove(&key);
    }
}

/// Delegates every [`Backend`] call to a shard resolved through the
/// catalogue. Itself a [`Backend`] implementation, per the design note that
/// the router is "a capability implementation that delegates".
pub struct Router {
    control: Arc<dyn Backend>,
    shards: HashMap<String, Arc<dyn Backend>>,
    cache: CatalogueCache,
    clock: Arc<dyn Clock>,
}

impl Router {
    /// `control` stores the catalogue and pool registry. `shards` maps each
    /// registered `pool_id` to its live backend handle; pools admitted via
    /// [`Backend::pools_register`] after construction must also be added
    /// here with [`Router::add_shard`] before a queue can be placed on them.
    pub fn new(control: Arc<dyn Backend>, shards: HashMap<String, Arc<dyn Backend>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            control,
            shards,
            cache: CatalogueCache::new(time::Duration::seconds(60), time::Duration::seconds(5)),
            clock,
        }
    }

    pub fn add_shard(&mut self, pool_id: impl Into<String>, backend: Arc<dyn Backend>) {
        self.shards.insert(pool_id.into(), backend);
    }

    fn shard(&self, pool_id: &str) -> BrokerResult<Arc<dyn Backend>> {
        self.shards
            .get(pool_id)
            .cloned()
            .ok_or_else(|| BrokerError::PoolDoesNotExist { id: pool_id.to_owned() })
    }

    /// Resolve an already-placed queue, or `None` if it has no catalogue
    /// entry (i.e. it was never created, as far as routing is concerned).
    async fn resolve(&self, project: &str, queue: &str) -> BrokerResult<Option<Arc<dyn Backend>>> {
        let now = self.clock.now();
        let pool_id = if let Some(cached) = self.cache.get(project, queue, now) {
            cached
        } else {
            let looked_up = self.control.catalogue_get(project, queue).await?;
            self.cache.put(project, queue, looked_up.clone(), now);
            looked_up
        };
        match pool_id {
            Some(id) => Ok(Some(self.shard(&id)?)),
            None => Ok(None),
        }
    }

    /// Resolve a queue, placing it on a weighted-random pool if it has no
    /// catalogue entry yet. Used by every mutating entry point so the first
    /// write to a new queue both creates its placement and proceeds.
    async fn resolve_or_place(&self, project: &str, queue: &str) -> BrokerResult<Arc<dyn Backend>> {
        if let Some(backend) = self.resolve(project, queue).await? {
            return Ok(backend);
        }

        let pools = self.control.pools_list().await?;
        let pool_id = weighted_pick(&pools, &mut rand::thread_rng())
            .ok_or_else(|| BrokerError::invariant("no pools registered; cannot place a new queue"))?;

        self.control.catalogue_insert(project, queue, &pool_id).await?;
        let now = self.clock.now();
        self.cache.put(project, queue, Some(pool_id.clone()), now);
        debug!(project, queue, pool_id, "placed queue on pool");
        self.shard(&pool_id)
    }
}

#[async_trait]
impl Backend for Router {
    // -- Queue -----------------------------------------------------------

    async fn create_queue(
        &self,
        project: &str,
        name: &str,
        metadata: serde_json::Value,
        default_ttl: i64,
        now: OffsetDateTime,
    ) -> BrokerResult<bool> {
        let backend = self.resolve_or_place(project, name).await?;
        backend.create_queue(project, name, metadata, default_ttl, now).await
    }

    async fn ensure_queue(&self, project: &str, name: &str, default_ttl: i64, now: OffsetDateTime) -> BrokerResult<()> {
        let backend = self.resolve_or_place(project, name).await?;
        backend.ensure_queue(project, name, default_ttl, now).await
    }

    async fn delete_queue(&self, project: &str, name: &str) -> BrokerResult<()> {
        let Some(backend) = self.resolve(project, name).await? else {
            return Ok(());
        };
        backend.delete_queue(project, name).await?;
        self.control.catalogue_delete(project, name).await?;
        self.cache.invalidate(project, name);
        Ok(())
    }

    async fn get_queue(&self, project: &str, name: &str) -> BrokerResult<Option<Queue>> {
        let Some(backend) = self.resolve(project, name).await? else {
            return Ok(None);
        };
        backend.get_queue(project, name).await
    }

    async fn queue_stats(&self, project: &str, name: &str, now: OffsetDateTime) -> BrokerResult<QueueStats> {
        let backend = self
            .resolve(project, name)
            .await?
            .ok_or_else(|| BrokerError::QueueDoesNotExist { project: project.to_owned(), queue: name.to_owned() })?;
        backend.queue_stats(project, name, now).await
    }

    // -- Counter -----------------------------------------------------------

    async fn get_counter(&self, project: &str, queue: &str) -> BrokerResult<i64> {
        let Some(backend) = self.resolve(project, queue).await? else {
            return Ok(0);
        };
        backend.get_counter(project, queue).await
    }

    async fn inc_counter(
        &self,
        project: &str,
        queue: &str,
        amount: i64,
        window: Option<time::Duration>,
        now: OffsetDateTime,
    ) -> BrokerResult<Option<i64>> {
        let backend = self.resolve_or_place(project, queue).await?;
        backend.inc_counter(project, queue, amount, window, now).await
    }

    // -- Message -----------------------------------------------------------

    async fn insert_messages(
        &self,
        project: &str,
        queue: &str,
        client_id: Uuid,
        first_marker: i64,
        messages: &[NewMessage],
        now: OffsetDateTime,
    ) -> BrokerResult<Vec<String>> {
        let backend = self.resolve_or_place(project, queue).await?;
        backend.insert_messages(project, queue, client_id, first_marker, messages, now).await
    }

    async fn list_messages(
        &self,
        project: &str,
        queue: &str,
        client_id: Uuid,
        params: &ListParams,
        now: OffsetDateTime,
    ) -> BrokerResult<MessagePage> {
        let Some(backend) = self.resolve(project, queue).await? else {
            return Ok(MessagePage::default());
        };
        backend.list_messages(project, queue, client_id, params, now).await
    }

    async fn get_message(&self, project: &str, queue: &str, id: &str, now: OffsetDateTime) -> BrokerResult<Message> {
        let backend = self
            .resolve(project, queue)
            .await?
            .ok_or_else(|| BrokerError::MessageDoesNotExist { id: id.to_owned() })?;
        backend.get_message(project, queue, id, now).await
    }

    async fn get_messages(&self, project: &str, queue: &str, ids: &[String], now: OffsetDateTime) -> BrokerResult<Vec<Message>> {
        let Some(backend) = self.resolve(project, queue).await? else {
            return Ok(Vec::new());
        };
        backend.get_messages(project, queue, ids, now).await
    }

    async fn delete_message(
        &self,
        project: &str,
        queue: &str,
        id: &str,
        claim_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BrokerResult<()> {
        let Some(backend) = self.resolve(project, queue).await? else {
            return Ok(());
        };
        backend.delete_message(project, queue, id, claim_id, now).await
    }

    async fn delete_messages(&self, project: &str, queue: &str, ids: &[String]) -> BrokerResult<()> {
        let Some(backend) = self.resolve(project, queue).await? else {
            return Ok(());
        };
        backend.delete_messages(project, queue, ids).await
    }

    async fn pop_messages(&self, project: &str, queue: &str, limit: usize, now: OffsetDateTime) -> BrokerResult<Vec<Message>> {
        let Some(backend) = self.resolve(project, queue).await? else {
            return Ok(Vec::new());
        };
        backend.pop_messages(project, queue, limit, now).await
    }

    async fn first_message(&self, project: &str, queue: &str, sort: Sort, now: OffsetDateTime) -> BrokerResult<Message> {
        let backend = self
            .resolve(project, queue)
            .await?
            .ok_or_else(|| BrokerError::QueueIsEmpty { project: project.to_owned(), queue: queue.to_owned() })?;
        backend.first_message(project, queue, sort, now).await
    }

    // -- Claim -----------------------------------------------------------

    async fn create_claim(
        &self,
        project: &str,
        queue: &str,
        ttl: i64,
        grace: i64,
        limit: usize,
        now: OffsetDateTime,
    ) -> BrokerResult<(Claim, Vec<Message>)> {
        let backend = self.resolve_or_place(project, queue).await?;
        backend.create_claim(project, queue, ttl, grace, limit, now).await
    }

    async fn get_claim(&self, project: &str, queue: &str, claim_id: &str, now: OffsetDateTime) -> BrokerResult<(Claim, Vec<Message>)> {
        let backend = self
            .resolve(project, queue)
            .await?
            .ok_or_else(|| BrokerError::ClaimDoesNotExist { id: claim_id.to_owned() })?;
        backend.get_claim(project, queue, claim_id, now).await
    }

    async fn update_claim(&self, project: &str, queue: &str, claim_id: &str, ttl: i64, now: OffsetDateTime) -> BrokerResult<()> {
        let backend = self
            .resolve(project, queue)
            .await?
            .ok_or_else(|| BrokerError::ClaimDoesNotExist { id: claim_id.to_owned() })?;
        backend.update_claim(project, queue, claim_id, ttl, now).await
    }

    async fn delete_claim(&self, project: &str, queue: &str, claim_id: &str, now: OffsetDateTime) -> BrokerResult<()> {
        let Some(backend) = self.resolve(project, queue).await? else {
            return Ok(());
        };
        backend.delete_claim(project, queue, claim_id, now).await
    }

    // -- Catalogue & pools (control-plane; bypasses routing) ---------------

    async fn catalogue_insert(&self, project: &str, queue: &str, pool_id: &str) -> BrokerResult<()> {
        self.control.catalogue_insert(project, queue, pool_id).await?;
        self.cache.put(project, queue, Some(pool_id.to_owned()), self.clock.now());
        Ok(())
    }

    async fn catalogue_get(&self, project: &str, queue: &str) -> BrokerResult<Option<String>> {
        self.control.catalogue_get(project, queue).await
    }

    async fn catalogue_delete(&self, project: &str, queue: &str) -> BrokerResult<()> {
        self.control.catalogue_delete(project, queue).await?;
        self.cache.invalidate(project, queue);
        Ok(())
    }

    async fn catalogue_drop_all(&self, project: &str, queue: &str) -> BrokerResult<()> {
        self.control.catalogue_drop_all(project, queue).await?;
        self.cache.invalidate(project, queue);
        Ok(())
    }

    async fn pools_register(&self, pool: PoolEntry) -> BrokerResult<()> {
        self.control.pools_register(pool).await
    }

    async fn pools_remove(&self, id: &str) -> BrokerResult<()> {
        self.control.pools_remove(id).await
    }

    async fn pools_get(&self, id: &str) -> BrokerResult<PoolEntry> {
        self.control.pools_get(id).await
    }

    async fn pools_list(&self) -> BrokerResult<Vec<PoolEntry>> {
        self.control.pools_list().await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex as StdMutex;

    use queue_core::clock::MockClock;
    use queue_core::model::{MessageRef, QueueStats};

    use super::*;

    /// A minimal in-memory [`Backend`] sufficient to exercise routing and
    /// caching: tracks queue existence and catalogue/pool state, but not
    /// full message/claim semantics (those are exercised in the storage
    /// crates against the real backends).
    #[derive(Default)]
    struct FakeBackend {
        queues: StdMutex<StdHashMap<(String, String), Queue>>,
        catalogue: StdMutex<StdHashMap<(String, String), String>>,
        pools: StdMutex<StdHashMap<String, PoolEntry>>,
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn create_queue(
            &self,
            project: &str,
            name: &str,
            metadata: serde_json::Value,
            default_ttl: i64,
            now: OffsetDateTime,
        ) -> BrokerResult<bool> {
            let mut queues = self.queues.lock().unwrap();
            let key = (project.to_owned(), name.to_owned());
            let created = !queues.contains_key(&key);
            queues.insert(
                key,
                Queue {
                    project: project.to_owned(),
                    name: name.to_owned(),
                    metadata,
                    default_ttl,
                    created_at: now,
                },
            );
            Ok(created)
        }

        async fn ensure_queue(&self, project: &str, name: &str, default_ttl: i64, now: OffsetDateTime) -> BrokerResult<()> {
            self.create_queue(project, name, serde_json::json!({}), default_ttl, now).await.map(|_| ())
        }

        async fn delete_queue(&self, project: &str, name: &str) -> BrokerResult<()> {
            self.queues.lock().unwrap().remove(&(project.to_owned(), name.to_owned()));
            Ok(())
        }

        async fn get_queue(&self, project: &str, name: &str) -> BrokerResult<Option<Queue>> {
            Ok(self.queues.lock().unwrap().get(&(project.to_owned(), name.to_owned())).cloned())
        }

        async fn queue_stats(&self, _project: &str, _name: &str, _now: OffsetDateTime) -> BrokerResult<QueueStats> {
            Ok(QueueStats {
                total_messages: 0,
                claimed_messages: 0,
                oldest: None::<MessageRef>,
                newest: None::<MessageRef>,
            })
        }

        async fn get_counter(&self, _project: &str, _queue: &str) -> BrokerResult<i64> {
            Ok(1)
        }

        async fn inc_counter(
            &self,
            _project: &str,
            _queue: &str,
            _amount: i64,
            _window: Option<time::Duration>,
            _now: OffsetDateTime,
        ) -> BrokerResult<Option<i64>> {
            Ok(Some(2))
        }

        async fn insert_messages(
            &self,
            _project: &str,
            _queue: &str,
            _client_id: Uuid,
            _first_marker: i64,
            messages: &[NewMessage],
            _now: OffsetDateTime,
        ) -> BrokerResult<Vec<String>> {
            Ok(messages.iter().enumerate().map(|(i, _)| i.to_string()).collect())
        }

        async fn list_messages(
            &self,
            _project: &str,
            _queue: &str,
            _client_id: Uuid,
            _params: &ListParams,
            _now: OffsetDateTime,
        ) -> BrokerResult<MessagePage> {
            Ok(MessagePage::default())
        }

        async fn get_message(&self, _project: &str, _queue: &str, id: &str, _now: OffsetDateTime) -> BrokerResult<Message> {
            Err(BrokerError::MessageDoesNotExist { id: id.to_owned() })
        }

        async fn get_messages(&self, _project: &str, _queue: &str, _ids: &[String], _now: OffsetDateTime) -> BrokerResult<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn delete_message(
            &self,
            _project: &str,
            _queue: &str,
            _id: &str,
            _claim_id: Option<&str>,
            _now: OffsetDateTime,
        ) -> BrokerResult<()> {
            Ok(())
        }

        async fn delete_messages(&self, _project: &str, _queue: &str, _ids: &[String]) -> BrokerResult<()> {
            Ok(())
        }

        async fn pop_messages(&self, _project: &str, _queue: &str, _limit: usize, _now: OffsetDateTime) -> BrokerResult<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn first_message(&self, project: &str, queue: &str, _sort: Sort, _now: OffsetDateTime) -> BrokerResult<Message> {
            Err(BrokerError::QueueIsEmpty { project: project.to_owned(), queue: queue.to_owned() })
        }

        async fn create_claim(
            &self,
            _project: &str,
            _queue: &str,
            ttl: i64,
            grace: i64,
            _limit: usize,
            now: OffsetDateTime,
        ) -> BrokerResult<(Claim, Vec<Message>)> {
            Ok((
                Claim {
                    id: "c1".into(),
                    project: "p".into(),
                    queue: "q".into(),
                    ttl,
                    grace,
                    created_at: now,
                    expires_at: now + time::Duration::seconds(ttl),
                    message_ids: Vec::new(),
                },
                Vec::new(),
            ))
        }

        async fn get_claim(&self, _project: &str, _queue: &str, claim_id: &str, _now: OffsetDateTime) -> BrokerResult<(Claim, Vec<Message>)> {
            Err(BrokerError::ClaimDoesNotExist { id: claim_id.to_owned() })
        }

        async fn update_claim(&self, _project: &str, _queue: &str, claim_id: &str, _ttl: i64, _now: OffsetDateTime) -> BrokerResult<()> {
            Err(BrokerError::ClaimDoesNotExist { id: claim_id.to_owned() })
        }

        async fn delete_claim(&self, _project: &str, _queue: &str, _claim_id: &str, _now: OffsetDateTime) -> BrokerResult<()> {
            Ok(())
        }

        async fn catalogue_insert(&self, project: &str, queue: &str, pool_id: &str) -> BrokerResult<()> {
            self.catalogue
                .lock()
                .unwrap()
                .insert((project.to_owned(), queue.to_owned()), pool_id.to_owned());
            Ok(())
        }

        async fn catalogue_get(&self, project: &str, queue: &str) -> BrokerResult<Option<String>> {
            Ok(self.catalogue.lock().unwrap().get(&(project.to_owned(), queue.to_owned())).cloned())
        }

        async fn catalogue_delete(&self, project: &str, queue: &str) -> BrokerResult<()> {
            self.catalogue.lock().unwrap().remove(&(project.to_owned(), queue.to_owned()));
            Ok(())
        }

        async fn catalogue_drop_all(&self, project: &str, queue: &str) -> BrokerResult<()> {
            self.catalogue_delete(project, queue).await
        }

        async fn pools_register(&self, pool: PoolEntry) -> BrokerResult<()> {
            self.pools.lock().unwrap().insert(pool.id.clone(), pool);
            Ok(())
        }

        async fn pools_remove(&self, id: &str) -> BrokerResult<()> {
            self.pools.lock().unwrap().remove(id);
            Ok(())
        }

        async fn pools_get(&self, id: &str) -> BrokerResult<PoolEntry> {
            self.pools
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| BrokerError::PoolDoesNotExist { id: id.to_owned() })
        }

        async fn pools_list(&self) -> BrokerResult<Vec<PoolEntry>> {
            Ok(self.pools.lock().unwrap().values().cloned().collect())
        }
    }

    async fn router_with_one_pool() -> (Router, Arc<FakeBackend>) {
        let control = Arc::new(FakeBackend::default());
        control
            .pools_register(PoolEntry {
                id: "pool-a".into(),
                uri: "mem://a".into(),
                weight: 1,
                group: None,
            })
            .await
            .unwrap();

        let shard = Arc::new(FakeBackend::default());
        let mut shards: HashMap<String, Arc<dyn Backend>> = HashMap::new();
        shards.insert("pool-a".into(), shard.clone());

        let clock = Arc::new(MockClock::new(OffsetDateTime::UNIX_EPOCH));
        let router = Router::new(control.clone(), shards, clock);
        (router, shard)
    }

    #[tokio::test]
    async fn first_write_places_queue_and_is_stable() {
        let (router, shard) = router_with_one_pool().await;
        let now = OffsetDateTime::UNIX_EPOCH;

        router.ensure_queue("proj", "q1", 3600, now).await.unwrap();
        assert!(shard.get_queue("proj", "q1").await.unwrap().is_some());

        // a second call resolves the same placement rather than re-rolling
        router.ensure_queue("proj", "q1", 3600, now).await.unwrap();
        let pool_id = router.catalogue_get("proj", "q1").await.unwrap();
        assert_eq!(pool_id.as_deref(), Some("pool-a"));
    }

    #[tokio::test]
    async fn unplaced_queue_reads_return_empty_not_error() {
        let (router, _shard) = router_with_one_pool().await;
        let now = OffsetDateTime::UNIX_EPOCH;

        let page = router
            .list_messages("proj", "nope", Uuid::nil(), &ListParams::default(), now)
            .await
            .unwrap();
        assert!(page.messages.is_empty());

        assert!(router.get_queue("proj", "nope").await.unwrap().is_none());

        // idempotent delete over an unplaced queue is a no-op success
        router.delete_queue("proj", "nope").await.unwrap();
    }

    #[tokio::test]
    async fn missing_message_on_placed_queue_is_not_found() {
        let (router, _shard) = router_with_one_pool().await;
        let now = OffsetDateTime::UNIX_EPOCH;
        router.ensure_queue("proj", "q1", 3600, now).await.unwrap();

        let err = router.get_message("proj", "q1", "m-missing", now).await.unwrap_err();
        assert!(matches!(err, BrokerError::MessageDoesNotExist { .. }));
    }

    #[tokio::test]
    async fn placement_on_no_pools_is_invariant_violation() {
        let control = Arc::new(FakeBackend::default());
        let clock = Arc::new(MockClock::new(OffsetDateTime::UNIX_EPOCH));
        let router = Router::new(control, HashMap::new(), clock);

        let err = router.ensure_queue("proj", "q1", 3600, OffsetDateTime::UNIX_EPOCH).await.unwrap_err();
        assert!(matches!(err, BrokerError::InvariantViolation { .. }));
    }

    #[tokio::test]
    async fn delete_queue_invalidates_catalogue_and_cache() {
        let (router, shard) = router_with_one_pool().await;
        let now = OffsetDateTime::UNIX_EPOCH;
        router.ensure_queue("proj", "q1", 3600, now).await.unwrap();

        router.delete_queue("proj", "q1").await.unwrap();
        assert!(router.catalogue_get("proj", "q1").await.unwrap().is_none());

        // re-placing after delete must work (no stale cache entry)
        router.ensure_queue("proj", "q1", 3600, now).await.unwrap();
        assert!(shard.get_queue("proj", "q1").await.unwrap().is_some());
    }
}
