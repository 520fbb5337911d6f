#[macro_use]
extern crate tracing;

mod schema;

use async_trait::async_trait;
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use queue_core::error::{BrokerError, BrokerResult};
use queue_core::model::{Claim, Message, MessagePage, MessageRef, PoolEntry, Queue, QueueStats};
use queue_core::traits::{Backend, ListParams, NewMessage, Sort};
use time::OffsetDateTime;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

const MESSAGE_COLUMNS: &str = "id, project, queue, body, ttl, marker, created_at, client_id, claim_id, claim_expires_at";

/// A relational backend shard over a PostgreSQL database, sharing one
/// process-wide connection pool per backend instance (§5 shared resources).
pub struct PostgresBackend {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

impl PostgresBackend {
    pub async fn connect(config: tokio_postgres::Config) -> BrokerResult<Self> {
        let manager = PostgresConnectionManager::new(config, NoTls);
        let pool = Pool::builder().build(manager).await.map_err(connection_error)?;
        let backend = Self { pool };
        backend.setup().await?;
        Ok(backend)
    }

    async fn setup(&self) -> BrokerResult<()> {
        let conn = self.pool.get().await.map_err(connection_error)?;
        conn.batch_execute(schema::SCHEMA).await.map_err(connection_error)?;
        Ok(())
    }
}

fn connection_error(err: impl std::fmt::Display) -> BrokerError {
    BrokerError::ConnectionError { reason: err.to_string() }
}

fn not_found_message(id: &str) -> BrokerError {
    BrokerError::MessageDoesNotExist { id: id.to_string() }
}

fn row_to_message(row: &Row) -> BrokerResult<Message> {
    Ok(Message {
        id: row.get("id"),
        project: row.get("project"),
        queue: row.get("queue"),
        body: row.get("body"),
        ttl: row.get("ttl"),
        marker: row.get("marker"),
        created_at: row.get("created_at"),
        client_id: row.get("client_id"),
        claim_id: row.get("claim_id"),
        claim_expires_at: row.get("claim_expires_at"),
    })
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn create_queue(
        &self,
        project: &str,
        name: &str,
        metadata: serde_json::Value,
        default_ttl: i64,
        now: OffsetDateTime,
    ) -> BrokerResult<bool> {
        if self.get_queue(project, name).await?.is_some() {
            return Ok(false);
        }

        let mut conn = self.pool.get().await.map_err(connection_error)?;
        let tx = conn.transaction().await.map_err(connection_error)?;
        tx.execute(
            "INSERT INTO queues (project, name, metadata, default_ttl, created_at) VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
            &[&project, &name, &metadata, &default_ttl, &now],
        )
        .await
        .map_err(connection_error)?;
        tx.execute(
            "INSERT INTO counters (project, queue, value, last_modified) VALUES ($1, $2, 1, $3) ON CONFLICT DO NOTHING",
            &[&project, &name, &now],
        )
        .await
        .map_err(connection_error)?;
        tx.commit().await.map_err(connection_error)?;
        Ok(true)
    }

    async fn ensure_queue(&self, project: &str, name: &str, default_ttl: i64, now: OffsetDateTime) -> BrokerResult<()> {
        self.create_queue(project, name, serde_json::json!({}), default_ttl, now).await?;
        Ok(())
    }

    async fn delete_queue(&self, project: &str, name: &str) -> BrokerResult<()> {
        let mut conn = self.pool.get().await.map_err(connection_error)?;
        let tx = conn.transaction().await.map_err(connection_error)?;
        tx.execute("DELETE FROM messages WHERE project = $1 AND queue = $2", &[&project, &name])
            .await
            .map_err(connection_error)?;
        tx.execute("DELETE FROM claims WHERE project = $1 AND queue = $2", &[&project, &name])
            .await
            .map_err(connection_error)?;
        tx.execute("DELETE FROM counters WHERE project = $1 AND queue = $2", &[&project, &name])
            .await
            .map_err(connection_error)?;
        tx.execute("DELETE FROM queues WHERE project = $1 AND name = $2", &[&project, &name])
            .await
            .map_err(connection_error)?;
        tx.commit().await.map_err(connection_error)?;
        Ok(())
    }

    async fn get_queue(&self, project: &str, name: &str) -> BrokerResult<Option<Queue>> {
        let conn = self.pool.get().await.map_err(connection_error)?;
        let row = conn
            .query_opt(
                "SELECT project, name, metadata, default_ttl, created_at FROM queues WHERE project = $1 AND name = $2",
                &[&project, &name],
            )
            .await
            .map_err(connection_error)?;

        Ok(row.map(|row| Queue {
            project: row.get("project"),
            name: row.get("name"),
            metadata: row.get("metadata"),
            default_ttl: row.get("default_ttl"),
            created_at: row.get("created_at"),
        }))
    }

    async fn queue_stats(&self, project: &str, name: &str, now: OffsetDateTime) -> BrokerResult<QueueStats> {
        let conn = self.pool.get().await.map_err(connection_error)?;
        let row = conn
            .query_one(
                "SELECT COUNT(*), COALESCE(SUM(CASE WHEN claim_id IS NOT NULL AND claim_expires_at > $3 THEN 1 ELSE 0 END), 0) \
                 FROM messages WHERE project = $1 AND queue = $2 AND created_at + (ttl || ' seconds')::interval > $3",
                &[&project, &name, &now],
            )
            .await
            .map_err(connection_error)?;

        let oldest = self.first_message(project, name, Sort::Oldest, now).await.ok();
        let newest = self.first_message(project, name, Sort::Newest, now).await.ok();

        Ok(QueueStats {
            total_messages: row.get(0),
            claimed_messages: row.get(1),
            oldest: oldest.map(|m| MessageRef {
                id: m.id,
                marker: m.marker,
                age_seconds: m.age_seconds(now),
            }),
            newest: newest.map(|m| MessageRef {
                id: m.id,
                marker: m.marker,
                age_seconds: m.age_seconds(now),
            }),
        })
    }

    async fn get_counter(&self, project: &str, queue: &str) -> BrokerResult<i64> {
        let conn = self.pool.get().await.map_err(connection_error)?;
        let row = conn
            .query_opt("SELECT value FROM counters WHERE project = $1 AND queue = $2", &[&project, &queue])
            .await
            .map_err(connection_error)?;
        Ok(row.map(|row| row.get(0)).unwrap_or(0))
    }

    async fn inc_counter(
        &self,
        project: &str,
        queue: &str,
        amount: i64,
        window: Option<time::Duration>,
        now: OffsetDateTime,
    ) -> BrokerResult<Option<i64>> {
        let mut conn = self.pool.get().await.map_err(connection_error)?;
        let tx = conn.transaction().await.map_err(connection_error)?;

        tx.execute(
            "INSERT INTO counters (project, queue, value, last_modified) VALUES ($1, $2, 1, $3) ON CONFLICT DO NOTHING",
            &[&project, &queue, &now],
        )
        .await
        .map_err(connection_error)?;

        let row = tx
            .query_one(
                "SELECT value, last_modified FROM counters WHERE project = $1 AND queue = $2 FOR UPDATE",
                &[&project, &queue],
            )
            .await
            .map_err(connection_error)?;
        let current: i64 = row.get(0);
        let last_modified: OffsetDateTime = row.get(1);

        if let Some(window) = window {
            if now - last_modified < window {
                tx.commit().await.map_err(connection_error)?;
                return Ok(None);
            }
        }

        let new_value = current + amount;
        tx.execute(
            "UPDATE counters SET value = $1, last_modified = $2 WHERE project = $3 AND queue = $4",
            &[&new_value, &now, &project, &queue],
        )
        .await
        .map_err(connection_error)?;
        tx.commit().await.map_err(connection_error)?;

        Ok(Some(new_value))
    }

    async fn insert_messages(
        &self,
        project: &str,
        queue: &str,
        client_id: Uuid,
        first_marker: i64,
        messages: &[NewMessage],
        now: OffsetDateTime,
    ) -> BrokerResult<Vec<String>> {
        let mut conn = self.pool.get().await.map_err(connection_error)?;
        let tx = conn.transaction().await.map_err(connection_error)?;
        let mut ids = Vec::with_capacity(messages.len());

        for (offset, message) in messages.iter().enumerate() {
            let id = queue_core::ids::new_message_id();
            let marker = first_marker + i64::try_from(offset).expect("batch offset fits i64");

            let result = tx
                .execute(
                    &format!(
                        "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, NULL)"
                    ),
                    &[&id, &project, &queue, &message.body, &message.ttl, &marker, &now, &client_id],
                )
                .await;

            match result {
                Ok(_) => ids.push(id),
                Err(err) if err.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION) => {
                    tx.rollback().await.map_err(connection_error)?;
                    return Err(BrokerError::MessageConflict);
                }
                Err(err) => return Err(connection_error(err)),
            }
        }

        tx.commit().await.map_err(connection_error)?;
        Ok(ids)
    }

    async fn list_messages(
        &self,
        project: &str,
        queue: &str,
        client_id: Uuid,
        params: &ListParams,
        now: OffsetDateTime,
    ) -> BrokerResult<MessagePage> {
        let marker_floor: i64 = params.marker.as_deref().and_then(|m| m.parse().ok()).unwrap_or(i64::MIN);
        let limit = i64::try_from(params.limit).map_err(|_| BrokerError::invariant("limit overflowed i64"))?;

        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE project = $1 AND queue = $2 \
             AND created_at + (ttl || ' seconds')::interval > $3 \
             AND marker > $4"
        );
        if !params.include_claimed {
            // Unclaimed-only listing still surfaces messages whose claim has
            // itself lapsed (claim_id left stamped, nothing clears it on
            // expiry) — only a *live* claim hides a message here.
            sql.push_str(" AND (claim_id IS NULL OR claim_expires_at <= $3)");
        }
        if !params.echo {
            sql.push_str(" AND client_id != $6");
        }
        sql.push_str(" ORDER BY marker ASC LIMIT $5");

        let conn = self.pool.get().await.map_err(connection_error)?;
        let rows = if params.echo {
            conn.query(&sql, &[&project, &queue, &now, &marker_floor, &limit])
                .await
                .map_err(connection_error)?
        } else {
            conn.query(&sql, &[&project, &queue, &now, &marker_floor, &limit, &client_id])
                .await
                .map_err(connection_error)?
        };

        let messages = rows.iter().map(row_to_message).collect::<BrokerResult<Vec<_>>>()?;
        let next_marker = messages.last().map(|m| m.marker.to_string());
        Ok(MessagePage { messages, next_marker })
    }

    async fn get_message(&self, project: &str, queue: &str, id: &str, now: OffsetDateTime) -> BrokerResult<Message> {
        let conn = self.pool.get().await.map_err(connection_error)?;
        let row = conn
            .query_opt(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1 AND project = $2 AND queue = $3"),
                &[&id, &project, &queue],
            )
            .await
            .map_err(connection_error)?
            .ok_or_else(|| not_found_message(id))?;

        let message = row_to_message(&row)?;
        if message.is_expired(now) {
            return Err(not_found_message(id));
        }
        Ok(message)
    }

    async fn get_messages(&self, project: &str, queue: &str, ids: &[String], now: OffsetDateTime) -> BrokerResult<Vec<Message>> {
        let mut found = Vec::new();
        for id in ids {
            if let Ok(message) = self.get_message(project, queue, id, now).await {
                found.push(message);
            }
        }
        Ok(found)
    }

    async fn delete_message(
        &self,
        project: &str,
        queue: &str,
        id: &str,
        claim_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BrokerResult<()> {
        let conn = self.pool.get().await.map_err(connection_error)?;
        match claim_id {
            Some(claim_id) => {
                conn.execute(
                    "DELETE FROM messages WHERE id = $1 AND project = $2 AND queue = $3 \
                     AND claim_id = $4 AND claim_expires_at > $5",
                    &[&id, &project, &queue, &claim_id, &now],
                )
                .await
                .map_err(connection_error)?;
            }
            None => {
                conn.execute("DELETE FROM messages WHERE id = $1 AND project = $2 AND queue = $3", &[&id, &project, &queue])
                    .await
                    .map_err(connection_error)?;
            }
        }
        Ok(())
    }

    async fn delete_messages(&self, project: &str, queue: &str, ids: &[String]) -> BrokerResult<()> {
        let conn = self.pool.get().await.map_err(connection_error)?;
        conn.execute(
            "DELETE FROM messages WHERE project = $1 AND queue = $2 AND id = ANY($3)",
            &[&project, &queue, &ids],
        )
        .await
        .map_err(connection_error)?;
        Ok(())
    }

    async fn pop_messages(&self, project: &str, queue: &str, limit: usize, now: OffsetDateTime) -> BrokerResult<Vec<Message>> {
        let limit = i64::try_from(limit).map_err(|_| BrokerError::invariant("limit overflowed i64"))?;
        let mut conn = self.pool.get().await.map_err(connection_error)?;
        let tx = conn.transaction().await.map_err(connection_error)?;

        let rows = tx
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE project = $1 AND queue = $2 \
                     AND created_at + (ttl || ' seconds')::interval > $3 AND (claim_id IS NULL OR claim_expires_at <= $3) \
                     ORDER BY marker ASC LIMIT $4 FOR UPDATE"
                ),
                &[&project, &queue, &now, &limit],
            )
            .await
            .map_err(connection_error)?;

        let messages = rows.iter().map(row_to_message).collect::<BrokerResult<Vec<_>>>()?;
        let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        tx.execute("DELETE FROM messages WHERE id = ANY($1)", &[&ids])
            .await
            .map_err(connection_error)?;
        tx.commit().await.map_err(connection_error)?;
        Ok(messages)
    }

    async fn first_message(&self, project: &str, queue: &str, sort: Sort, now: OffsetDateTime) -> BrokerResult<Message> {
        let direction = match sort {
            Sort::Oldest => "ASC",
            Sort::Newest => "DESC",
        };
        let conn = self.pool.get().await.map_err(connection_error)?;
        let row = conn
            .query_opt(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE project = $1 AND queue = $2 \
                     AND created_at + (ttl || ' seconds')::interval > $3 AND (claim_id IS NULL OR claim_expires_at <= $3) \
                     ORDER BY marker {direction} LIMIT 1"
                ),
                &[&project, &queue, &now],
            )
            .await
            .map_err(connection_error)?;

        match row {
            Some(row) => row_to_message(&row),
            None => Err(BrokerError::QueueIsEmpty {
                project: project.to_string(),
                queue: queue.to_string(),
            }),
        }
    }

    async fn create_claim(
        &self,
        project: &str,
        queue: &str,
        ttl: i64,
        grace: i64,
        limit: usize,
        now: OffsetDateTime,
    ) -> BrokerResult<(Claim, Vec<Message>)> {
        let limit = i64::try_from(limit).map_err(|_| BrokerError::invariant("limit overflowed i64"))?;
        let claim_id = queue_core::ids::new_claim_id();
        let expires_at = now + time::Duration::seconds(ttl);

        let mut conn = self.pool.get().await.map_err(connection_error)?;
        let tx = conn.transaction().await.map_err(connection_error)?;

        let candidate_rows = tx
            .query(
                "SELECT id FROM messages WHERE project = $1 AND queue = $2 \
                 AND created_at + (ttl || ' seconds')::interval > $3 \
                 AND (claim_id IS NULL OR claim_expires_at <= $3) \
                 ORDER BY marker ASC LIMIT $4 FOR UPDATE SKIP LOCKED",
                &[&project, &queue, &now, &limit],
            )
            .await
            .map_err(connection_error)?;
        let ids: Vec<String> = candidate_rows.iter().map(|row| row.get(0)).collect();

        if !ids.is_empty() {
            tx.execute(
                "UPDATE messages SET claim_id = $1, claim_expires_at = $2, ttl = ttl + $3 WHERE id = ANY($4)",
                &[&claim_id, &expires_at, &grace, &ids],
            )
            .await
            .map_err(connection_error)?;
        }

        tx.execute(
            "INSERT INTO claims (id, project, queue, ttl, grace, created_at, expires_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[&claim_id, &project, &queue, &ttl, &grace, &now, &expires_at],
        )
        .await
        .map_err(connection_error)?;

        let message_rows = tx
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE claim_id = $1 ORDER BY marker ASC"),
                &[&claim_id],
            )
            .await
            .map_err(connection_error)?;
        let messages = message_rows.iter().map(row_to_message).collect::<BrokerResult<Vec<_>>>()?;

        tx.commit().await.map_err(connection_error)?;

        Ok((
            Claim {
                id: claim_id,
                project: project.to_string(),
                queue: queue.to_string(),
                ttl,
                grace,
                created_at: now,
                expires_at,
                message_ids: ids,
            },
            messages,
        ))
    }

    async fn get_claim(&self, project: &str, queue: &str, claim_id: &str, now: OffsetDateTime) -> BrokerResult<(Claim, Vec<Message>)> {
        let claim_missing = || BrokerError::ClaimDoesNotExist { id: claim_id.to_string() };
        let conn = self.pool.get().await.map_err(connection_error)?;

        let row = conn
            .query_opt(
                "SELECT id, project, queue, ttl, grace, created_at, expires_at FROM claims \
                 WHERE id = $1 AND project = $2 AND queue = $3 AND expires_at > $4",
                &[&claim_id, &project, &queue, &now],
            )
            .await
            .map_err(connection_error)?
            .ok_or_else(claim_missing)?;

        let message_rows = conn
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE claim_id = $1 ORDER BY marker ASC"),
                &[&claim_id],
            )
            .await
            .map_err(connection_error)?;
        let messages = message_rows.iter().map(row_to_message).collect::<BrokerResult<Vec<_>>>()?;

        Ok((
            Claim {
                id: row.get(0),
                project: row.get(1),
                queue: row.get(2),
                ttl: row.get(3),
                grace: row.get(4),
                created_at: row.get(5),
                expires_at: row.get(6),
                message_ids: messages.iter().map(|m| m.id.clone()).collect(),
            },
            messages,
        ))
    }

    async fn update_claim(&self, project: &str, queue: &str, claim_id: &str, ttl: i64, now: OffsetDateTime) -> BrokerResult<()> {
        let expires_at = now + time::Duration::seconds(ttl);
        let conn = self.pool.get().await.map_err(connection_error)?;
        let affected = conn
            .execute(
                "UPDATE claims SET ttl = $1, expires_at = $2 WHERE id = $3 AND project = $4 AND queue = $5 AND expires_at > $6",
                &[&ttl, &expires_at, &claim_id, &project, &queue, &now],
            )
            .await
            .map_err(connection_error)?;

        if affected == 0 {
            return Err(BrokerError::ClaimDoesNotExist { id: claim_id.to_string() });
        }
        Ok(())
    }

    async fn delete_claim(&self, project: &str, queue: &str, claim_id: &str, _now: OffsetDateTime) -> BrokerResult<()> {
        let mut conn = self.pool.get().await.map_err(connection_error)?;
        let tx = conn.transaction().await.map_err(connection_error)?;
        tx.execute("UPDATE messages SET claim_id = NULL, claim_expires_at = NULL WHERE claim_id = $1", &[&claim_id])
            .await
            .map_err(connection_error)?;
        tx.execute("DELETE FROM claims WHERE id = $1 AND project = $2 AND queue = $3", &[&claim_id, &project, &queue])
            .await
            .map_err(connection_error)?;
        tx.commit().await.map_err(connection_error)?;
        Ok(())
    }

    async fn catalogue_insert(&self, project: &str, queue: &str, pool_id: &str) -> BrokerResult<()> {
        let conn = self.pool.get().await.map_err(connection_error)?;
        conn.execute(
            "INSERT INTO catalogue (project, queue, pool_id) VALUES ($1, $2, $3) \
             ON CONFLICT (project, queue) DO UPDATE SET pool_id = EXCLUDED.pool_id",
            &[&project, &queue, &pool_id],
        )
        .await
        .map_err(connection_error)?;
        Ok(())
    }

    async fn catalogue_get(&self, project: &str, queue: &str) -> BrokerResult<Option<String>> {
        let conn = self.pool.get().await.map_err(connection_error)?;
        let row = conn
            .query_opt("SELECT pool_id FROM catalogue WHERE project = $1 AND queue = $2", &[&project, &queue])
            .await
            .map_err(connection_error)?;
        Ok(row.map(|row| row.get(0)))
    }

    async fn catalogue_delete(&self, project: &str, queue: &str) -> BrokerResult<()> {
        let conn = self.pool.get().await.map_err(connection_error)?;
        conn.execute("DELETE FROM catalogue WHERE project = $1 AND queue = $2", &[&project, &queue])
            .await
            .map_err(connection_error)?;
        Ok(())
    }

    async fn catalogue_drop_all(&self, project: &str, queue: &str) -> BrokerResult<()> {
        self.catalogue_delete(project, queue).await
    }

    async fn pools_register(&self, pool: PoolEntry) -> BrokerResult<()> {
        let conn = self.pool.get().await.map_err(connection_error)?;
        conn.execute(
            "INSERT INTO pools (id, uri, weight, group_tag) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET uri = EXCLUDED.uri, weight = EXCLUDED.weight, group_tag = EXCLUDED.group_tag",
            &[&pool.id, &pool.uri, &i32::try_from(pool.weight).unwrap_or(i32::MAX), &pool.group],
        )
        .await
        .map_err(connection_error)?;
        Ok(())
    }

    async fn pools_remove(&self, id: &str) -> BrokerResult<()> {
        let conn = self.pool.get().await.map_err(connection_error)?;
        conn.execute("DELETE FROM pools WHERE id = $1", &[&id]).await.map_err(connection_error)?;
        Ok(())
    }

    async fn pools_get(&self, id: &str) -> BrokerResult<PoolEntry> {
        let conn = self.pool.get().await.map_err(connection_error)?;
        let row = conn
            .query_opt("SELECT id, uri, weight, group_tag FROM pools WHERE id = $1", &[&id])
            .await
            .map_err(connection_error)?
            .ok_or_else(|| BrokerError::PoolDoesNotExist { id: id.to_string() })?;
        Ok(PoolEntry {
            id: row.get(0),
            uri: row.get(1),
            weight: u32::try_from(row.get::<_, i32>(2)).unwrap_or(0),
            group: row.get(3),
        })
    }

    async fn pools_list(&self) -> BrokerResult<Vec<PoolEntry>> {
        let conn = self.pool.get().await.map_err(connection_error)?;
        let rows = conn
            .query("SELECT id, uri, weight, group_tag FROM pools ORDER BY id", &[])
            .await
            .map_err(connection_error)?;
        Ok(rows
            .iter()
            .map(|row| PoolEntry {
                id: row.get(0),
                uri: row.get(1),
                weight: u32::try_from(row.get::<_, i32>(2)).unwrap_or(0),
                group: row.get(3),
            })
            .collect())
    }
}
