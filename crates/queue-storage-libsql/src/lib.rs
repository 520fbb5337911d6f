#[macro_use]
extern crate tracing;

mod time_repr;

use std::path::Path;

use async_trait::async_trait;
use libsql::params;
use queue_core::error::{BrokerError, BrokerResult};
use queue_core::model::{Claim, Message, MessagePage, MessageRef, PoolEntry, Queue, QueueStats};
use queue_core::traits::{Backend, ListParams, NewMessage, Sort};
use time::OffsetDateTime;
use time_repr::{from_micros, to_micros};
use uuid::Uuid;

const MIGRATIONS: &[&str] = &[include_str!("../schema/migrations.sql")];

/// A document-store-leaning backend shard over a single libsql database.
pub struct LibsqlBackend {
    conn: libsql::Connection,
}

impl LibsqlBackend {
    /// Open (creating if absent) a local libsql database file and apply
    /// pending migrations and pragmas.
    pub async fn open(path: impl AsRef<Path>) -> BrokerResult<Self> {
        let db = libsql::Builder::new_local(path.as_ref())
            .build()
            .await
            .map_err(connection_error)?;
        let conn = db.connect().map_err(connection_error)?;
        let backend = Self { conn };
        backend.apply_pragmas().await?;
        backend.setup().await?;
        Ok(backend)
    }

    async fn apply_pragmas(&self) -> BrokerResult<()> {
        for pragma in [
            "PRAGMA journal_mode = WAL",
            "PRAGMA synchronous = NORMAL",
            "PRAGMA busy_timeout = 15000",
            "PRAGMA cache_size = -3000",
            "PRAGMA auto_vacuum = INCREMENTAL",
            "PRAGMA temp_store = MEMORY",
            "PRAGMA foreign_keys = ON",
        ] {
            self.conn.execute(pragma, ()).await.map_err(connection_error)?;
        }
        Ok(())
    }

    async fn setup(&self) -> BrokerResult<()> {
        let version = self.schema_version().await?;
        let target = i64::try_from(MIGRATIONS.len()).expect("migration count fits i64");

        if version >= target {
            return Ok(());
        }

        for migration in &MIGRATIONS[usize::try_from(version).unwrap_or(0)..] {
            for statement in migration.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                self.conn.execute(statement, ()).await.map_err(connection_error)?;
            }
        }

        self.conn
            .execute(&format!("PRAGMA user_version = {target}"), ())
            .await
            .map_err(connection_error)?;

        debug!(from = version, to = target, "applied libsql schema migrations");
        Ok(())
    }

    async fn schema_version(&self) -> BrokerResult<i64> {
        let mut rows = self.conn.query("PRAGMA user_version", ()).await.map_err(connection_error)?;
        let row = rows
            .next()
            .await
            .map_err(connection_error)?
            .ok_or_else(|| BrokerError::invariant("PRAGMA user_version returned no row"))?;
        row.get::<i64>(0).map_err(connection_error)
    }
}

fn connection_error(err: impl std::fmt::Display) -> BrokerError {
    BrokerError::ConnectionError { reason: err.to_string() }
}

fn not_found_message(id: &str) -> BrokerError {
    BrokerError::MessageDoesNotExist { id: id.to_string() }
}

fn row_to_message(row: &libsql::Row) -> BrokerResult<Message> {
    let claim_id: Option<String> = row.get(8).map_err(connection_error)?;
    let claim_expires_at: Option<i64> = row.get(9).map_err(connection_error)?;
    Ok(Message {
        id: row.get::<String>(0).map_err(connection_error)?,
        project: row.get::<String>(1).map_err(connection_error)?,
        queue: row.get::<String>(2).map_err(connection_error)?,
        body: serde_json::from_str(&row.get::<String>(3).map_err(connection_error)?)
            .map_err(|err| BrokerError::invariant(format!("stored message body is not valid JSON: {err}")))?,
        ttl: row.get::<i64>(4).map_err(connection_error)?,
        marker: row.get::<i64>(5).map_err(connection_error)?,
        created_at: from_micros(row.get::<i64>(6).map_err(connection_error)?)?,
        client_id: Uuid::parse_str(&row.get::<String>(7).map_err(connection_error)?)
            .map_err(|err| BrokerError::invariant(format!("stored client_id is not a UUID: {err}")))?,
        claim_id,
        claim_expires_at: claim_expires_at.map(from_micros).transpose()?,
    })
}

const MESSAGE_COLUMNS: &str =
    "id, project, queue, body, ttl, marker, created_at, client_id, claim_id, claim_expires_at";

#[async_trait]
impl Backend for LibsqlBackend {
    async fn create_queue(
        &self,
        project: &str,
        name: &str,
        metadata: serde_json::Value,
        default_ttl: i64,
        now: OffsetDateTime,
    ) -> BrokerResult<bool> {
        let existing = self.get_queue(project, name).await?;
        if existing.is_some() {
            return Ok(false);
        }

        let tx = self.conn.transaction().await.map_err(connection_error)?;
        tx.execute(
            "INSERT OR IGNORE INTO queues (project, name, metadata, default_ttl, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![project, name, metadata.to_string(), default_ttl, to_micros(now)],
        )
        .await
        .map_err(connection_error)?;
        tx.execute(
            "INSERT OR IGNORE INTO counters (project, queue, value, last_modified) VALUES (?1, ?2, 1, ?3)",
            params![project, name, to_micros(now)],
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
        let tx = self.conn.transaction().await.map_err(connection_error)?;
        tx.execute("DELETE FROM messages WHERE project = ?1 AND queue = ?2", params![project, name])
            .await
            .map_err(connection_error)?;
        tx.execute("DELETE FROM claims WHERE project = ?1 AND queue = ?2", params![project, name])
            .await
            .map_err(connection_error)?;
        tx.execute("DELETE FROM counters WHERE project = ?1 AND queue = ?2", params![project, name])
            .await
            .map_err(connection_error)?;
        tx.execute("DELETE FROM queues WHERE project = ?1 AND name = ?2", params![project, name])
            .await
            .map_err(connection_error)?;
        tx.commit().await.map_err(connection_error)?;
        Ok(())
    }

    async fn get_queue(&self, project: &str, name: &str) -> BrokerResult<Option<Queue>> {
        let mut rows = self
            .conn
            .query(
                "SELECT project, name, metadata, default_ttl, created_at FROM queues WHERE project = ?1 AND name = ?2",
                params![project, name],
            )
            .await
            .map_err(connection_error)?;

        let Some(row) = rows.next().await.map_err(connection_error)? else {
            return Ok(None);
        };

        Ok(Some(Queue {
            project: row.get::<String>(0).map_err(connection_error)?,
            name: row.get::<String>(1).map_err(connection_error)?,
            metadata: serde_json::from_str(&row.get::<String>(2).map_err(connection_error)?)
                .map_err(|err| BrokerError::invariant(format!("stored queue metadata is not valid JSON: {err}")))?,
            default_ttl: row.get::<i64>(3).map_err(connection_error)?,
            created_at: from_micros(row.get::<i64>(4).map_err(connection_error)?)?,
        }))
    }

    async fn queue_stats(&self, project: &str, name: &str, now: OffsetDateTime) -> BrokerResult<QueueStats> {
        let not_expired = not_expired_predicate_sql();

        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT COUNT(*), SUM(CASE WHEN claim_id IS NOT NULL AND claim_expires_at > ?3 THEN 1 ELSE 0 END) \
                     FROM messages WHERE project = ?1 AND queue = ?2 AND {not_expired}"
                ),
                params![project, name, to_micros(now)],
            )
            .await
            .map_err(connection_error)?;
        let row = rows
            .next()
            .await
            .map_err(connection_error)?
            .ok_or_else(|| BrokerError::invariant("COUNT(*) query returned no row"))?;
        let total_messages: i64 = row.get(0).map_err(connection_error)?;
        let claimed_messages: i64 = row.get::<Option<i64>>(1).map_err(connection_error)?.unwrap_or(0);

        let oldest = self.first_message(project, name, Sort::Oldest, now).await.ok();
        let newest = self.first_message(project, name, Sort::Newest, now).await.ok();

        Ok(QueueStats {
            total_messages,
            claimed_messages,
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
        let mut rows = self
            .conn
            .query(
                "SELECT value FROM counters WHERE project = ?1 AND queue = ?2",
                params![project, queue],
            )
            .await
            .map_err(connection_error)?;
        match rows.next().await.map_err(connection_error)? {
            Some(row) => row.get::<i64>(0).map_err(connection_error),
            None => Ok(0),
        }
    }

    async fn inc_counter(
        &self,
        project: &str,
        queue: &str,
        amount: i64,
        window: Option<time::Duration>,
        now: OffsetDateTime,
    ) -> BrokerResult<Option<i64>> {
        let tx = self.conn.transaction().await.map_err(connection_error)?;
        tx.execute(
            "INSERT OR IGNORE INTO counters (project, queue, value, last_modified) VALUES (?1, ?2, 1, ?3)",
            params![project, queue, to_micros(now)],
        )
        .await
        .map_err(connection_error)?;

        let mut rows = tx
            .query(
                "SELECT value, last_modified FROM counters WHERE project = ?1 AND queue = ?2",
                params![project, queue],
            )
            .await
            .map_err(connection_error)?;
        let row = rows
            .next()
            .await
            .map_err(connection_error)?
            .ok_or_else(|| BrokerError::invariant("counter row missing after insert-or-ignore"))?;
        let current: i64 = row.get(0).map_err(connection_error)?;
        let last_modified = from_micros(row.get::<i64>(1).map_err(connection_error)?)?;

        if let Some(window) = window {
            if now - last_modified < window {
                tx.commit().await.map_err(connection_error)?;
                return Ok(None);
            }
        }

        let new_value = current + amount;
        tx.execute(
            "UPDATE counters SET value = ?1, last_modified = ?2 WHERE project = ?3 AND queue = ?4",
            params![new_value, to_micros(now), project, queue],
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
        let tx = self.conn.transaction().await.map_err(connection_error)?;
        let mut ids = Vec::with_capacity(messages.len());

        for (offset, message) in messages.iter().enumerate() {
            let id = queue_core::ids::new_message_id();
            let marker = first_marker + i64::try_from(offset).expect("batch offset fits i64");

            let result = tx
                .execute(
                    &format!(
                        "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL)"
                    ),
                    params![
                        id.clone(),
                        project,
                        queue,
                        message.body.to_string(),
                        message.ttl,
                        marker,
                        to_micros(now),
                        client_id.to_string(),
                    ],
                )
                .await;

            match result {
                Ok(_) => ids.push(id),
                Err(err) if is_unique_violation(&err) => {
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
        params_: &ListParams,
        now: OffsetDateTime,
    ) -> BrokerResult<MessagePage> {
        let not_expired = not_expired_predicate_sql();
        let marker_floor: i64 = match &params_.marker {
            Some(marker) => marker.parse().unwrap_or(i64::MIN),
            None => i64::MIN,
        };

        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE project = ?1 AND queue = ?2 AND {not_expired} AND marker > ?4"
        );
        if !params_.include_claimed {
            // Unclaimed-only listing still surfaces messages whose claim has
            // itself lapsed (claim_id left stamped, nothing clears it on
            // expiry) — only a *live* claim hides a message here.
            sql.push_str(" AND (claim_id IS NULL OR claim_expires_at <= ?3)");
        }
        if !params_.echo {
            sql.push_str(" AND client_id != ?6");
        }
        sql.push_str(" ORDER BY marker ASC LIMIT ?5");

        let limit = i64::try_from(params_.limit).map_err(|_| BrokerError::invariant("limit overflowed i64"))?;

        let mut rows = if params_.echo {
            self.conn
                .query(&sql, params![project, queue, to_micros(now), marker_floor, limit])
                .await
                .map_err(connection_error)?
        } else {
            self.conn
                .query(
                    &sql,
                    params![project, queue, to_micros(now), marker_floor, limit, client_id.to_string()],
                )
                .await
                .map_err(connection_error)?
        };

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(connection_error)? {
            messages.push(row_to_message(&row)?);
        }

        let next_marker = messages.last().map(|m| m.marker.to_string());
        Ok(MessagePage { messages, next_marker })
    }

    async fn get_message(&self, project: &str, queue: &str, id: &str, now: OffsetDateTime) -> BrokerResult<Message> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1 AND project = ?2 AND queue = ?3"),
                params![id, project, queue],
            )
            .await
            .map_err(connection_error)?;

        let row = rows.next().await.map_err(connection_error)?.ok_or_else(|| not_found_message(id))?;
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
        match claim_id {
            Some(claim_id) => {
                self.conn
                    .execute(
                        "DELETE FROM messages WHERE id = ?1 AND project = ?2 AND queue = ?3 \
                         AND claim_id = ?4 AND claim_expires_at > ?5",
                        params![id, project, queue, claim_id, to_micros(now)],
                    )
                    .await
                    .map_err(connection_error)?;
            }
            None => {
                self.conn
                    .execute("DELETE FROM messages WHERE id = ?1 AND project = ?2 AND queue = ?3", params![id, project, queue])
                    .await
                    .map_err(connection_error)?;
            }
        }
        Ok(())
    }

    async fn delete_messages(&self, project: &str, queue: &str, ids: &[String]) -> BrokerResult<()> {
        for id in ids {
            self.conn
                .execute("DELETE FROM messages WHERE id = ?1 AND project = ?2 AND queue = ?3", params![id.as_str(), project, queue])
                .await
                .map_err(connection_error)?;
        }
        Ok(())
    }

    async fn pop_messages(&self, project: &str, queue: &str, limit: usize, now: OffsetDateTime) -> BrokerResult<Vec<Message>> {
        let visible_predicate = visible_predicate_sql();
        let limit = i64::try_from(limit).map_err(|_| BrokerError::invariant("limit overflowed i64"))?;

        let tx = self.conn.transaction().await.map_err(connection_error)?;
        let mut rows = tx
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE project = ?1 AND queue = ?2 AND {visible_predicate} \
                     ORDER BY marker ASC LIMIT ?4"
                ),
                params![project, queue, to_micros(now), limit],
            )
            .await
            .map_err(connection_error)?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(connection_error)? {
            messages.push(row_to_message(&row)?);
        }

        for message in &messages {
            tx.execute("DELETE FROM messages WHERE id = ?1", params![message.id.clone()])
                .await
                .map_err(connection_error)?;
        }

        tx.commit().await.map_err(connection_error)?;
        Ok(messages)
    }

    async fn first_message(&self, project: &str, queue: &str, sort: Sort, now: OffsetDateTime) -> BrokerResult<Message> {
        let visible_predicate = visible_predicate_sql();
        let direction = match sort {
            Sort::Oldest => "ASC",
            Sort::Newest => "DESC",
        };

        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE project = ?1 AND queue = ?2 AND {visible_predicate} \
                     ORDER BY marker {direction} LIMIT 1"
                ),
                params![project, queue, to_micros(now)],
            )
            .await
            .map_err(connection_error)?;

        match rows.next().await.map_err(connection_error)? {
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
        let visible_predicate = visible_predicate_sql();
        let limit = i64::try_from(limit).map_err(|_| BrokerError::invariant("limit overflowed i64"))?;
        let claim_id = queue_core::ids::new_claim_id();
        let expires_at = now + time::Duration::seconds(ttl);

        let tx = self.conn.transaction().await.map_err(connection_error)?;

        let mut rows = tx
            .query(
                &format!(
                    "SELECT id FROM messages WHERE project = ?1 AND queue = ?2 AND {visible_predicate} \
                     ORDER BY marker ASC LIMIT ?4"
                ),
                params![project, queue, to_micros(now), limit],
            )
            .await
            .map_err(connection_error)?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(connection_error)? {
            ids.push(row.get::<String>(0).map_err(connection_error)?);
        }

        for id in &ids {
            tx.execute(
                "UPDATE messages SET claim_id = ?1, claim_expires_at = ?2, ttl = ttl + ?3 WHERE id = ?4",
                params![claim_id.clone(), to_micros(expires_at), grace, id.clone()],
            )
            .await
            .map_err(connection_error)?;
        }

        tx.execute(
            "INSERT INTO claims (id, project, queue, ttl, grace, created_at, expires_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![claim_id.clone(), project, queue, ttl, grace, to_micros(now), to_micros(expires_at)],
        )
        .await
        .map_err(connection_error)?;

        let mut messages_rows = tx
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE claim_id = ?1 ORDER BY marker ASC"),
                params![claim_id.clone()],
            )
            .await
            .map_err(connection_error)?;
        let mut messages = Vec::new();
        while let Some(row) = messages_rows.next().await.map_err(connection_error)? {
            messages.push(row_to_message(&row)?);
        }

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

        let mut rows = self
            .conn
            .query(
                "SELECT id, project, queue, ttl, grace, created_at, expires_at FROM claims \
                 WHERE id = ?1 AND project = ?2 AND queue = ?3 AND expires_at > ?4",
                params![claim_id, project, queue, to_micros(now)],
            )
            .await
            .map_err(connection_error)?;

        let row = rows.next().await.map_err(connection_error)?.ok_or_else(claim_missing)?;
        let claim_created_at = from_micros(row.get::<i64>(5).map_err(connection_error)?)?;
        let claim_expires_at = from_micros(row.get::<i64>(6).map_err(connection_error)?)?;

        let mut message_rows = self
            .conn
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE claim_id = ?1 ORDER BY marker ASC"),
                params![claim_id],
            )
            .await
            .map_err(connection_error)?;
        let mut messages = Vec::new();
        while let Some(row) = message_rows.next().await.map_err(connection_error)? {
            messages.push(row_to_message(&row)?);
        }

        Ok((
            Claim {
                id: row.get::<String>(0).map_err(connection_error)?,
                project: row.get::<String>(1).map_err(connection_error)?,
                queue: row.get::<String>(2).map_err(connection_error)?,
                ttl: row.get::<i64>(3).map_err(connection_error)?,
                grace: row.get::<i64>(4).map_err(connection_error)?,
                created_at: claim_created_at,
                expires_at: claim_expires_at,
                message_ids: messages.iter().map(|m| m.id.clone()).collect(),
            },
            messages,
        ))
    }

    async fn update_claim(&self, project: &str, queue: &str, claim_id: &str, ttl: i64, now: OffsetDateTime) -> BrokerResult<()> {
        let expires_at = now + time::Duration::seconds(ttl);
        let affected = self
            .conn
            .execute(
                "UPDATE claims SET ttl = ?1, expires_at = ?2 WHERE id = ?3 AND project = ?4 AND queue = ?5 AND expires_at > ?6",
                params![ttl, to_micros(expires_at), claim_id, project, queue, to_micros(now)],
            )
            .await
            .map_err(connection_error)?;

        if affected == 0 {
            return Err(BrokerError::ClaimDoesNotExist { id: claim_id.to_string() });
        }
        Ok(())
    }

    async fn delete_claim(&self, project: &str, queue: &str, claim_id: &str, _now: OffsetDateTime) -> BrokerResult<()> {
        let tx = self.conn.transaction().await.map_err(connection_error)?;
        tx.execute(
            "UPDATE messages SET claim_id = NULL, claim_expires_at = NULL WHERE claim_id = ?1",
            params![claim_id],
        )
        .await
        .map_err(connection_error)?;
        tx.execute(
            "DELETE FROM claims WHERE id = ?1 AND project = ?2 AND queue = ?3",
            params![claim_id, project, queue],
        )
        .await
        .map_err(connection_error)?;
        tx.commit().await.map_err(connection_error)?;
        Ok(())
    }

    async fn catalogue_insert(&self, project: &str, queue: &str, pool_id: &str) -> BrokerResult<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO catalogue (project, queue, pool_id) VALUES (?1, ?2, ?3)",
                params![project, queue, pool_id],
            )
            .await
            .map_err(connection_error)?;
        Ok(())
    }

    async fn catalogue_get(&self, project: &str, queue: &str) -> BrokerResult<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT pool_id FROM catalogue WHERE project = ?1 AND queue = ?2", params![project, queue])
            .await
            .map_err(connection_error)?;
        match rows.next().await.map_err(connection_error)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(connection_error)?)),
            None => Ok(None),
        }
    }

    async fn catalogue_delete(&self, project: &str, queue: &str) -> BrokerResult<()> {
        self.conn
            .execute("DELETE FROM catalogue WHERE project = ?1 AND queue = ?2", params![project, queue])
            .await
            .map_err(connection_error)?;
        Ok(())
    }

    async fn catalogue_drop_all(&self, project: &str, queue: &str) -> BrokerResult<()> {
        self.catalogue_delete(project, queue).await
    }

    async fn pools_register(&self, pool: PoolEntry) -> BrokerResult<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO pools (id, uri, weight, group_tag) VALUES (?1, ?2, ?3, ?4)",
                params![pool.id, pool.uri, i64::from(pool.weight), pool.group],
            )
            .await
            .map_err(connection_error)?;
        Ok(())
    }

    async fn pools_remove(&self, id: &str) -> BrokerResult<()> {
        self.conn
            .execute("DELETE FROM pools WHERE id = ?1", params![id])
            .await
            .map_err(connection_error)?;
        Ok(())
    }

    async fn pools_get(&self, id: &str) -> BrokerResult<PoolEntry> {
        let mut rows = self
            .conn
            .query("SELECT id, uri, weight, group_tag FROM pools WHERE id = ?1", params![id])
            .await
            .map_err(connection_error)?;
        let row = rows
            .next()
            .await
            .map_err(connection_error)?
            .ok_or_else(|| BrokerError::PoolDoesNotExist { id: id.to_string() })?;
        Ok(PoolEntry {
            id: row.get::<String>(0).map_err(connection_error)?,
            uri: row.get::<String>(1).map_err(connection_error)?,
            weight: u32::try_from(row.get::<i64>(2).map_err(connection_error)?).unwrap_or(0),
            group: row.get::<Option<String>>(3).map_err(connection_error)?,
        })
    }

    async fn pools_list(&self) -> BrokerResult<Vec<PoolEntry>> {
        let mut rows = self
            .conn
            .query("SELECT id, uri, weight, group_tag FROM pools ORDER BY id", ())
            .await
            .map_err(connection_error)?;
        let mut pools = Vec::new();
        while let Some(row) = rows.next().await.map_err(connection_error)? {
            pools.push(PoolEntry {
                id: row.get::<String>(0).map_err(connection_error)?,
                uri: row.get::<String>(1).map_err(connection_error)?,
                weight: u32::try_from(row.get::<i64>(2).map_err(connection_error)?).unwrap_or(0),
                group: row.get::<Option<String>>(3).map_err(connection_error)?,
            });
        }
        Ok(pools)
    }
}

/// `now < created_at + ttl`, irrespective of claim state.
fn not_expired_predicate_sql() -> &'static str {
    "(created_at + ttl * 1000000) > ?3"
}

/// §3's visibility invariant: not expired, and either never claimed or its
/// claim has itself expired. Note this does *not* clear `claim_id` on claim
/// expiry — nothing does, so a message can be visible again under this
/// predicate while `claim_id` is still set to a lapsed claim.
fn visible_predicate_sql() -> String {
    format!("{} AND (claim_id IS NULL OR claim_expires_at <= ?3)", not_expired_predicate_sql())
}

fn is_unique_violation(err: &libsql::Error) -> bool {
    err.to_string().to_lowercase().contains("unique")
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_core::traits::{ListParams, NewMessage};

    async fn open_tmp() -> (LibsqlBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broker.db");
        let backend = LibsqlBackend::open(&path).await.expect("open backend");
        (backend, dir)
    }

    #[tokio::test]
    async fn first_marker_assigned_is_two() {
        let (backend, _dir) = open_tmp().await;
        let now = OffsetDateTime::now_utc();
        backend.ensure_queue("proj", "q1", 3600, now).await.unwrap();

        let client_id = Uuid::new_v4();
        let ids = backend
            .insert_messages(
                "proj",
                "q1",
                client_id,
                {
                    let new_counter = backend.inc_counter("proj", "q1", 1, None, now).await.unwrap().unwrap();
                    new_counter
                },
                &[NewMessage {
                    body: serde_json::json!({"k": "v"}),
                    ttl: 200,
                }],
                now,
            )
            .await
            .unwrap();

        let message = backend.get_message("proj", "q1", &ids[0], now).await.unwrap();
        assert_eq!(message.marker, 2);
    }

    #[tokio::test]
    async fn cross_project_get_is_not_found() {
        let (backend, _dir) = open_tmp().await;
        let now = OffsetDateTime::now_utc();
        backend.ensure_queue("proj", "q1", 3600, now).await.unwrap();
        let counter = backend.inc_counter("proj", "q1", 1, None, now).await.unwrap().unwrap();
        let ids = backend
            .insert_messages(
                "proj",
                "q1",
                Uuid::new_v4(),
                counter,
                &[NewMessage { body: serde_json::json!({}), ttl: 200 }],
                now,
            )
            .await
            .unwrap();

        let result = backend.get_message("other-project", "q1", &ids[0], now).await;
        assert!(matches!(result, Err(BrokerError::MessageDoesNotExist { .. })));
    }

    #[tokio::test]
    async fn claim_delete_makes_messages_visible_again() {
        let (backend, _dir) = open_tmp().await;
        let now = OffsetDateTime::now_utc();
        backend.ensure_queue("proj", "q1", 3600, now).await.unwrap();
        let counter = backend.inc_counter("proj", "q1", 5, None, now).await.unwrap().unwrap();
        backend
            .insert_messages(
                "proj",
                "q1",
                Uuid::new_v4(),
                counter - 4,
                &(0..5)
                    .map(|_| NewMessage { body: serde_json::json!({}), ttl: 200 })
                    .collect::<Vec<_>>(),
                now,
            )
            .await
            .unwrap();

        let (claim, messages) = backend.create_claim("proj", "q1", 100, 100, 10, now).await.unwrap();
        assert_eq!(messages.len(), 5);

        backend.delete_claim("proj", "q1", &claim.id, now).await.unwrap();

        let page = backend
            .list_messages(
                "proj",
                "q1",
                Uuid::new_v4(),
                &ListParams {
                    limit: 20,
                    marker: None,
                    echo: true,
                    include_claimed: false,
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 5);
    }

    #[tokio::test]
    async fn expired_claim_behaves_as_missing() {
        let (backend, _dir) = open_tmp().await;
        let now = OffsetDateTime::now_utc();
        backend.ensure_queue("proj", "q1", 3600, now).await.unwrap();
        let counter = backend.inc_counter("proj", "q1", 1, None, now).await.unwrap().unwrap();
        backend
            .insert_messages(
                "proj",
                "q1",
                Uuid::new_v4(),
                counter,
                &[NewMessage { body: serde_json::json!({}), ttl: 200 }],
                now,
            )
            .await
            .unwrap();

        let (claim, _) = backend.create_claim("proj", "q1", 60, 0, 10, now).await.unwrap();

        let later = now + time::Duration::seconds(61);
        let result = backend.get_claim("proj", "q1", &claim.id, later).await;
        assert!(matches!(result, Err(BrokerError::ClaimDoesNotExist { .. })));
    }
}
