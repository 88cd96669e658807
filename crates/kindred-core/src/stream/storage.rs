//! SQLite-backed durable stream implementation.
//!
//! A single database holds the message log, the consumer-group cursors, the
//! pending-entry lists, and the dead-letter list, so acknowledgement and
//! claim updates are transactional with the log itself. WAL mode keeps
//! producer appends and consumer reads from blocking each other.

// SQLite surfaces i64 for rowids and counts; values in these tables are
// always non-negative. Epoch milliseconds fit u64 far beyond any horizon
// this service cares about.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::BoxFuture;

use super::{
    DeadLetter, DeadLetterSink, MessageId, PendingEntry, StreamBackend, StreamError,
    StreamMessage,
};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Interval between polls while a blocking read waits for new messages.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// The durable stream backed by SQLite.
pub struct SqliteStreamBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStreamBackend {
    /// Opens or creates a stream database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory stream for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StreamError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn append_sync(&self, fields: &BTreeMap<String, String>) -> Result<MessageId, StreamError> {
        let conn = self.lock();

        let tail: Option<(u64, u64)> = conn
            .query_row(
                "SELECT ms, seq FROM messages ORDER BY ms DESC, seq DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
            )
            .optional()?;

        // Ids must stay monotonic even if the wall clock steps backwards.
        let now = now_ms();
        let id = match tail {
            Some((last_ms, last_seq)) if now <= last_ms => MessageId {
                ms: last_ms,
                seq: last_seq + 1,
            },
            _ => MessageId { ms: now, seq: 0 },
        };

        let payload = serde_json::to_string(fields)?;
        conn.execute(
            "INSERT INTO messages (ms, seq, fields) VALUES (?1, ?2, ?3)",
            params![id.ms as i64, id.seq as i64, payload],
        )?;

        Ok(id)
    }

    fn create_group_sync(&self, group: &str) -> Result<(), StreamError> {
        let conn = self.lock();

        let exists: Option<String> = conn
            .query_row(
                "SELECT name FROM groups WHERE name = ?1",
                params![group],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StreamError::GroupExists {
                group: group.to_string(),
            });
        }

        // New-messages-only: start the cursor at the current tail.
        let tail: Option<(u64, u64)> = conn
            .query_row(
                "SELECT ms, seq FROM messages ORDER BY ms DESC, seq DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
            )
            .optional()?;
        let (cursor_ms, cursor_seq) = tail.unwrap_or((0, 0));

        conn.execute(
            "INSERT INTO groups (name, cursor_ms, cursor_seq) VALUES (?1, ?2, ?3)",
            params![group, cursor_ms as i64, cursor_seq as i64],
        )?;

        Ok(())
    }

    fn read_group_once(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let cursor: Option<(u64, u64)> = tx
            .query_row(
                "SELECT cursor_ms, cursor_seq FROM groups WHERE name = ?1",
                params![group],
                |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
            )
            .optional()?;
        let Some((cursor_ms, cursor_seq)) = cursor else {
            return Err(StreamError::UnknownGroup {
                group: group.to_string(),
            });
        };

        let messages = {
            let mut stmt = tx.prepare(
                "SELECT ms, seq, fields FROM messages
                 WHERE ms > ?1 OR (ms = ?1 AND seq > ?2)
                 ORDER BY ms ASC, seq ASC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![cursor_ms as i64, cursor_seq as i64, count as i64],
                row_to_message,
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let messages = messages
            .into_iter()
            .map(|(id, fields)| {
                Ok(StreamMessage {
                    id,
                    fields: serde_json::from_str(&fields)?,
                })
            })
            .collect::<Result<Vec<_>, StreamError>>()?;

        if let Some(last) = messages.last() {
            tx.execute(
                "UPDATE groups SET cursor_ms = ?1, cursor_seq = ?2 WHERE name = ?3",
                params![last.id.ms as i64, last.id.seq as i64, group],
            )?;

            let delivered_at = now_ms() as i64;
            for message in &messages {
                tx.execute(
                    "INSERT INTO pending
                         (group_name, ms, seq, consumer, delivered_at_ms, delivery_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                    params![
                        group,
                        message.id.ms as i64,
                        message.id.seq as i64,
                        consumer,
                        delivered_at
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(messages)
    }

    fn pending_sync(&self, group: &str, count: usize) -> Result<Vec<PendingEntry>, StreamError> {
        let conn = self.lock();

        let known: Option<String> = conn
            .query_row(
                "SELECT name FROM groups WHERE name = ?1",
                params![group],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(StreamError::UnknownGroup {
                group: group.to_string(),
            });
        }

        let now = now_ms();
        let mut stmt = conn.prepare(
            "SELECT ms, seq, consumer, delivered_at_ms, delivery_count FROM pending
             WHERE group_name = ?1
             ORDER BY ms ASC, seq ASC
             LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![group, count as i64], |row| {
                let ms = row.get::<_, i64>(0)? as u64;
                let seq = row.get::<_, i64>(1)? as u64;
                let consumer: String = row.get(2)?;
                let delivered_at = row.get::<_, i64>(3)? as u64;
                let delivery_count = row.get::<_, i64>(4)? as u64;
                Ok(PendingEntry {
                    id: MessageId { ms, seq },
                    consumer,
                    idle: Duration::from_millis(now.saturating_sub(delivered_at)),
                    delivery_count,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    fn claim_sync(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[MessageId],
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let now = now_ms();
        let cutoff = now.saturating_sub(min_idle.as_millis() as u64) as i64;

        let mut claimed = Vec::new();
        for id in ids {
            let updated = tx.execute(
                "UPDATE pending
                 SET consumer = ?1, delivered_at_ms = ?2, delivery_count = delivery_count + 1
                 WHERE group_name = ?3 AND ms = ?4 AND seq = ?5 AND delivered_at_ms <= ?6",
                params![
                    consumer,
                    now as i64,
                    group,
                    id.ms as i64,
                    id.seq as i64,
                    cutoff
                ],
            )?;
            if updated == 0 {
                // Not pending anymore, or not idle long enough. Idempotent skip.
                continue;
            }

            let fields: Option<String> = tx
                .query_row(
                    "SELECT fields FROM messages WHERE ms = ?1 AND seq = ?2",
                    params![id.ms as i64, id.seq as i64],
                    |row| row.get(0),
                )
                .optional()?;

            match fields {
                Some(fields) => claimed.push(StreamMessage {
                    id: *id,
                    fields: serde_json::from_str(&fields)?,
                }),
                None => {
                    // Message trimmed out from under its pending entry.
                    tx.execute(
                        "DELETE FROM pending WHERE group_name = ?1 AND ms = ?2 AND seq = ?3",
                        params![group, id.ms as i64, id.seq as i64],
                    )?;
                },
            }
        }

        tx.commit()?;
        Ok(claimed)
    }

    fn ack_sync(&self, group: &str, id: MessageId) -> Result<(), StreamError> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM pending WHERE group_name = ?1 AND ms = ?2 AND seq = ?3",
            params![group, id.ms as i64, id.seq as i64],
        )?;
        Ok(())
    }

    fn trim_before_sync(&self, min_id: MessageId) -> Result<u64, StreamError> {
        let conn = self.lock();
        let trimmed = conn.execute(
            "DELETE FROM messages WHERE ms < ?1 OR (ms = ?1 AND seq < ?2)",
            params![min_id.ms as i64, min_id.seq as i64],
        )?;
        Ok(trimmed as u64)
    }

    fn push_dead_letter_sync(&self, letter: &DeadLetter) -> Result<(), StreamError> {
        let conn = self.lock();
        let envelope = serde_json::to_string(&letter.envelope)?;
        conn.execute(
            "INSERT INTO dead_letters (message_id, envelope, last_error, recorded_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                letter.message_id,
                envelope,
                letter.last_error,
                letter.timestamp.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    /// Returns every dead letter in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>, StreamError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT message_id, envelope, last_error, recorded_at_ms
             FROM dead_letters ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let message_id: String = row.get(0)?;
                let envelope: String = row.get(1)?;
                let last_error: String = row.get(2)?;
                let recorded_at: i64 = row.get(3)?;
                Ok((message_id, envelope, last_error, recorded_at))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(message_id, envelope, last_error, recorded_at)| {
                Ok(DeadLetter {
                    message_id,
                    envelope: serde_json::from_str(&envelope)?,
                    last_error,
                    timestamp: chrono::DateTime::from_timestamp_millis(recorded_at)
                        .unwrap_or_else(Utc::now),
                })
            })
            .collect()
    }

    /// Number of messages currently retained in the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn message_count(&self) -> Result<u64, StreamError> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<(MessageId, String)> {
    let ms = row.get::<_, i64>(0)? as u64;
    let seq = row.get::<_, i64>(1)? as u64;
    let fields: String = row.get(2)?;
    Ok((MessageId { ms, seq }, fields))
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

impl StreamBackend for SqliteStreamBackend {
    fn append<'a>(
        &'a self,
        fields: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<MessageId, StreamError>> {
        Box::pin(async move { self.append_sync(fields) })
    }

    fn create_group<'a>(&'a self, group: &'a str) -> BoxFuture<'a, Result<(), StreamError>> {
        Box::pin(async move { self.create_group_sync(group) })
    }

    fn read_group<'a>(
        &'a self,
        group: &'a str,
        consumer: &'a str,
        count: usize,
        block: Duration,
    ) -> BoxFuture<'a, Result<Vec<StreamMessage>, StreamError>> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + block;
            loop {
                let messages = self.read_group_once(group, consumer, count)?;
                if !messages.is_empty() {
                    return Ok(messages);
                }
                if tokio::time::Instant::now() >= deadline {
                    return Ok(Vec::new());
                }
                tokio::time::sleep(READ_POLL_INTERVAL.min(block)).await;
            }
        })
    }

    fn pending<'a>(
        &'a self,
        group: &'a str,
        count: usize,
    ) -> BoxFuture<'a, Result<Vec<PendingEntry>, StreamError>> {
        Box::pin(async move { self.pending_sync(group, count) })
    }

    fn claim<'a>(
        &'a self,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        ids: &'a [MessageId],
    ) -> BoxFuture<'a, Result<Vec<StreamMessage>, StreamError>> {
        Box::pin(async move { self.claim_sync(group, consumer, min_idle, ids) })
    }

    fn ack<'a>(
        &'a self,
        group: &'a str,
        id: MessageId,
    ) -> BoxFuture<'a, Result<(), StreamError>> {
        Box::pin(async move { self.ack_sync(group, id) })
    }

    fn trim_before<'a>(&'a self, min_id: MessageId) -> BoxFuture<'a, Result<u64, StreamError>> {
        Box::pin(async move { self.trim_before_sync(min_id) })
    }
}

impl DeadLetterSink for SqliteStreamBackend {
    fn push<'a>(&'a self, letter: &'a DeadLetter) -> BoxFuture<'a, Result<(), StreamError>> {
        Box::pin(async move { self.push_dead_letter_sync(letter) })
    }
}
