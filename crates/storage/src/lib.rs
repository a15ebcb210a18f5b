use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

use shared::domain::{ConversationSummary, Message, MessageId, ReadState, RoomKey, UserId};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("failed to create parent directory '{path}' for database url '{database_url}': {source}")]
    Directory {
        path: PathBuf,
        database_url: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Local durable cache for messages, conversation summaries and persisted credentials.
///
/// Cloning is cheap; every clone shares the same connection pool.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to `sqlite::memory:` opens a fresh database, so the in-memory
        // cache is pinned to one connection that never expires.
        let pool_options = if is_memory_url(database_url) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(connect_options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_message(&self, message: &Message) -> Result<()> {
        sqlx::query(UPSERT_MESSAGE_SQL)
            .bind(message.id.as_str())
            .bind(message.sender_id.as_str())
            .bind(message.receiver_id.as_str())
            .bind(&message.body)
            .bind(message.created_at.timestamp_millis())
            .bind(message.read_state.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Upserts a batch inside one transaction. Rows are replaced by id.
    pub async fn upsert_messages(&self, messages: &[Message]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for message in messages {
            sqlx::query(UPSERT_MESSAGE_SQL)
                .bind(message.id.as_str())
                .bind(message.sender_id.as_str())
                .bind(message.receiver_id.as_str())
                .bind(&message.body)
                .bind(message.created_at.timestamp_millis())
                .bind(message.read_state.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_message(&self, message_id: &MessageId) -> Result<Option<Message>> {
        let row = sqlx::query(
            "SELECT id, sender_id, receiver_id, body, created_at_ms, read_state
             FROM messages
             WHERE id = ?",
        )
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(message_from_row))
    }

    /// Messages exchanged between `a` and `b`, oldest first. Equal timestamps fall back to id order.
    pub async fn query_conversation(&self, a: &UserId, b: &UserId) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, sender_id, receiver_id, body, created_at_ms, read_state
             FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at_ms ASC, id ASC",
        )
        .bind(a.as_str())
        .bind(b.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    /// Replaces the owner's summary for `summary.partner_id` unless the stored row is newer.
    ///
    /// Returns `false` when the incoming summary lost to a more recent one.
    pub async fn upsert_conversation_summary(
        &self,
        owner_id: &UserId,
        summary: &ConversationSummary,
    ) -> Result<bool> {
        let applied = sqlx::query(
            "INSERT INTO conversation_summaries (
                owner_id, partner_id, room_key, partner_display_name, partner_avatar_url,
                last_message_text, last_message_at_ms, updated_at_ms
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(owner_id, partner_id) DO UPDATE SET
                room_key = excluded.room_key,
                partner_display_name = excluded.partner_display_name,
                partner_avatar_url = excluded.partner_avatar_url,
                last_message_text = excluded.last_message_text,
                last_message_at_ms = excluded.last_message_at_ms,
                updated_at_ms = excluded.updated_at_ms
             WHERE excluded.last_message_at_ms >= conversation_summaries.last_message_at_ms",
        )
        .bind(owner_id.as_str())
        .bind(summary.partner_id.as_str())
        .bind(summary.room_key.as_str())
        .bind(&summary.partner_display_name)
        .bind(summary.partner_avatar_url.as_deref())
        .bind(&summary.last_message_text)
        .bind(summary.last_message_at.timestamp_millis())
        .bind(summary.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(applied > 0)
    }

    /// Bumps the last-message fields of a summary from a locally known message while
    /// keeping any partner display fields already cached. Older activity is ignored.
    pub async fn record_conversation_activity(
        &self,
        owner_id: &UserId,
        message: &Message,
    ) -> Result<bool> {
        let partner_id = message.partner_of(owner_id);
        let room_key = RoomKey::for_pair(owner_id, partner_id);
        let applied = sqlx::query(
            "INSERT INTO conversation_summaries (
                owner_id, partner_id, room_key, partner_display_name, partner_avatar_url,
                last_message_text, last_message_at_ms, updated_at_ms
             ) VALUES (?, ?, ?, ?, NULL, ?, ?, ?)
             ON CONFLICT(owner_id, partner_id) DO UPDATE SET
                last_message_text = excluded.last_message_text,
                last_message_at_ms = excluded.last_message_at_ms,
                updated_at_ms = excluded.updated_at_ms
             WHERE excluded.last_message_at_ms >= conversation_summaries.last_message_at_ms",
        )
        .bind(owner_id.as_str())
        .bind(partner_id.as_str())
        .bind(room_key.as_str())
        .bind(partner_id.as_str())
        .bind(&message.body)
        .bind(message.created_at.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(applied > 0)
    }

    /// One row per partner, most recent first. Equal timestamps are ordered by room key.
    pub async fn query_conversation_summaries(
        &self,
        owner_id: &UserId,
    ) -> Result<Vec<ConversationSummary>> {
        let rows = sqlx::query(
            "SELECT s.room_key, s.partner_id, s.partner_display_name, s.partner_avatar_url,
                    s.last_message_text, s.last_message_at_ms, s.updated_at_ms,
                    (SELECT COUNT(*) FROM messages m
                      WHERE m.sender_id = s.partner_id
                        AND m.receiver_id = s.owner_id
                        AND m.read_state = 'sent') AS unread_count
             FROM conversation_summaries s
             WHERE s.owner_id = ?
             ORDER BY s.last_message_at_ms DESC, s.room_key ASC",
        )
        .bind(owner_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ConversationSummary {
                room_key: RoomKey(r.get::<String, _>("room_key")),
                partner_id: UserId(r.get::<String, _>("partner_id")),
                partner_display_name: r.get::<String, _>("partner_display_name"),
                partner_avatar_url: r.get::<Option<String>, _>("partner_avatar_url"),
                last_message_text: r.get::<String, _>("last_message_text"),
                last_message_at: datetime_from_millis(r.get::<i64, _>("last_message_at_ms")),
                unread_count: u32::try_from(r.get::<i64, _>("unread_count")).unwrap_or(u32::MAX),
                updated_at: datetime_from_millis(r.get::<i64, _>("updated_at_ms")),
            })
            .collect())
    }

    /// Moves every `sent` message from `partner_id` to `current_user_id` into `read`.
    pub async fn mark_read(&self, current_user_id: &UserId, partner_id: &UserId) -> Result<u64> {
        let updated = sqlx::query(
            "UPDATE messages
             SET read_state = 'read'
             WHERE receiver_id = ? AND sender_id = ? AND read_state = 'sent'",
        )
        .bind(current_user_id.as_str())
        .bind(partner_id.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated)
    }

    /// Deletes both directions of the conversation and the matching summaries.
    /// Returns the number of messages removed.
    pub async fn delete_conversation(&self, a: &UserId, b: &UserId) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let messages = sqlx::query(
            "DELETE FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2) OR (sender_id = ?2 AND receiver_id = ?1)",
        )
        .bind(a.as_str())
        .bind(b.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            "DELETE FROM conversation_summaries
             WHERE (owner_id = ?1 AND partner_id = ?2) OR (owner_id = ?2 AND partner_id = ?1)",
        )
        .bind(a.as_str())
        .bind(b.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(messages)
    }

    /// Wipes cached messages and summaries. Credential entries are left alone.
    pub async fn clear_all(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM conversation_summaries")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Applies a set of key-value credential writes atomically. `None` deletes the key.
    pub async fn write_credential_entries(&self, entries: &[(&str, Option<&str>)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for &(key, value) in entries {
            match value {
                Some(value) => {
                    sqlx::query(
                        "INSERT INTO credential_entries (key, value, updated_at)
                         VALUES (?, ?, CURRENT_TIMESTAMP)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
                    )
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
                }
                None => {
                    sqlx::query("DELETE FROM credential_entries WHERE key = ?")
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_credential_entries(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM credential_entries")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>(0), r.get::<String, _>(1)))
            .collect())
    }

    pub async fn clear_credential_entries(&self) -> Result<u64> {
        let removed = sqlx::query("DELETE FROM credential_entries")
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }
}

const UPSERT_MESSAGE_SQL: &str = "INSERT INTO messages (id, sender_id, receiver_id, body, created_at_ms, read_state)
     VALUES (?, ?, ?, ?, ?, ?)
     ON CONFLICT(id) DO UPDATE SET
        sender_id = excluded.sender_id,
        receiver_id = excluded.receiver_id,
        body = excluded.body,
        created_at_ms = excluded.created_at_ms,
        read_state = excluded.read_state";

fn message_from_row(r: &SqliteRow) -> Message {
    Message {
        id: MessageId(r.get::<String, _>(0)),
        sender_id: UserId(r.get::<String, _>(1)),
        receiver_id: UserId(r.get::<String, _>(2)),
        body: r.get::<String, _>(3),
        created_at: datetime_from_millis(r.get::<i64, _>(4)),
        read_state: ReadState::parse(&r.get::<String, _>(5)),
    }
}

pub fn datetime_from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).map_err(|source| StorageError::Directory {
        path: parent.to_path_buf(),
        database_url: database_url.to_string(),
        source,
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
