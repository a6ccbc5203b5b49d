use std::path::Path;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    relay_protocol::Message,
    sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    tokio::sync::Mutex,
    tracing::{debug, info},
};

use crate::{MessageStore, Result, StoreError};

/// SQLite-backed message store.
pub struct SqliteMessageStore {
    pool: SqlitePool,
    /// Held for the whole insert so `created_at` never goes backwards.
    last_ms: Mutex<i64>,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    sender_id: String,
    recipient_id: String,
    content: String,
    created_at: i64,
}

impl MessageRow {
    fn into_message(self) -> Result<Message> {
        let timestamp = DateTime::<Utc>::from_timestamp_millis(self.created_at).ok_or_else(|| {
            StoreError::CorruptRecord(format!(
                "message {} has out-of-range timestamp {}",
                self.id, self.created_at
            ))
        })?;
        Ok(Message {
            id: self.id,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            content: self.content,
            timestamp,
        })
    }
}

impl SqliteMessageStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!("create {}: {e}", parent.display()))
                })?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self::from_pool(pool).await?;
        info!(path = %path.display(), "message store opened");
        Ok(store)
    }

    /// Wrap an existing pool, creating the schema if missing.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        Self::init(&pool).await?;
        let last: Option<i64> = sqlx::query_scalar("SELECT MAX(created_at) FROM messages")
            .fetch_one(&pool)
            .await?;
        Ok(Self {
            pool,
            last_ms: Mutex::new(last.unwrap_or(0)),
        })
    }

    /// Create the `messages` table and its indexes if they don't exist.
    pub async fn init(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS messages (
                seq          INTEGER PRIMARY KEY AUTOINCREMENT,
                id           TEXT NOT NULL UNIQUE,
                sender_id    TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                content      TEXT NOT NULL,
                created_at   INTEGER NOT NULL
            )"#,
        )
        .execute(pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender_id)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient_id)")
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Shut the pool down. Later calls fail with [`StoreError::Unavailable`].
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append(&self, sender_id: &str, recipient_id: &str, content: &str) -> Result<Message> {
        let mut last = self.last_ms.lock().await;
        let created_at = Utc::now().timestamp_millis().max(*last);
        let id = uuid::Uuid::new_v4().to_string();

        sqlx::query(
            r#"INSERT INTO messages (id, sender_id, recipient_id, content, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(sender_id)
        .bind(recipient_id)
        .bind(content)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        *last = created_at;
        drop(last);

        debug!(message_id = %id, sender_id, recipient_id, "message persisted");
        MessageRow {
            id,
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            content: content.to_string(),
            created_at,
        }
        .into_message()
    }

    async fn query_by_participant(&self, identity_id: &str) -> Result<Vec<Message>> {
        sqlx::query_as::<_, MessageRow>(
            r#"SELECT id, sender_id, recipient_id, content, created_at
               FROM messages
               WHERE sender_id = ? OR recipient_id = ?
               ORDER BY created_at ASC, seq ASC"#,
        )
        .bind(identity_id)
        .bind(identity_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(MessageRow::into_message)
        .collect()
    }
}
