//! Durable message storage.
//!
//! The store is the only record of relayed messages: once [`MessageStore::append`]
//! returns, the message survives a restart and shows up in history for both
//! participants.

pub mod sqlite;

use {async_trait::async_trait, relay_protocol::Message};

pub use sqlite::SqliteMessageStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                Self::Unavailable(err.to_string())
            },
            other => Self::Database(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Assign an id and server timestamp, persist, and return the stored record.
    async fn append(&self, sender_id: &str, recipient_id: &str, content: &str) -> Result<Message>;

    /// Every message the identity sent or received, oldest first.
    async fn query_by_participant(&self, identity_id: &str) -> Result<Vec<Message>>;
}
