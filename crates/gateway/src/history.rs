use std::sync::Arc;

use {
    relay_protocol::Message,
    relay_store::MessageStore,
    tracing::{debug, warn},
};

use crate::error::RelayError;

/// Read-only access to a participant's full conversation history.
pub struct HistoryService {
    store: Arc<dyn MessageStore>,
}

impl HistoryService {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// All messages the identity sent or received, oldest first.
    pub async fn on_connect(&self, identity_id: &str) -> Result<Vec<Message>, RelayError> {
        match self.store.query_by_participant(identity_id).await {
            Ok(messages) => {
                debug!(user_id = identity_id, count = messages.len(), "history loaded");
                Ok(messages)
            },
            Err(e) => {
                warn!(user_id = identity_id, error = %e, "history query failed");
                Err(e.into())
            },
        }
    }
}
