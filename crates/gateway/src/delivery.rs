//! Store-then-push routing of submitted messages.
//!
//! A message reaches a recipient socket only after the store accepted it.
//! Live push is best-effort and at most once; history is the fallback.

use std::sync::Arc;

use {
    relay_protocol::{Identity, Message, ServerFrame},
    relay_store::MessageStore,
    tracing::{info, warn},
};

use crate::{error::RelayError, presence::PresenceRegistry, state::ConnectionHandle};

/// What happened on the recipient side of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientOutcome {
    /// Pushed to the recipient's current connection.
    Pushed,
    /// Recipient not online; the message waits in history.
    Offline,
    /// Recipient was registered but its write loop is gone.
    PushFailed,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub recipient: RecipientOutcome,
}

pub struct DeliveryRouter {
    store: Arc<dyn MessageStore>,
    presence: Arc<PresenceRegistry>,
}

impl DeliveryRouter {
    pub fn new(store: Arc<dyn MessageStore>, presence: Arc<PresenceRegistry>) -> Self {
        Self { store, presence }
    }

    /// Validate, persist, push to the recipient if online, then echo the
    /// stored record back to the sender.
    pub async fn submit(
        &self,
        sender: &Identity,
        sender_handle: &ConnectionHandle,
        recipient_id: &str,
        content: &str,
    ) -> Result<Delivery, RelayError> {
        if content.is_empty() {
            return Err(RelayError::InvalidMessage("content is empty".into()));
        }
        if recipient_id.is_empty() {
            return Err(RelayError::InvalidMessage("recipientId is missing".into()));
        }

        let message = self
            .store
            .append(&sender.id, recipient_id, content)
            .await
            .inspect_err(|e| {
                warn!(
                    user_id = %sender.id,
                    recipient_id,
                    error = %e,
                    "message not persisted, nothing sent"
                );
            })?;

        let frame = ServerFrame::MessagePushed {
            message: message.clone(),
        };

        let recipient = match self.presence.lookup(recipient_id).await {
            // Self-addressed: the echo below already covers this connection.
            Some(handle) if handle.conn_id == sender_handle.conn_id => RecipientOutcome::Pushed,
            Some(handle) => {
                if handle.send_frame(&frame) {
                    info!(
                        message_id = %message.id,
                        conversation = %message.conversation(),
                        "message pushed live"
                    );
                    RecipientOutcome::Pushed
                } else {
                    warn!(
                        message_id = %message.id,
                        recipient_id,
                        conn_id = %handle.conn_id,
                        "live push failed, message kept for history"
                    );
                    RecipientOutcome::PushFailed
                }
            },
            None => {
                info!(
                    message_id = %message.id,
                    conversation = %message.conversation(),
                    "recipient offline, message stored"
                );
                RecipientOutcome::Offline
            },
        };

        if !sender_handle.send_frame(&frame) {
            warn!(
                message_id = %message.id,
                conn_id = %sender_handle.conn_id,
                "sender gone before confirmation"
            );
        }

        Ok(Delivery { message, recipient })
    }
}
