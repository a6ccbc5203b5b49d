//! Per-connection lifecycle: `Connecting → Authenticated → Active → Closed`.

use std::{fmt, sync::Arc};

use {
    relay_protocol::{ClientFrame, Identity, ServerFrame},
    tracing::{debug, info, warn},
};

use crate::{
    broadcast::broadcast_presence,
    delivery::RecipientOutcome,
    error::RelayError,
    state::{ConnectionHandle, GatewayState},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Logout,
    Disconnect,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Logout => "logout",
            Self::Disconnect => "disconnect",
        })
    }
}

/// What the socket loop should do after an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close(CloseReason),
}

pub struct ConnectionSupervisor {
    gateway: Arc<GatewayState>,
    handle: ConnectionHandle,
    state: ConnectionState,
    identity: Option<Identity>,
}

impl ConnectionSupervisor {
    pub fn new(gateway: Arc<GatewayState>, handle: ConnectionHandle) -> Self {
        Self {
            gateway,
            handle,
            state: ConnectionState::Connecting,
            identity: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn conn_id(&self) -> &str {
        &self.handle.conn_id
    }

    /// Verify the handshake token. A failure closes the connection for good.
    pub fn authenticate(&mut self, token: Option<&str>) -> Result<&Identity, RelayError> {
        if self.state != ConnectionState::Connecting {
            return Err(RelayError::InvalidRequest(
                "connection already past handshake".into(),
            ));
        }
        match self.gateway.auth.authenticate(token) {
            Ok(identity) => {
                debug!(conn_id = %self.handle.conn_id, user_id = %identity.id, "token accepted");
                self.state = ConnectionState::Authenticated;
                Ok(&*self.identity.insert(identity))
            },
            Err(e) => {
                warn!(conn_id = %self.handle.conn_id, reason = e.reason(), "handshake rejected");
                self.state = ConnectionState::Closed;
                Err(e.into())
            },
        }
    }

    /// Register presence and announce the new snapshot to every Active
    /// connection. Returns false unless the connection was Authenticated.
    pub async fn activate(&mut self) -> bool {
        if self.state != ConnectionState::Authenticated {
            return false;
        }
        let Some(identity) = self.identity.clone() else {
            return false;
        };

        let user_id = identity.id.clone();
        if let Some(previous) = self
            .gateway
            .presence
            .register(identity, self.handle.clone())
            .await
        {
            info!(
                user_id = %user_id,
                conn_id = %self.handle.conn_id,
                previous_conn_id = %previous.handle.conn_id,
                "identity reconnected, previous connection superseded"
            );
        }
        self.gateway.register_client(self.handle.clone()).await;
        self.state = ConnectionState::Active;
        info!(user_id = %user_id, conn_id = %self.handle.conn_id, "connection active");

        broadcast_presence(&self.gateway).await;
        true
    }

    pub async fn handle_text(&mut self, text: &str) -> Flow {
        match ClientFrame::parse(text) {
            Ok(frame) => self.handle_event(frame).await,
            Err(e) => {
                self.report(&RelayError::InvalidRequest(e.to_string()));
                Flow::Continue
            },
        }
    }

    pub fn handle_binary(&self) {
        self.report(&RelayError::InvalidRequest(
            "binary frames are not supported".into(),
        ));
    }

    pub async fn handle_event(&mut self, frame: ClientFrame) -> Flow {
        let Some(identity) = self
            .identity
            .as_ref()
            .filter(|_| self.state == ConnectionState::Active)
        else {
            self.report(&RelayError::InvalidRequest("connection is not active".into()));
            return Flow::Continue;
        };

        match frame {
            ClientFrame::RequestHistory => {
                match self.gateway.history.on_connect(&identity.id).await {
                    Ok(messages) => {
                        self.handle
                            .send_frame(&ServerFrame::HistorySnapshot { messages });
                    },
                    Err(e) => self.report(&e),
                }
                Flow::Continue
            },
            ClientFrame::SubmitMessage {
                content,
                recipient_id,
            } => {
                let result = self
                    .gateway
                    .router
                    .submit(identity, &self.handle, &recipient_id, &content)
                    .await;
                match result {
                    Ok(delivery) if delivery.recipient == RecipientOutcome::PushFailed => {
                        self.report(&RelayError::DeliveryBestEffortFailure {
                            message_id: delivery.message.id,
                            recipient_id,
                        });
                    },
                    Ok(_) => {},
                    Err(e) => self.report(&e),
                }
                Flow::Continue
            },
            ClientFrame::Logout => Flow::Close(CloseReason::Logout),
        }
    }

    /// Leave the Active set and re-announce presence. Idempotent.
    pub async fn close(&mut self, reason: CloseReason) {
        let was_active = self.state == ConnectionState::Active;
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        if !was_active {
            return;
        }

        let user_id = self.identity.as_ref().map(|i| i.id.as_str()).unwrap_or("");
        let removed = self
            .gateway
            .presence
            .unregister_if_current(user_id, &self.handle.conn_id)
            .await;
        self.gateway.remove_client(&self.handle.conn_id).await;
        info!(
            user_id,
            conn_id = %self.handle.conn_id,
            %reason,
            superseded = removed.is_none(),
            "connection closed"
        );
        broadcast_presence(&self.gateway).await;
    }

    /// Report an error to this connection only.
    fn report(&self, err: &RelayError) {
        warn!(
            conn_id = %self.handle.conn_id,
            user_id = self.identity.as_ref().map(|i| i.id.as_str()),
            code = err.code(),
            error = %err,
            "request failed"
        );
        self.handle.send_frame(&err.to_frame());
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tokio::sync::mpsc};

    use crate::{
        auth::tests::{SECRET, sign, token},
        testutil::{drain, gateway},
    };

    async fn connect(
        gateway: &Arc<GatewayState>,
        id: &str,
        conn_id: &str,
    ) -> (ConnectionSupervisor, mpsc::UnboundedReceiver<String>) {
        let (handle, rx) = ConnectionHandle::channel(conn_id);
        let mut sup = ConnectionSupervisor::new(Arc::clone(gateway), handle);
        sup.authenticate(Some(&token(id))).unwrap();
        assert!(sup.activate().await);
        (sup, rx)
    }

    fn online(frames: &[ServerFrame]) -> Option<Vec<String>> {
        frames.iter().rev().find_map(|f| match f {
            ServerFrame::PresenceSnapshot { users } => {
                Some(users.iter().map(|u| u.id.clone()).collect())
            },
            _ => None,
        })
    }

    fn errors(frames: &[ServerFrame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| match f {
                ServerFrame::Error { code, .. } => Some(code.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn state_machine_happy_path() {
        let (_dir, _store, gw) = gateway().await;
        let (handle, mut rx) = ConnectionHandle::channel("c1");
        let mut sup = ConnectionSupervisor::new(Arc::clone(&gw), handle);
        assert_eq!(sup.state(), ConnectionState::Connecting);

        assert!(sup.identity().is_none());
        sup.authenticate(Some(&token("1"))).unwrap();
        assert_eq!(sup.state(), ConnectionState::Authenticated);
        assert_eq!(sup.identity().map(|i| i.id.as_str()), Some("1"));

        sup.activate().await;
        assert_eq!(sup.state(), ConnectionState::Active);
        assert_eq!(online(&drain(&mut rx)), Some(vec!["1".to_string()]));

        sup.close(CloseReason::Disconnect).await;
        assert_eq!(sup.state(), ConnectionState::Closed);
        assert_eq!(gw.presence.count().await, 0);
        assert_eq!(gw.client_count().await, 0);
    }

    #[tokio::test]
    async fn rejected_token_never_becomes_active() {
        let (_dir, _store, gw) = gateway().await;
        let (_watcher, mut watcher_rx) = connect(&gw, "9", "c9").await;
        drain(&mut watcher_rx);

        let (handle, _rx) = ConnectionHandle::channel("c1");
        let mut sup = ConnectionSupervisor::new(Arc::clone(&gw), handle);
        let bad = sign("wrong", "1", 3600);
        let err = sup.authenticate(Some(&bad)).unwrap_err();
        assert_eq!(err.code(), "unauthenticated");
        assert_eq!(sup.state(), ConnectionState::Closed);

        assert!(!sup.activate().await);
        assert!(sup.authenticate(Some(&sign(SECRET, "1", 3600))).is_err());
        assert!(drain(&mut watcher_rx).is_empty());
        assert!(gw.presence.lookup("1").await.is_none());
    }

    #[tokio::test]
    async fn join_and_leave_broadcast_to_everyone() {
        let (_dir, _store, gw) = gateway().await;
        let (_a, mut a_rx) = connect(&gw, "1", "ca").await;
        let (mut b, mut b_rx) = connect(&gw, "2", "cb").await;

        assert_eq!(online(&drain(&mut a_rx)), Some(vec!["1".into(), "2".into()]));
        assert_eq!(online(&drain(&mut b_rx)), Some(vec!["1".into(), "2".into()]));

        b.close(CloseReason::Logout).await;
        assert_eq!(online(&drain(&mut a_rx)), Some(vec!["1".into()]));
    }

    #[tokio::test]
    async fn live_message_and_confirmation() {
        let (_dir, _store, gw) = gateway().await;
        let (mut a, mut a_rx) = connect(&gw, "1", "ca").await;
        let (_b, mut b_rx) = connect(&gw, "2", "cb").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        let flow = a
            .handle_text(r#"{"type":"submit_message","content":"hi","recipientId":"2"}"#)
            .await;
        assert_eq!(flow, Flow::Continue);

        let to_b = drain(&mut b_rx);
        let to_a = drain(&mut a_rx);
        let [ServerFrame::MessagePushed { message }] = to_b.as_slice() else {
            panic!("expected push, got {to_b:?}");
        };
        assert_eq!(message.content, "hi");
        assert_eq!(message.sender_id, "1");
        assert_eq!(to_a, to_b);
    }

    #[tokio::test]
    async fn numeric_recipient_id_is_routed_like_a_string() {
        let (_dir, _store, gw) = gateway().await;
        let (mut a, mut a_rx) = connect(&gw, "1", "ca").await;
        let (_b, mut b_rx) = connect(&gw, "2", "cb").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        a.handle_text(r#"{"type":"submit_message","content":"hi","recipientId":2}"#)
            .await;
        let to_b = drain(&mut b_rx);
        let [ServerFrame::MessagePushed { message }] = to_b.as_slice() else {
            panic!("expected push, got {to_b:?}");
        };
        assert_eq!(message.recipient_id, "2");
        assert!(errors(&drain(&mut a_rx)).is_empty());
    }

    #[tokio::test]
    async fn offline_message_shows_up_in_history() {
        let (_dir, _store, gw) = gateway().await;
        let (mut a, _a_rx) = connect(&gw, "1", "ca").await;
        a.handle_text(r#"{"type":"submit_message","content":"later","recipientId":"2"}"#)
            .await;

        let (mut b, mut b_rx) = connect(&gw, "2", "cb").await;
        drain(&mut b_rx);
        b.handle_text(r#"{"type":"request_history"}"#).await;

        let frames = drain(&mut b_rx);
        let [ServerFrame::HistorySnapshot { messages }] = frames.as_slice() else {
            panic!("expected history, got {frames:?}");
        };
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "later");
        assert_eq!(messages[0].recipient_id, "2");
    }

    #[tokio::test]
    async fn errors_go_to_the_originating_connection_only() {
        let (_dir, _store, gw) = gateway().await;
        let (mut a, mut a_rx) = connect(&gw, "1", "ca").await;
        let (_b, mut b_rx) = connect(&gw, "2", "cb").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        a.handle_text(r#"{"type":"submit_message","content":"","recipientId":"2"}"#)
            .await;
        a.handle_text(r#"{"type":"submit_message","content":"hi"}"#)
            .await;
        a.handle_text("not json").await;
        a.handle_text(r#"{"type":"shout"}"#).await;
        a.handle_binary();

        assert_eq!(errors(&drain(&mut a_rx)), vec![
            "invalid_message",
            "invalid_message",
            "invalid_request",
            "invalid_request",
            "invalid_request",
        ]);
        assert!(drain(&mut b_rx).is_empty());
        assert_eq!(a.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn persistence_failure_reports_and_pushes_nothing() {
        let (_dir, store, gw) = gateway().await;
        let (mut a, mut a_rx) = connect(&gw, "1", "ca").await;
        let (_b, mut b_rx) = connect(&gw, "2", "cb").await;
        drain(&mut a_rx);
        drain(&mut b_rx);
        store.close().await;

        a.handle_text(r#"{"type":"submit_message","content":"hi","recipientId":"2"}"#)
            .await;
        assert_eq!(errors(&drain(&mut a_rx)), vec!["persistence_error"]);
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn dead_recipient_yields_delivery_failed_with_message_id() {
        let (_dir, _store, gw) = gateway().await;
        let (mut a, mut a_rx) = connect(&gw, "1", "ca").await;
        let (_b, b_rx) = connect(&gw, "2", "cb").await;
        drop(b_rx);
        drain(&mut a_rx);

        a.handle_text(r#"{"type":"submit_message","content":"hi","recipientId":"2"}"#)
            .await;
        let frames = drain(&mut a_rx);
        let pushed_id = frames.iter().find_map(|f| match f {
            ServerFrame::MessagePushed { message } => Some(message.id.clone()),
            _ => None,
        });
        let failed_id = frames.iter().find_map(|f| match f {
            ServerFrame::Error {
                code, message_id, ..
            } if code == "delivery_failed" => message_id.clone(),
            _ => None,
        });
        assert!(pushed_id.is_some());
        assert_eq!(pushed_id, failed_id);
    }

    #[tokio::test]
    async fn reconnect_replaces_entry_and_old_close_keeps_new_one() {
        let (_dir, _store, gw) = gateway().await;
        let (mut old, _old_rx) = connect(&gw, "1", "c-old").await;
        let (_new, mut new_rx) = connect(&gw, "1", "c-new").await;
        let (mut b, _b_rx) = connect(&gw, "2", "cb").await;

        assert_eq!(gw.presence.count().await, 2);
        assert_eq!(gw.presence.lookup("1").await.unwrap().conn_id, "c-new");

        old.close(CloseReason::Disconnect).await;
        assert_eq!(gw.presence.lookup("1").await.unwrap().conn_id, "c-new");

        drain(&mut new_rx);
        b.handle_text(r#"{"type":"submit_message","content":"yo","recipientId":"1"}"#)
            .await;
        let frames = drain(&mut new_rx);
        assert!(
            frames
                .iter()
                .any(|f| matches!(f, ServerFrame::MessagePushed { .. }))
        );
    }

    #[tokio::test]
    async fn logout_closes() {
        let (_dir, _store, gw) = gateway().await;
        let (mut a, _a_rx) = connect(&gw, "1", "ca").await;
        let flow = a.handle_text(r#"{"type":"logout"}"#).await;
        assert_eq!(flow, Flow::Close(CloseReason::Logout));

        a.close(CloseReason::Logout).await;
        a.close(CloseReason::Disconnect).await;
        assert!(gw.presence.lookup("1").await.is_none());
    }
}
