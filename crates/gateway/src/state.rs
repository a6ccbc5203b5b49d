use std::{collections::HashMap, sync::Arc};

use {
    relay_protocol::ServerFrame,
    relay_store::MessageStore,
    tokio::sync::{Mutex, RwLock, mpsc},
    tracing::warn,
};

use crate::{
    auth::JwtAuth, delivery::DeliveryRouter, history::HistoryService, presence::PresenceRegistry,
};

// ── Connection handle ────────────────────────────────────────────────────────

/// Outbound side of a live connection. Cloning yields another sender onto the
/// same write loop.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: String,
    /// Channel for sending serialized frames to this connection's write loop.
    pub sender: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    pub fn new(conn_id: impl Into<String>, sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            conn_id: conn_id.into(),
            sender,
        }
    }

    /// A handle plus the receiving end its write loop drains.
    pub fn channel(conn_id: &str) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(conn_id, tx), rx)
    }

    /// Send a serialized JSON frame. False once the write loop is gone.
    pub fn send(&self, frame: &str) -> bool {
        self.sender.send(frame.to_string()).is_ok()
    }

    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        match frame.to_json() {
            Ok(json) => self.send(&json),
            Err(e) => {
                warn!(conn_id = %self.conn_id, error = %e, "failed to serialize frame");
                false
            },
        }
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in Arc for use across async tasks.
pub struct GatewayState {
    /// All Active connections keyed by conn_id, including ones whose
    /// identity was since taken over by a newer connection.
    pub clients: RwLock<HashMap<String, ConnectionHandle>>,
    pub presence: Arc<PresenceRegistry>,
    /// Held across snapshot and fan-out so presence frames are queued in the
    /// order their snapshots were taken.
    pub broadcast_lock: Mutex<()>,
    pub router: DeliveryRouter,
    pub history: HistoryService,
    pub auth: JwtAuth,
    /// Server version string.
    pub version: String,
}

impl GatewayState {
    pub fn new(auth: JwtAuth, store: Arc<dyn MessageStore>) -> Arc<Self> {
        let presence = Arc::new(PresenceRegistry::new());
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            broadcast_lock: Mutex::new(()),
            router: DeliveryRouter::new(Arc::clone(&store), Arc::clone(&presence)),
            history: HistoryService::new(store),
            presence,
            auth,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    pub async fn register_client(&self, handle: ConnectionHandle) {
        let conn_id = handle.conn_id.clone();
        self.clients.write().await.insert(conn_id, handle);
    }

    /// Remove a client by conn_id. Returns the removed handle if found.
    pub async fn remove_client(&self, conn_id: &str) -> Option<ConnectionHandle> {
        self.clients.write().await.remove(conn_id)
    }

    /// Number of Active connections.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}
