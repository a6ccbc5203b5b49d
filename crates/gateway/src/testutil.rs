use std::sync::Arc;

use {
    relay_protocol::{Identity, ServerFrame},
    relay_store::SqliteMessageStore,
    tokio::sync::mpsc,
};

use crate::{auth, state::GatewayState};

pub(crate) fn identity(id: &str) -> Identity {
    Identity {
        id: id.into(),
        name: format!("user {id}"),
        email: format!("{id}@example.com"),
    }
}

pub(crate) async fn temp_store() -> (tempfile::TempDir, Arc<SqliteMessageStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteMessageStore::open(&dir.path().join("relay.db"))
        .await
        .unwrap();
    (dir, Arc::new(store))
}

pub(crate) async fn gateway() -> (tempfile::TempDir, Arc<SqliteMessageStore>, Arc<GatewayState>) {
    let (dir, store) = temp_store().await;
    let state = GatewayState::new(auth::tests::gate(), Arc::clone(&store) as _);
    (dir, store, state)
}

/// Decode every frame queued on a connection's write channel.
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<ServerFrame> {
    let mut frames = Vec::new();
    while let Ok(json) = rx.try_recv() {
        frames.push(serde_json::from_str(&json).unwrap());
    }
    frames
}
