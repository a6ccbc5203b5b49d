use {
    relay_protocol::ServerFrame,
    tracing::{debug, warn},
};

use crate::state::GatewayState;

/// Send the current presence snapshot to every Active connection.
///
/// The snapshot and the client list are copied first; only the broadcast
/// lock is held while frames are queued, so the last snapshot a connection
/// receives always reflects the latest registry state.
pub async fn broadcast_presence(state: &GatewayState) -> usize {
    let _order = state.broadcast_lock.lock().await;
    let users = state.presence.users().await;
    debug!(
        online = ?users.iter().map(|u| u.id.as_str()).collect::<Vec<_>>(),
        "connected users"
    );

    let json = match (ServerFrame::PresenceSnapshot { users }).to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "failed to serialize presence snapshot");
            return 0;
        },
    };

    let clients: Vec<_> = state.clients.read().await.values().cloned().collect();
    let mut delivered = 0;
    for client in &clients {
        if client.send(&json) {
            delivered += 1;
        } else {
            debug!(conn_id = %client.conn_id, "presence broadcast skipped closed connection");
        }
    }
    delivered
}
