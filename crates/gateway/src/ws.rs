use std::net::SocketAddr;

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, StreamExt},
    tokio::sync::mpsc,
    tracing::debug,
};

use crate::supervisor::{CloseReason, ConnectionSupervisor, Flow};

/// Drive an upgraded, already-authenticated socket until it closes.
///
/// Outbound frames flow through the connection's unbounded channel into a
/// dedicated write task so that pushes from other connections never wait on
/// this socket.
pub async fn handle_connection(
    socket: WebSocket,
    mut supervisor: ConnectionSupervisor,
    mut outbound: mpsc::UnboundedReceiver<String>,
    remote_addr: SocketAddr,
) {
    let conn_id = supervisor.conn_id().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let write_conn_id = conn_id.clone();
    let write_loop = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                debug!(conn_id = %write_conn_id, "socket write failed");
                break;
            }
        }
        ws_tx.close().await.ok();
    });

    debug!(
        conn_id = %conn_id,
        user_id = supervisor.identity().map(|i| i.id.as_str()),
        remote = %remote_addr,
        "websocket upgraded"
    );
    supervisor.activate().await;

    let reason = loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Flow::Close(reason) = supervisor.handle_text(text.as_str()).await {
                    break reason;
                }
            },
            Some(Ok(Message::Binary(_))) => supervisor.handle_binary(),
            Some(Ok(Message::Close(_))) | None => break CloseReason::Disconnect,
            Some(Ok(_)) => {},
            Some(Err(e)) => {
                debug!(conn_id = %conn_id, error = %e, "websocket read error");
                break CloseReason::Disconnect;
            },
        }
    };

    supervisor.close(reason).await;
    // Dropping the supervisor releases the last sender, which ends the write
    // loop after it flushes whatever was queued.
    drop(supervisor);
    write_loop.await.ok();
}
