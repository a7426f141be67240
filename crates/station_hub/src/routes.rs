use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use shared::{
    domain::{ConnectionEpoch, SidebarInfo, StatusSnapshot},
    protocol::DialogPrompt,
};
use sync_core::Link;
use tracing::debug;

use crate::hub::OrchestratorHub;

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    epoch: u64,
}

pub fn build_router(hub: Arc<OrchestratorHub>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/sidebar", get(sidebar))
        .route("/dialog", get(dialog))
        .route("/ws", get(ws_handler))
        .with_state(hub)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(hub): State<Arc<OrchestratorHub>>) -> Json<StatusSnapshot> {
    Json(hub.status_snapshot())
}

async fn sidebar(State(hub): State<Arc<OrchestratorHub>>) -> Json<SidebarInfo> {
    Json(hub.sidebar_info())
}

async fn dialog(State(hub): State<Arc<OrchestratorHub>>) -> Json<Option<DialogPrompt>> {
    Json(hub.pending_dialog().map(|pending| DialogPrompt {
        request_id: pending.request_id,
        request: pending.request,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<OrchestratorHub>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(hub, socket, ConnectionEpoch(q.epoch)))
}

async fn ws_connection(hub: Arc<OrchestratorHub>, socket: WebSocket, epoch: ConnectionEpoch) {
    let (mut sender, mut receiver) = socket.split();
    let (console_end, hub_end) = Link::pair(hub.settings().link_capacity);
    let serve_task = tokio::spawn(Arc::clone(&hub).serve_link(epoch, hub_end));

    let Link {
        outbound,
        mut inbound,
    } = console_end;
    let send_task = tokio::spawn(async move {
        while let Some(text) = inbound.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                if outbound.send(text).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    debug!(%epoch, "websocket console closed");

    drop(outbound);
    let _ = serve_task.await;
    send_task.abort();
}

#[cfg(test)]
#[path = "tests/routes_tests.rs"]
mod tests;
