//! WebSocket streaming of execution events
//!
//! Each connection gets its own bus subscription, either for every task or filtered to
//! one. A subscriber that falls behind receives a `resync` message carrying the number
//! of dropped events and should refetch `/api/executions` before trusting the stream.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use crate::executions::{Received, Subscription};
use crate::services::Services;

#[derive(Serialize)]
struct Resync {
    #[serde(rename = "type")]
    kind: &'static str,
    dropped: u64,
}

/// All execution events
pub async fn execution_stream(
    State(services): State<Arc<Services>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let subscription = services.engine.bus().subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, subscription))
}

/// Events of a single task
pub async fn task_execution_stream(
    State(services): State<Arc<Services>>,
    Path(task_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let subscription = services.engine.bus().subscribe_task(&task_id);
    ws.on_upgrade(move |socket| forward_events(socket, subscription))
}

async fn forward_events(socket: WebSocket, mut subscription: Subscription) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            received = subscription.recv() => {
                let json = match received {
                    Received::Event(event) => serde_json::to_string(&event),
                    Received::Lagged(dropped) => {
                        warn!(dropped, "websocket subscriber lagged");
                        serde_json::to_string(&Resync { kind: "resync", dropped })
                    }
                    Received::Closed => break,
                };
                let json = match json {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to encode execution event");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
    debug!("websocket stream closed");
}
