//! API Routes

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info};

use crate::state::AppState;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(dongle_stream))
        .route("/healthz", get(super::health_check))
        .with_state(state)
}

/// Upgrade to the dongle event stream
async fn dongle_stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One subscriber connection: send the current index as a snapshot, then
/// forward every lifecycle event in publish order until the peer goes away.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut source) = socket.split();

    let snapshot = match state.store.list_all().await {
        Ok(dongles) => dongles,
        Err(e) => {
            error!(error = %e, "failed to load dongle snapshot");
            Vec::new()
        }
    };
    match serde_json::to_string(&snapshot) {
        Ok(json) => {
            if sink.send(Message::Text(json)).await.is_err() {
                return;
            }
        }
        Err(e) => {
            error!(error = %e, "failed to serialize snapshot");
            return;
        }
    }

    let (id, mut events) = state.events.subscribe().await;
    info!(subscriber = %id, "websocket subscriber connected");

    let mut forward = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!(error = %e, "failed to serialize event"),
            }
        }
    });

    // Inbound frames are drained only to notice the disconnect
    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => debug!(subscriber = %id, "ignoring client frame"),
            },
            _ = &mut forward => break,
        }
    }

    forward.abort();
    state.events.unsubscribe(&id).await;
    info!(subscriber = %id, "websocket subscriber disconnected");
}
