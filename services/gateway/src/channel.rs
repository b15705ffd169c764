//! WebSocket channel endpoint
//!
//! Each backend session connects to GET /api/channel?index=N and keeps
//! one long-lived socket. The reader task is the only consumer of
//! inbound frames; everything it can parse goes through the registry's
//! demultiplexer. The writer task drains an unbounded outbound mailbox
//! so senders never block on the socket.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use driver::ChannelEvent;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::handler::AppState;
use crate::registry::Registry;

#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    pub index: usize,
}

pub async fn channel_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ChannelQuery>,
    State(state): State<AppState>,
) -> Response {
    let registry = Arc::clone(&state.registry);
    ws.on_upgrade(move |socket| run_channel(socket, query.index, registry))
}

async fn run_channel(socket: WebSocket, index: usize, registry: Arc<Registry>) {
    info!(index, "channel socket upgraded");
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    registry.register(index, tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut deliberate = false;
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match ChannelEvent::parse(text.as_str()) {
                Some(event) => registry.route(event),
                None => debug!(index, "ignoring unparseable channel frame"),
            },
            Ok(WsMessage::Close(_)) => {
                deliberate = true;
                break;
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => {}
            Ok(WsMessage::Binary(_)) => {
                debug!(index, "ignoring binary channel frame");
            }
            Err(e) => {
                warn!(index, error = %e, "channel socket error");
                break;
            }
        }
    }

    writer.abort();
    // Keyed by sender so a reader outliving its replacement cannot
    // tear the fresh connection down.
    registry.handle_disconnect(index, &tx, deliberate);
}
