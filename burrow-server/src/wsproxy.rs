//! WebSocket tunnelling.
//!
//! A proxied WebSocket bypasses the response-frame path: the client dials
//! back on `/__ws__` with the request id, the dispatcher gets the upgraded
//! socket through its rendezvous, and the two sockets are piped until either
//! side closes.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use tracing::{debug, warn};

use burrow_core::{ClientId, RequestId};

use crate::relay::TaskOutcome;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsTunnelQuery {
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
    pub token: Option<String>,
}

/// `GET /__ws__?clientId=…&requestId=…&token=…` — inbound leg of a
/// WebSocket tunnel.
pub async fn ws_tunnel_handler(
    State(app): State<AppState>,
    Query(query): Query<WsTunnelQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(expected) = &app.config.conn_token {
        if query.token.as_deref() != Some(expected.as_str()) {
            warn!("rejected websocket dial-back: bad token");
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }

    let (Some(client_id), Some(request_id)) = (query.client_id, query.request_id) else {
        return (StatusCode::BAD_REQUEST, "Missing clientId or requestId").into_response();
    };
    let request_id = RequestId(request_id);

    if !app.relay.has_task(&request_id) {
        return (StatusCode::NOT_FOUND, "No matching request").into_response();
    }

    ws.on_upgrade(move |socket| async move {
        if let Some(client) = app.registry.get(&ClientId(client_id)) {
            client.untrack_pending(&request_id);
        }
        // Hand the upgraded socket to the waiting dispatcher; if the request
        // resolved meanwhile the socket just drops.
        if !app.relay.resolve(&request_id, TaskOutcome::WebSocket(socket)) {
            debug!("websocket dial-back for unknown request {}", request_id);
        }
    })
    .into_response()
}

/// Pipe two upgraded sockets into each other until either side ends.
pub async fn pipe(public: WebSocket, upstream: WebSocket) {
    let (public_tx, public_rx) = public.split();
    let (upstream_tx, upstream_rx) = upstream.split();

    let mut to_upstream = tokio::spawn(forward(public_rx, upstream_tx));
    let mut to_public = tokio::spawn(forward(upstream_rx, public_tx));

    // Either direction ending tears down the other.
    tokio::select! {
        _ = &mut to_upstream => to_public.abort(),
        _ = &mut to_public => to_upstream.abort(),
    }
}

async fn forward(mut rx: SplitStream<WebSocket>, mut tx: SplitSink<WebSocket, WsMessage>) {
    while let Some(Ok(msg)) = rx.next().await {
        let closing = matches!(msg, WsMessage::Close(_));
        if tx.send(msg).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
    let _ = tx.close().await;
}
