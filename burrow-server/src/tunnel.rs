//! Control-channel endpoint and response assembly.
//!
//! Each tunnel client holds one WebSocket to `/__connect__`. Binary messages
//! carry response frames which are folded into the per-request state here;
//! text messages carry the ping/pong liveness exchange.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use burrow_core::{ClientFrame, ClientId, PING, PONG};

use crate::registry::{ClientHandle, Outbound};
use crate::relay::{RelayState, ResponseHead, TaskOutcome};
use crate::AppState;

/// Outbound frames queued per client before senders start blocking.
const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
    pub token: Option<String>,
}

/// `GET /__connect__?clientId=…&token=…` — open a tunnel.
pub async fn connect_handler(
    State(app): State<AppState>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let client_id = match query.client_id {
        Some(id) if !id.is_empty() => id,
        _ => return (StatusCode::BAD_REQUEST, "Missing clientId").into_response(),
    };

    if let Some(expected) = &app.config.conn_token {
        if query.token.as_deref() != Some(expected.as_str()) {
            warn!("rejected tunnel connection for {}: bad token", client_id);
            return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_control_connection(socket, app, ClientId(client_id)))
}

async fn handle_control_connection(socket: WebSocket, app: AppState, client_id: ClientId) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);

    let handle = Arc::new(ClientHandle::new(client_id.clone(), tx));
    if let Some(displaced) = app.registry.bind(handle.clone()) {
        info!("client {} reconnected over a live record", client_id);
        displaced.fail_inflight(&app.relay);
    }
    info!("client {} connected", client_id);

    // Single writer task: every producer goes through the queue, so frames
    // never interleave on the socket.
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let msg = match out {
                Outbound::Frame(frame) => match frame.to_bytes() {
                    Ok(bytes) => WsMessage::Binary(bytes),
                    Err(e) => {
                        warn!("failed to encode frame: {}", e);
                        continue;
                    }
                },
                Outbound::Text(text) => WsMessage::Text(text),
            };
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(WsMessage::Binary(data)) => match ClientFrame::from_bytes(&data) {
                Ok(frame) => handle_client_frame(&app.relay, &handle, frame).await,
                Err(e) => {
                    debug!("dropping undecodable frame from {}: {}", client_id, e);
                }
            },
            Ok(WsMessage::Text(text)) => {
                if text == PING {
                    let _ = handle.tx.send(Outbound::Text(PONG.to_string())).await;
                }
                // Unknown text messages are ignored.
            }
            Ok(WsMessage::Close(_)) => {
                info!("client {} closed the control channel", client_id);
                break;
            }
            Err(e) => {
                debug!("control channel error for {}: {}", client_id, e);
                break;
            }
            _ => {}
        }
    }

    writer.abort();
    app.registry.tombstone(&handle);
    handle.fail_inflight(&app.relay);
    info!("client {} disconnected", client_id);
}

/// Fold one response frame into the per-request state.
///
/// Frames for unknown request ids are dropped: the request timed out, was
/// aborted, or belonged to a displaced record.
pub async fn handle_client_frame(relay: &RelayState, client: &ClientHandle, frame: ClientFrame) {
    match frame {
        ClientFrame::Header {
            request_id,
            status,
            status_text,
            headers,
            eof,
        } => {
            client.untrack_pending(&request_id);
            let head = ResponseHead {
                status,
                status_text,
                headers,
            };
            if eof {
                if !relay.resolve(&request_id, TaskOutcome::Http { head, body: None }) {
                    debug!("response header for unknown request {}", request_id);
                }
            } else {
                let body_rx = relay.open_writer(&request_id);
                client.track_active(request_id.clone());
                let resolved = relay.resolve(
                    &request_id,
                    TaskOutcome::Http {
                        head,
                        body: Some(body_rx),
                    },
                );
                if !resolved {
                    debug!("response header for unknown request {}", request_id);
                    relay.close_writer(&request_id);
                    client.untrack_active(&request_id);
                }
            }
        }
        ClientFrame::Body {
            request_id,
            data,
            eof,
        } => {
            let Some(writer) = relay.writer(&request_id) else {
                debug!("response body for unknown request {}", request_id);
                return;
            };
            if let Some(data) = data {
                if !data.is_empty() && writer.send(Bytes::from(data.into_vec())).await.is_err() {
                    // Reader went away; stop accepting chunks for this id.
                    relay.close_writer(&request_id);
                    client.untrack_active(&request_id);
                    return;
                }
            }
            if eof {
                relay.close_writer(&request_id);
                client.untrack_active(&request_id);
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PingQuery {
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PingReply {
    pub ok: bool,
    pub code: u16,
    pub message: String,
}

/// `GET /__ping__?clientId=…` — does the server still know this client?
///
/// Clients probe this after a pong to detect a server that was redeployed
/// and lost their slot; `ok:false, code:404` tells them to reconnect.
pub async fn ping_handler(
    State(app): State<AppState>,
    Query(query): Query<PingQuery>,
) -> Json<PingReply> {
    let reply = match query.client_id {
        None => PingReply {
            ok: false,
            code: 400,
            message: "missing clientId".to_string(),
        },
        Some(id) => {
            if app.registry.get(&ClientId(id)).is_some() {
                PingReply {
                    ok: true,
                    code: 200,
                    message: "ok".to_string(),
                }
            } else {
                PingReply {
                    ok: false,
                    code: 404,
                    message: "unknown client".to_string(),
                }
            }
        }
    };
    Json(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::RequestId;
    use serde_bytes::ByteBuf;

    fn client() -> ClientHandle {
        let (tx, _rx) = mpsc::channel(8);
        ClientHandle::new(ClientId::from("c1"), tx)
    }

    fn header_frame(id: &RequestId, eof: bool) -> ClientFrame {
        ClientFrame::Header {
            request_id: id.clone(),
            status: 200,
            status_text: "OK".to_string(),
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            eof,
        }
    }

    #[tokio::test]
    async fn test_bodyless_header_resolves_task() {
        let relay = RelayState::new();
        let client = client();
        let (id, rx) = relay.allocate();
        client.track_pending(id.clone());

        handle_client_frame(&relay, &client, header_frame(&id, true)).await;

        match rx.await.unwrap() {
            TaskOutcome::Http { head, body } => {
                assert_eq!(head.status, 200);
                assert!(body.is_none());
            }
            TaskOutcome::WebSocket(_) => panic!("expected http outcome"),
        }
    }

    #[tokio::test]
    async fn test_streamed_response_delivers_chunks_in_order() {
        let relay = RelayState::new();
        let client = client();
        let (id, rx) = relay.allocate();
        client.track_pending(id.clone());

        handle_client_frame(&relay, &client, header_frame(&id, false)).await;
        let mut body = match rx.await.unwrap() {
            TaskOutcome::Http { body, .. } => body.expect("streaming body"),
            TaskOutcome::WebSocket(_) => panic!("expected http outcome"),
        };

        for chunk in [&b"AB"[..], &b"CD"[..]] {
            handle_client_frame(
                &relay,
                &client,
                ClientFrame::Body {
                    request_id: id.clone(),
                    data: Some(ByteBuf::from(chunk.to_vec())),
                    eof: false,
                },
            )
            .await;
        }
        handle_client_frame(
            &relay,
            &client,
            ClientFrame::Body {
                request_id: id.clone(),
                data: None,
                eof: true,
            },
        )
        .await;

        assert_eq!(body.recv().await.unwrap(), Bytes::from_static(b"AB"));
        assert_eq!(body.recv().await.unwrap(), Bytes::from_static(b"CD"));
        assert!(body.recv().await.is_none());
        assert!(relay.writer(&id).is_none());
    }

    #[test]
    fn test_ping_reply_wire_shape() {
        let reply = PingReply {
            ok: false,
            code: 404,
            message: "unknown client".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&reply).unwrap(),
            r#"{"ok":false,"code":404,"message":"unknown client"}"#
        );
    }

    #[tokio::test]
    async fn test_frames_for_unknown_requests_are_dropped() {
        let relay = RelayState::new();
        let client = client();
        let id = RequestId::from("gone");

        // Neither frame may leave residue behind.
        handle_client_frame(&relay, &client, header_frame(&id, false)).await;
        assert!(relay.writer(&id).is_none());

        handle_client_frame(
            &relay,
            &client,
            ClientFrame::Body {
                request_id: id.clone(),
                data: Some(ByteBuf::from(b"late".to_vec())),
                eof: true,
            },
        )
        .await;
        assert!(relay.writer(&id).is_none());
    }
}
