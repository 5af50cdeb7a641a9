//! WebSocket tunnelling, client side.
//!
//! A proxied upgrade opens two sockets: one to the local origin with the
//! requested subprotocols, and one back to the server's dial-back endpoint
//! carrying the request id. The two are piped until either side closes;
//! response frames are only used when setup fails.

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::client::IntoClientRequest,
    tungstenite::http::HeaderValue,
    tungstenite::protocol::Message as TungsteniteMessage,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use burrow_core::{ClientFrame, RequestId};

use crate::tunnel::Session;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Run one WebSocket tunnel to completion.
pub async fn run_tunnel(
    session: Arc<Session>,
    request_id: RequestId,
    path: String,
    headers: Vec<(String, String)>,
) {
    let (local, upstream) = match open_legs(&session, &request_id, &path, &headers).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!("websocket tunnel setup failed for {}: {:#}", request_id, e);
            let _ = session
                .send_frame(ClientFrame::Header {
                    request_id,
                    status: 502,
                    status_text: "Bad Gateway".to_string(),
                    headers: Vec::new(),
                    eof: true,
                })
                .await;
            return;
        }
    };

    info!("websocket tunnel {} established", request_id);
    pipe(local, upstream).await;
    debug!("websocket tunnel {} closed", request_id);
}

async fn open_legs(
    session: &Arc<Session>,
    request_id: &RequestId,
    path: &str,
    headers: &[(String, String)],
) -> anyhow::Result<(WsStream, WsStream)> {
    // Local leg first: no point dialling back for an origin that refuses.
    let local_url = session.origin.ws_url(path);
    let mut request = local_url.as_str().into_client_request()?;
    let protocols = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("sec-websocket-protocol"))
        .map(|(_, v)| v.clone());
    if let Some(protocols) = protocols {
        request
            .headers_mut()
            .insert("sec-websocket-protocol", HeaderValue::from_str(&protocols)?);
    }
    let (local, _) = connect_async(request).await?;

    let upstream_url = session.config.ws_tunnel_url(request_id)?;
    let (upstream, _) = connect_async(upstream_url.as_str()).await?;

    Ok((local, upstream))
}

/// Pipe two sockets into each other until either side ends.
async fn pipe(local: WsStream, upstream: WsStream) {
    let (local_tx, local_rx) = local.split();
    let (upstream_tx, upstream_rx) = upstream.split();

    let mut to_upstream = tokio::spawn(forward(local_rx, upstream_tx));
    let mut to_local = tokio::spawn(forward(upstream_rx, local_tx));

    tokio::select! {
        _ = &mut to_upstream => to_local.abort(),
        _ = &mut to_local => to_upstream.abort(),
    }
}

async fn forward(
    mut rx: SplitStream<WsStream>,
    mut tx: SplitSink<WsStream, TungsteniteMessage>,
) {
    while let Some(Ok(msg)) = rx.next().await {
        let closing = matches!(msg, TungsteniteMessage::Close(_));
        if tx.send(msg).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
    let _ = tx.close().await;
}
