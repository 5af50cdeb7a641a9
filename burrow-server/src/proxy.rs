//! Public entry point: dispatches inbound traffic over the tunnel.
//!
//! Every public request is admitted, assigned to a client by sticky
//! selection, transmitted as frames, and held until the response assembler
//! resolves it or the timeout fires. Request upload and response download
//! run concurrently; bodies of distinct requests interleave freely on the
//! control channel.

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, ConnectInfo, Request, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_bytes::ByteBuf;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

use burrow_core::{RequestId, ServerFrame};

use crate::config::ServerConfig;
use crate::registry::{ClientHandle, Outbound};
use crate::relay::{ResponseHead, TaskOutcome};
use crate::{wsproxy, AppState};

/// How long the dispatcher waits for the first response frame.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// `/*` — proxy a public request to a tunnel client.
pub async fn proxy_handler(
    State(app): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: Option<WebSocketUpgrade>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let ip = caller_ip(request.headers(), remote);

    if !is_authorized(&app.config, request.headers(), request.uri().path()) {
        return text_response(StatusCode::UNAUTHORIZED, "Unauthorized", &method);
    }

    let Some(client) = app.registry.select(&ip) else {
        return text_response(StatusCode::SERVICE_UNAVAILABLE, "No proxy client", &method);
    };

    debug!("{} {} from {} -> client {}", method, path, ip, client.id);

    let headers = assemble_headers(
        request.headers(),
        request.uri(),
        &ip,
        app.config.forward_host,
    );

    // The extractor only yields an upgrade for well-formed WebSocket
    // requests; the explicit header check guards against partial ones.
    let upgrade = if is_websocket_upgrade(request.headers()) {
        ws
    } else {
        None
    };

    let (request_id, task_rx) = app.relay.allocate();
    client.track_pending(request_id.clone());
    let mut guard = InflightGuard::new(app.clone(), client.clone(), request_id.clone());

    let sent = if upgrade.is_some() {
        // WebSocket upgrades carry no body; the client answers by dialling
        // back on /__ws__ instead of sending response frames.
        send_frame(
            &client,
            ServerFrame::Header {
                request_id: request_id.clone(),
                method: method.to_string(),
                path,
                headers,
                eof: true,
            },
        )
        .await
    } else if app.config.buffer_request {
        transmit_buffered(&client, &request_id, &method, path, headers, request).await
    } else {
        transmit_streaming(&client, &request_id, &method, path, headers, request).await
    };

    if !sent {
        guard.cleanup();
        return text_response(StatusCode::BAD_GATEWAY, "Tunnel client unavailable", &method);
    }

    let outcome = match tokio::time::timeout(RESPONSE_TIMEOUT, task_rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => {
            guard.cleanup();
            return text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
                &method,
            );
        }
        Err(_) => {
            guard.cleanup();
            return text_response(StatusCode::GATEWAY_TIMEOUT, "Proxy client timeout", &method);
        }
    };
    guard.disarm();

    match outcome {
        TaskOutcome::Http { head, body } => build_response(head, body),
        TaskOutcome::WebSocket(upstream) => match upgrade {
            Some(upgrade) => upgrade
                .on_upgrade(move |public| wsproxy::pipe(public, upstream))
                .into_response(),
            None => {
                error!("websocket tunnel resolved for plain request {}", request_id);
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway", &method)
            }
        },
    }
}

/// Send the header frame and stream body chunks behind it.
///
/// The pump runs as its own task so transmission overlaps waiting for the
/// response; per-request frame order is preserved because everything goes
/// through the client's outbound queue.
async fn transmit_streaming(
    client: &Arc<ClientHandle>,
    request_id: &RequestId,
    method: &Method,
    path: String,
    headers: Vec<(String, String)>,
    request: Request,
) -> bool {
    let has_body = request_has_body(request.headers());
    let sent = send_frame(
        client,
        ServerFrame::Header {
            request_id: request_id.clone(),
            method: method.to_string(),
            path,
            headers,
            eof: !has_body,
        },
    )
    .await;
    if !sent {
        return false;
    }

    if has_body {
        let tx = client.tx.clone();
        let id = request_id.clone();
        tokio::spawn(pump_request_body(tx, id, request.into_body()));
    }
    true
}

/// Collect the whole body and send one inline `request` frame.
///
/// Disables duplex streaming; only useful for transports that cannot
/// interleave outbound messages cheaply.
async fn transmit_buffered(
    client: &Arc<ClientHandle>,
    request_id: &RequestId,
    method: &Method,
    path: String,
    headers: Vec<(String, String)>,
    request: Request,
) -> bool {
    let body = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("failed to buffer request body for {}: {}", request_id, e);
            return false;
        }
    };
    send_frame(
        client,
        ServerFrame::Request {
            request_id: request_id.clone(),
            method: method.to_string(),
            path,
            headers,
            body: (!body.is_empty()).then(|| ByteBuf::from(body.to_vec())),
        },
    )
    .await
}

async fn pump_request_body(tx: mpsc::Sender<Outbound>, request_id: RequestId, body: Body) {
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(data) => {
                if data.is_empty() {
                    continue;
                }
                let frame = ServerFrame::Body {
                    request_id: request_id.clone(),
                    data: Some(ByteBuf::from(data.to_vec())),
                    eof: false,
                };
                if tx.send(Outbound::Frame(frame)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                // The public caller went away mid-upload.
                debug!("request body stream for {} ended early: {}", request_id, e);
                let _ = tx
                    .send(Outbound::Frame(ServerFrame::Abort { request_id }))
                    .await;
                return;
            }
        }
    }
    let _ = tx
        .send(Outbound::Frame(ServerFrame::Body {
            request_id,
            data: None,
            eof: true,
        }))
        .await;
}

async fn send_frame(client: &Arc<ClientHandle>, frame: ServerFrame) -> bool {
    client.tx.send(Outbound::Frame(frame)).await.is_ok()
}

/// Cleans up dispatcher state when the handler future is dropped before the
/// request resolves, and tells the client to cancel its local work.
struct InflightGuard {
    app: AppState,
    client: Arc<ClientHandle>,
    request_id: RequestId,
    armed: bool,
}

impl InflightGuard {
    fn new(app: AppState, client: Arc<ClientHandle>, request_id: RequestId) -> Self {
        Self {
            app,
            client,
            request_id,
            armed: true,
        }
    }

    /// The request resolved; state was already settled elsewhere.
    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Settle state now, without propagating an abort.
    fn cleanup(&mut self) {
        self.armed = false;
        self.app.relay.remove_task(&self.request_id);
        self.client.untrack_pending(&self.request_id);
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.app.relay.remove_task(&self.request_id);
        self.client.untrack_pending(&self.request_id);
        let _ = self.client.tx.try_send(Outbound::Frame(ServerFrame::Abort {
            request_id: self.request_id.clone(),
        }));
    }
}

/// Bearer admission for public traffic.
///
/// The bypass rule wins even when no token was presented.
pub fn is_authorized(config: &ServerConfig, headers: &HeaderMap, path: &str) -> bool {
    let Some(expected) = &config.auth_token else {
        return true;
    };
    if let Some(rule) = &config.auth_rule {
        if rule.matches(path) {
            return true;
        }
    }
    let presented = headers
        .get("x-auth-token")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });
    presented == Some(expected.as_str())
}

/// The caller's IP: forwarded-for when a fronting proxy set it, otherwise
/// the transport's remote address.
pub fn caller_ip(headers: &HeaderMap, remote: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| remote.ip().to_string())
}

/// Copy the caller's headers and add the forwarding set.
pub fn assemble_headers(
    headers: &HeaderMap,
    uri: &Uri,
    ip: &str,
    forward_host: bool,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();

    let has = |out: &[(String, String)], name: &str| out.iter().any(|(k, _)| k == name);

    if !has(&out, "x-forwarded-for") {
        out.push(("x-forwarded-for".to_string(), ip.to_string()));
    }
    if !has(&out, "x-forwarded-proto") {
        let proto = uri.scheme_str().unwrap_or("http");
        out.push(("x-forwarded-proto".to_string(), proto.to_string()));
    }
    if !forward_host {
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();
        out.retain(|(k, _)| k != "x-forwarded-host");
        out.push(("x-forwarded-host".to_string(), host));
    }
    out
}

fn request_has_body(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        return true;
    }
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|n| n > 0)
        .unwrap_or(false)
}

/// Check for `Upgrade: websocket` plus `Connection: upgrade`.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let has_upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    let has_connection_upgrade = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);

    has_upgrade && has_connection_upgrade
}

fn build_response(head: ResponseHead, body: Option<mpsc::Receiver<Bytes>>) -> Response {
    let status = StatusCode::from_u16(head.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);

    for (key, value) in head.headers {
        // Hop-by-hop headers do not survive re-framing.
        let key_lower = key.to_ascii_lowercase();
        if key_lower == "transfer-encoding" || key_lower == "connection" || key_lower == "keep-alive"
        {
            continue;
        }
        if let Ok(name) = header::HeaderName::try_from(key.as_str()) {
            if let Ok(value) = header::HeaderValue::try_from(value.as_str()) {
                builder = builder.header(name, value);
            }
        }
    }

    let body = match body {
        None => Body::empty(),
        Some(rx) => Body::from_stream(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
        })),
    };

    builder.body(body).unwrap_or_else(|_| {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("Failed to build response"))
            .unwrap()
    })
}

fn text_response(status: StatusCode, message: &str, method: &Method) -> Response {
    let body = if matches!(*method, Method::HEAD | Method::OPTIONS) {
        Body::empty()
    } else {
        Body::from(message.to_string())
    };
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(body)
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("Internal error"))
                .unwrap()
        })
}
